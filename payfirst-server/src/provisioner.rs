//! Account provisioning for reconciled payments.
//!
//! Provisioning is idempotent by payment id (with email as the secondary
//! key): running it twice for the same record converges on one account with
//! the same profile, one subscription link and at most one commission.

use std::sync::Arc;

use anyhow::Context;
use payfirst_core::{PendingWork, UserPayload};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;
use tracing::{info, warn};

use crate::gateway::PaymentGateway;
use crate::repository::{
    AccountDirectory, AccountId, AccountProfile, NewCommission, RepositoryError,
};

/// Commission rate applied when the affiliate has none configured.
pub const DEFAULT_COMMISSION_PERCENTAGE: Decimal = Decimal::TEN;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The registration data can never produce an account.
    #[error("invalid registration data: {0}")]
    ValidationFailed(String),

    /// The account store is unreachable or failing; retry later.
    #[error("account store unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl ProvisionError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProvisionError::ValidationFailed(_))
    }
}

impl From<RepositoryError> for ProvisionError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::InvalidRecord(msg) => ProvisionError::ValidationFailed(msg),
            other => ProvisionError::UpstreamUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub account_id: AccountId,
    /// False when an existing account was updated instead.
    pub created: bool,
}

pub struct AccountProvisioner {
    accounts: Arc<dyn AccountDirectory>,
    gateway: Arc<dyn PaymentGateway>,
}

impl AccountProvisioner {
    pub fn new(accounts: Arc<dyn AccountDirectory>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { accounts, gateway }
    }

    pub async fn provision(&self, work: &PendingWork) -> Result<ProvisionOutcome, ProvisionError> {
        validate_payload(&work.user_payload)?;
        let profile = profile_for(work);

        let existing = match self.accounts.find_account_by_payment(&work.payment_id).await? {
            Some(account) => Some(account),
            None => self.accounts.find_account_by_email(&profile.email).await?,
        };

        let outcome = match existing {
            Some(account) => {
                info!(
                    payment_id = %work.payment_id,
                    account_id = %account.id,
                    "Account already exists, updating profile"
                );
                self.accounts.update_profile(&account.id, &profile).await?;
                ProvisionOutcome {
                    account_id: account.id,
                    created: false,
                }
            }
            None => match self.accounts.create_account(&profile).await {
                Ok(account) => ProvisionOutcome {
                    account_id: account.id,
                    created: true,
                },
                // Lost a race with another worker: the account now exists.
                Err(RepositoryError::Conflict { existing, .. }) => {
                    let account_id = AccountId(existing);
                    info!(
                        payment_id = %work.payment_id,
                        account_id = %account_id,
                        "Account created concurrently, converging"
                    );
                    self.accounts.update_profile(&account_id, &profile).await?;
                    ProvisionOutcome {
                        account_id,
                        created: false,
                    }
                }
                Err(e) => return Err(e.into()),
            },
        };

        if let Some(subscription_id) = work.external_subscription_id.as_deref() {
            self.accounts
                .link_subscription(&outcome.account_id, subscription_id, &work.payment_id)
                .await?;
        }

        self.record_commission(work, &outcome.account_id).await;

        Ok(outcome)
    }

    /// Best-effort: any failure is logged and swallowed.
    async fn record_commission(&self, work: &PendingWork, account_id: &AccountId) {
        let Some(reference) = work
            .subscription_context
            .affiliate_id
            .as_deref()
            .filter(|r| !r.trim().is_empty())
        else {
            return;
        };

        if let Err(e) = self.try_record_commission(work, account_id, reference).await {
            warn!(
                payment_id = %work.payment_id,
                affiliate = reference,
                "Failed to record affiliate commission: {:#}",
                e
            );
        }
    }

    async fn try_record_commission(
        &self,
        work: &PendingWork,
        account_id: &AccountId,
        reference: &str,
    ) -> anyhow::Result<()> {
        let Some(affiliate) = self
            .accounts
            .find_affiliate(reference)
            .await
            .context("Failed to look up affiliate")?
        else {
            warn!(affiliate = reference, "Unknown affiliate, skipping commission");
            return Ok(());
        };

        let value = self
            .gateway
            .get_payment_value(&work.payment_id)
            .await
            .context("Failed to fetch payment value")?;
        let percentage = affiliate
            .commission_percentage
            .unwrap_or(DEFAULT_COMMISSION_PERCENTAGE);

        let inserted = self
            .accounts
            .record_commission(&NewCommission {
                affiliate_id: affiliate.id.clone(),
                account_id: account_id.clone(),
                payment_id: work.payment_id.clone(),
                amount: commission_amount(value, percentage),
                percentage,
            })
            .await
            .context("Failed to store commission")?;

        if inserted {
            info!(
                payment_id = %work.payment_id,
                affiliate_id = %affiliate.id,
                "Recorded affiliate commission"
            );
        }
        Ok(())
    }
}

/// `value * percentage / 100`, rounded to cents.
pub fn commission_amount(value: Decimal, percentage: Decimal) -> Decimal {
    (value * percentage / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn validate_payload(payload: &UserPayload) -> Result<(), ProvisionError> {
    let email = payload.email.trim();
    let valid_email = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
                && !domain.ends_with('.') && !domain.contains('@')
        }
        None => false,
    };
    if !valid_email {
        return Err(ProvisionError::ValidationFailed(format!(
            "malformed email {email:?}"
        )));
    }
    if payload.display_name.trim().is_empty() {
        return Err(ProvisionError::ValidationFailed(
            "display name is empty".to_string(),
        ));
    }
    let digits = payload
        .national_id
        .chars()
        .filter(|c| c.is_ascii_digit())
        .count();
    if digits != 11 {
        return Err(ProvisionError::ValidationFailed(format!(
            "national id must have 11 digits, found {digits}"
        )));
    }
    if payload.member_type.trim().is_empty() {
        return Err(ProvisionError::ValidationFailed(
            "member type is empty".to_string(),
        ));
    }
    Ok(())
}

fn profile_for(work: &PendingWork) -> AccountProfile {
    let payload = &work.user_payload;
    AccountProfile {
        email: payload.email.trim().to_lowercase(),
        credential: payload.credential.clone(),
        payment_id: work.payment_id.clone(),
        display_name: payload.display_name.trim().to_string(),
        national_id: payload
            .national_id
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect(),
        phone: payload.phone.clone(),
        address: payload.address.clone(),
        member_type: payload.member_type.clone(),
        external_customer_id: work.external_customer_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{Affiliate, InMemoryRepository};
    use crate::test_support::{new_work, FakeGateway};
    use chrono::Utc;
    use payfirst_core::{PaymentStatus, PendingWorkId};

    fn work(payment_id: &str) -> PendingWork {
        PendingWork::from_new(PendingWorkId::new(), new_work(payment_id), Utc::now())
    }

    fn setup(value: Decimal) -> (Arc<InMemoryRepository>, AccountProvisioner) {
        let repo = Arc::new(InMemoryRepository::new());
        let gateway = Arc::new(FakeGateway::with_payment(
            "pay_1",
            PaymentStatus::Confirmed,
            value,
        ));
        let provisioner = AccountProvisioner::new(repo.clone(), gateway);
        (repo, provisioner)
    }

    #[test]
    fn test_commission_amount() {
        assert_eq!(
            commission_amount(Decimal::new(4990, 2), DEFAULT_COMMISSION_PERCENTAGE),
            Decimal::new(499, 2)
        );
        assert_eq!(
            commission_amount(Decimal::new(3333, 2), Decimal::new(15, 0)),
            Decimal::new(500, 2)
        );
    }

    #[test]
    fn test_validation_rejects_bad_payloads() {
        let mut payload = new_work("pay_1").user_payload;
        assert!(validate_payload(&payload).is_ok());

        payload.email = "ana.example.com".to_string();
        assert!(validate_payload(&payload).is_err());

        let mut payload = new_work("pay_1").user_payload;
        payload.national_id = "123".to_string();
        let err = validate_payload(&payload).unwrap_err();
        assert!(err.is_permanent());

        let mut payload = new_work("pay_1").user_payload;
        payload.display_name = "   ".to_string();
        assert!(validate_payload(&payload).is_err());
    }

    #[tokio::test]
    async fn test_provision_creates_then_converges() {
        let (repo, provisioner) = setup(Decimal::new(4990, 2));
        let record = work("pay_1");

        let first = provisioner.provision(&record).await.unwrap();
        assert!(first.created);
        let second = provisioner.provision(&record).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.account_id, second.account_id);

        let account = repo.find_account_by_payment("pay_1").await.unwrap().unwrap();
        assert_eq!(account.national_id, "12345678901");
        assert_eq!(account.external_subscription_id.as_deref(), Some("sub_pay_1"));
        assert_eq!(account.status, "active");
    }

    #[tokio::test]
    async fn test_existing_email_is_updated_not_duplicated() {
        let (repo, provisioner) = setup(Decimal::new(4990, 2));
        let mut earlier = work("pay_0");
        earlier.user_payload.email = "pay_1@example.com".to_string();
        earlier.external_subscription_id = None;
        let original = provisioner.provision(&earlier).await.unwrap();

        let outcome = provisioner.provision(&work("pay_1")).await.unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.account_id, original.account_id);

        let account = repo.find_account_by_email("pay_1@example.com").await.unwrap().unwrap();
        assert_eq!(account.payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn test_commission_recorded_once_with_default_rate() {
        let (repo, provisioner) = setup(Decimal::new(4990, 2));
        repo.upsert_affiliate(&Affiliate {
            id: "aff_1".to_string(),
            code: "IGREJA".to_string(),
            commission_percentage: None,
        })
        .await
        .unwrap();

        let mut record = work("pay_1");
        record.subscription_context.affiliate_id = Some("IGREJA".to_string());
        provisioner.provision(&record).await.unwrap();
        provisioner.provision(&record).await.unwrap();

        assert_eq!(repo.count_commissions("pay_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commission_failure_does_not_fail_provisioning() {
        let repo = Arc::new(InMemoryRepository::new());
        // No payment registered: value lookups fail.
        let provisioner = AccountProvisioner::new(repo.clone(), Arc::new(FakeGateway::default()));
        repo.upsert_affiliate(&Affiliate {
            id: "aff_1".to_string(),
            code: "IGREJA".to_string(),
            commission_percentage: Some(Decimal::new(20, 0)),
        })
        .await
        .unwrap();

        let mut record = work("pay_1");
        record.subscription_context.affiliate_id = Some("aff_1".to_string());
        let outcome = provisioner.provision(&record).await.unwrap();
        assert!(outcome.created);
        assert_eq!(repo.count_commissions("pay_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_affiliate_is_ignored() {
        let (repo, provisioner) = setup(Decimal::new(4990, 2));
        let mut record = work("pay_1");
        record.subscription_context.affiliate_id = Some("nobody".to_string());
        assert!(provisioner.provision(&record).await.is_ok());
        assert_eq!(repo.count_commissions("pay_1").await.unwrap(), 0);
    }
}
