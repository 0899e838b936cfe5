//! Pending-work records: the durable unit of registration recovery.
//!
//! A record is written when the payment-first flow has captured a payment but
//! could not finish provisioning the account (or linking its subscription).
//! The reconciliation worker drives it to `Completed` or `Failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingWorkId(pub Uuid);

impl PendingWorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PendingWorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PendingWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PendingWorkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Which half of the registration is still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    /// Payment and subscription exist at the provider; the account does not.
    AwaitingAccountCreation,
    /// Payment captured but the subscription was never linked to an account.
    AwaitingSubscriptionLink,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::AwaitingAccountCreation => "awaiting_account_creation",
            PendingKind::AwaitingSubscriptionLink => "awaiting_subscription_link",
        }
    }
}

impl fmt::Display for PendingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_account_creation" => Ok(PendingKind::AwaitingAccountCreation),
            "awaiting_subscription_link" => Ok(PendingKind::AwaitingSubscriptionLink),
            other => Err(ParseEnumError::new("pending kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Pending,
    /// Claimed by a worker. Short-lived; stale claims are reclaimed.
    Processing,
    Completed,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Processing => "processing",
            PendingStatus::Completed => "completed",
            PendingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingStatus::Completed | PendingStatus::Failed)
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PendingStatus::Pending),
            "processing" => Ok(PendingStatus::Processing),
            "completed" => Ok(PendingStatus::Completed),
            "failed" => Ok(PendingStatus::Failed),
            other => Err(ParseEnumError::new("pending status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}

/// Everything needed to create the member's account.
///
/// The reconciliation state machine never looks inside this; only the
/// provisioner does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub email: String,
    pub display_name: String,
    /// National taxpayer id (CPF), digits only or formatted.
    pub national_id: String,
    pub phone: String,
    #[serde(default)]
    pub address: serde_json::Value,
    pub member_type: String,
    /// Already-hashed credential material; never logged.
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionContext {
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue_split: Option<serde_json::Value>,
}

/// A record as handed over by the registration flow, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPendingWork {
    pub kind: PendingKind,
    pub payment_id: String,
    #[serde(default)]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub external_subscription_id: Option<String>,
    pub user_payload: UserPayload,
    #[serde(default)]
    pub subscription_context: SubscriptionContext,
}

impl NewPendingWork {
    /// Minimal shape checks applied at enqueue time.
    pub fn validate(&self) -> Result<(), String> {
        if self.payment_id.trim().is_empty() {
            return Err("payment_id must not be empty".to_string());
        }
        if self.user_payload.email.trim().is_empty() {
            return Err("user_payload.email must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWork {
    pub id: PendingWorkId,
    pub kind: PendingKind,
    pub payment_id: String,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub user_payload: UserPayload,
    pub subscription_context: SubscriptionContext,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingWork {
    /// Build a fresh `Pending` record from an enqueue request.
    pub fn from_new(id: PendingWorkId, new: NewPendingWork, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new.kind,
            payment_id: new.payment_id,
            external_customer_id: new.external_customer_id,
            external_subscription_id: new.external_subscription_id,
            user_payload: new.user_payload,
            subscription_context: new.subscription_context,
            attempts: 0,
            last_error: None,
            status: PendingStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Counters for the operator dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub awaiting_account_creation: u64,
    pub awaiting_subscription_link: u64,
    pub total_attempts: u64,
    /// completed / (completed + failed), as a percentage with two decimals.
    pub success_rate: f64,
}

impl PendingStats {
    pub fn compute_success_rate(completed: u64, failed: u64) -> f64 {
        let processed = completed + failed;
        if processed == 0 {
            return 0.0;
        }
        let rate = completed as f64 / processed as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}
