//! In-memory implementation of the repository traits.
//!
//! All state is held in memory and lost on restart. Used by tests and local
//! development; claim exclusivity holds within one process only.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payfirst_core::{
    NewPendingWork, PendingKind, PendingStats, PendingStatus, PendingWork, PendingWorkId,
    RolloutChange, RolloutFlag,
};
use tokio::sync::RwLock;

use super::{
    stale_cutoff, Account, AccountDirectory, AccountId, AccountProfile, Affiliate, FlagRepository,
    NewCommission, PendingWorkStore, RepositoryError, StaleRecovery, REGISTRATION_FLOW_VERSION,
};

/// A queued record plus its insertion sequence, used to break `created_at` ties.
struct QueuedWork {
    seq: u64,
    work: PendingWork,
    /// Set by `begin_manual`, cleared by the next transition.
    manual: bool,
}

impl QueuedWork {
    /// Stale claims that recovery must send back to `Failed` instead of
    /// handing to the sweep.
    fn belongs_in_failed(&self, max_attempts: u32) -> bool {
        self.manual || self.work.attempts >= max_attempts
    }
}

#[derive(Default)]
struct PendingQueue {
    next_seq: u64,
    records: HashMap<PendingWorkId, QueuedWork>,
}

impl PendingQueue {
    fn sorted<'a>(&'a self, filter: impl Fn(&PendingWork) -> bool) -> Vec<&'a QueuedWork> {
        let mut out: Vec<&QueuedWork> = self.records.values().filter(|q| filter(&q.work)).collect();
        out.sort_by_key(|q| (q.work.created_at, q.seq));
        out
    }

    /// Move stale `Processing` records to `Failed` or `Pending`.
    fn recover_stale(
        &mut self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        requeue: bool,
        now: DateTime<Utc>,
    ) -> StaleRecovery {
        let mut recovery = StaleRecovery::default();
        for q in self.records.values_mut() {
            if q.work.status != PendingStatus::Processing || q.work.updated_at >= cutoff {
                continue;
            }
            if q.belongs_in_failed(max_attempts) {
                q.work.status = PendingStatus::Failed;
                recovery.refailed += 1;
            } else if requeue {
                q.work.status = PendingStatus::Pending;
                recovery.requeued += 1;
            } else {
                continue;
            }
            q.manual = false;
            q.work.updated_at = now;
        }
        recovery
    }
}

#[derive(Default)]
struct Directory {
    accounts: HashMap<AccountId, Account>,
    affiliates: HashMap<String, Affiliate>,
    /// Keyed by payment id.
    commissions: HashMap<String, NewCommission>,
}

/// In-memory repository backing all three traits.
pub struct InMemoryRepository {
    pending: RwLock<PendingQueue>,
    flags: RwLock<HashMap<String, RolloutFlag>>,
    directory: RwLock<Directory>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(PendingQueue::default()),
            flags: RwLock::new(HashMap::new()),
            directory: RwLock::new(Directory::default()),
        }
    }

    /// Move a record's `updated_at` into the past, for staleness tests.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &PendingWorkId, by: chrono::Duration) {
        let mut pending = self.pending.write().await;
        if let Some(queued) = pending.records.get_mut(id) {
            queued.work.updated_at -= by;
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PendingWorkStore for InMemoryRepository {
    async fn enqueue(&self, new: NewPendingWork) -> Result<PendingWorkId, RepositoryError> {
        new.validate().map_err(RepositoryError::InvalidRecord)?;
        let now = Utc::now();
        let mut pending = self.pending.write().await;

        if let Some(existing) = pending
            .records
            .values_mut()
            .find(|q| q.work.payment_id == new.payment_id)
        {
            if existing.work.status != PendingStatus::Failed {
                return Err(RepositoryError::DuplicatePayment {
                    payment_id: new.payment_id,
                });
            }
            let id = existing.work.id;
            let created_at = existing.work.created_at;
            let last_error = existing.work.last_error.take();
            existing.work = PendingWork::from_new(id, new, now);
            existing.work.created_at = created_at;
            existing.work.last_error = last_error;
            existing.manual = false;
            return Ok(id);
        }

        let id = PendingWorkId::new();
        let seq = pending.next_seq;
        pending.next_seq += 1;
        pending.records.insert(
            id,
            QueuedWork {
                seq,
                work: PendingWork::from_new(id, new, now),
                manual: false,
            },
        );
        Ok(id)
    }

    async fn claim_batch(
        &self,
        limit: usize,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        let now = Utc::now();
        let stale_cutoff = stale_cutoff(now, stale_lock_timeout);
        let mut pending = self.pending.write().await;
        pending.recover_stale(stale_cutoff, max_attempts, false, now);

        let ids: Vec<PendingWorkId> = pending
            .sorted(|w| match w.status {
                PendingStatus::Pending => w.attempts < max_attempts,
                PendingStatus::Processing => w.updated_at < stale_cutoff,
                _ => false,
            })
            .into_iter()
            .take(limit)
            .map(|q| q.work.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(queued) = pending.records.get_mut(&id) {
                queued.work.status = PendingStatus::Processing;
                queued.work.updated_at = now;
                claimed.push(queued.work.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: &PendingWorkId) -> Result<bool, RepositoryError> {
        let mut pending = self.pending.write().await;
        match pending.records.get_mut(id) {
            Some(q) if q.work.status == PendingStatus::Processing => {
                q.work.status = PendingStatus::Completed;
                q.manual = false;
                q.work.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError> {
        self.fail_transition(id, error, PendingStatus::Failed).await
    }

    async fn mark_retry(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError> {
        self.fail_transition(id, error, PendingStatus::Pending).await
    }

    async fn get(&self, id: &PendingWorkId) -> Result<Option<PendingWork>, RepositoryError> {
        let pending = self.pending.read().await;
        Ok(pending.records.get(id).map(|q| q.work.clone()))
    }

    async fn list_by_status(
        &self,
        status: PendingStatus,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        let pending = self.pending.read().await;
        Ok(pending
            .sorted(|w| w.status == status)
            .into_iter()
            .map(|q| q.work.clone())
            .collect())
    }

    async fn list_failed(
        &self,
        kind: Option<PendingKind>,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        let pending = self.pending.read().await;
        Ok(pending
            .sorted(|w| w.status == PendingStatus::Failed && kind.map_or(true, |k| w.kind == k))
            .into_iter()
            .map(|q| q.work.clone())
            .collect())
    }

    async fn begin_manual(
        &self,
        id: &PendingWorkId,
    ) -> Result<Option<PendingWork>, RepositoryError> {
        let mut pending = self.pending.write().await;
        match pending.records.get_mut(id) {
            Some(q) if q.work.status == PendingStatus::Failed => {
                q.work.status = PendingStatus::Processing;
                q.manual = true;
                q.work.updated_at = Utc::now();
                Ok(Some(q.work.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_stale(
        &self,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<StaleRecovery, RepositoryError> {
        let now = Utc::now();
        let mut pending = self.pending.write().await;
        Ok(pending.recover_stale(stale_cutoff(now, stale_lock_timeout), max_attempts, true, now))
    }

    async fn stats(&self) -> Result<PendingStats, RepositoryError> {
        let pending = self.pending.read().await;
        let mut stats = PendingStats::default();
        for q in pending.records.values() {
            match q.work.status {
                PendingStatus::Pending => stats.pending += 1,
                PendingStatus::Processing => stats.processing += 1,
                PendingStatus::Completed => stats.completed += 1,
                PendingStatus::Failed => stats.failed += 1,
            }
            match q.work.kind {
                PendingKind::AwaitingAccountCreation => stats.awaiting_account_creation += 1,
                PendingKind::AwaitingSubscriptionLink => stats.awaiting_subscription_link += 1,
            }
            stats.total_attempts += u64::from(q.work.attempts);
        }
        stats.success_rate = PendingStats::compute_success_rate(stats.completed, stats.failed);
        Ok(stats)
    }
}

impl InMemoryRepository {
    async fn fail_transition(
        &self,
        id: &PendingWorkId,
        error: &str,
        next: PendingStatus,
    ) -> Result<Option<u32>, RepositoryError> {
        let mut pending = self.pending.write().await;
        match pending.records.get_mut(id) {
            Some(q) if q.work.status == PendingStatus::Processing => {
                q.work.status = next;
                q.manual = false;
                q.work.attempts += 1;
                q.work.last_error = Some(error.to_string());
                q.work.updated_at = Utc::now();
                Ok(Some(q.work.attempts))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl FlagRepository for InMemoryRepository {
    async fn load_flag(&self, name: &str) -> Result<Option<RolloutFlag>, RepositoryError> {
        let flags = self.flags.read().await;
        Ok(flags.get(name).cloned())
    }

    async fn create_flag_if_absent(
        &self,
        flag: &RolloutFlag,
    ) -> Result<RolloutFlag, RepositoryError> {
        let mut flags = self.flags.write().await;
        Ok(flags
            .entry(flag.name.clone())
            .or_insert_with(|| flag.clone())
            .clone())
    }

    async fn save_flag(
        &self,
        flag: &RolloutFlag,
        change: &RolloutChange,
    ) -> Result<(), RepositoryError> {
        let mut flags = self.flags.write().await;
        let stored = flags
            .entry(flag.name.clone())
            .or_insert_with(|| RolloutFlag {
                history: Vec::new(),
                ..flag.clone()
            });
        stored.enabled = flag.enabled;
        stored.rollout_percentage = flag.rollout_percentage;
        stored.target_groups = flag.target_groups.clone();
        stored.updated_at = flag.updated_at;
        stored.history.push(change.clone());
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for InMemoryRepository {
    async fn find_account_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let dir = self.directory.read().await;
        Ok(dir
            .accounts
            .values()
            .find(|a| a.payment_id.as_deref() == Some(payment_id))
            .cloned())
    }

    async fn find_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let dir = self.directory.read().await;
        Ok(dir
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_account(&self, profile: &AccountProfile) -> Result<Account, RepositoryError> {
        let mut dir = self.directory.write().await;
        if let Some(existing) = dir
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(&profile.email))
        {
            return Err(RepositoryError::Conflict {
                what: "account",
                existing: existing.id.to_string(),
            });
        }
        let now = Utc::now();
        let account = Account {
            id: AccountId::generate(),
            email: profile.email.clone(),
            payment_id: Some(profile.payment_id.clone()),
            display_name: profile.display_name.clone(),
            national_id: profile.national_id.clone(),
            phone: profile.phone.clone(),
            address: profile.address.clone(),
            member_type: profile.member_type.clone(),
            external_customer_id: profile.external_customer_id.clone(),
            external_subscription_id: None,
            status: "active".to_string(),
            registration_flow_version: REGISTRATION_FLOW_VERSION.to_string(),
            payment_confirmed_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        dir.accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn update_profile(
        &self,
        account_id: &AccountId,
        profile: &AccountProfile,
    ) -> Result<(), RepositoryError> {
        let mut dir = self.directory.write().await;
        let account = dir.accounts.get_mut(account_id).ok_or_else(|| {
            RepositoryError::storage("update profile", format!("no account {account_id}"))
        })?;
        let now = Utc::now();
        account.display_name = profile.display_name.clone();
        account.national_id = profile.national_id.clone();
        account.phone = profile.phone.clone();
        account.address = profile.address.clone();
        account.member_type = profile.member_type.clone();
        if profile.external_customer_id.is_some() {
            account.external_customer_id = profile.external_customer_id.clone();
        }
        account.payment_id = Some(profile.payment_id.clone());
        account.status = "active".to_string();
        account.registration_flow_version = REGISTRATION_FLOW_VERSION.to_string();
        account.payment_confirmed_at.get_or_insert(now);
        account.updated_at = now;
        Ok(())
    }

    async fn link_subscription(
        &self,
        account_id: &AccountId,
        subscription_id: &str,
        payment_id: &str,
    ) -> Result<(), RepositoryError> {
        let mut dir = self.directory.write().await;
        let account = dir.accounts.get_mut(account_id).ok_or_else(|| {
            RepositoryError::storage("link subscription", format!("no account {account_id}"))
        })?;
        account.external_subscription_id = Some(subscription_id.to_string());
        account.payment_id = Some(payment_id.to_string());
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn find_affiliate(
        &self,
        reference: &str,
    ) -> Result<Option<Affiliate>, RepositoryError> {
        let dir = self.directory.read().await;
        Ok(dir
            .affiliates
            .values()
            .find(|a| a.id == reference || a.code == reference)
            .cloned())
    }

    async fn upsert_affiliate(&self, affiliate: &Affiliate) -> Result<(), RepositoryError> {
        let mut dir = self.directory.write().await;
        dir.affiliates
            .insert(affiliate.id.clone(), affiliate.clone());
        Ok(())
    }

    async fn record_commission(
        &self,
        commission: &NewCommission,
    ) -> Result<bool, RepositoryError> {
        let mut dir = self.directory.write().await;
        if dir.commissions.contains_key(&commission.payment_id) {
            return Ok(false);
        }
        dir.commissions
            .insert(commission.payment_id.clone(), commission.clone());
        Ok(true)
    }

    async fn count_commissions(&self, payment_id: &str) -> Result<usize, RepositoryError> {
        let dir = self.directory.read().await;
        Ok(usize::from(dir.commissions.contains_key(payment_id)))
    }
}
