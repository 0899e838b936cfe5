//! Repository abstraction for durable pipeline state.
//!
//! Three traits cover the three kinds of state the pipeline touches:
//! - `PendingWorkStore`: the pending-work queue and its claim protocol
//! - `FlagRepository`: rollout flags and their audit history
//! - `AccountDirectory`: accounts, affiliates and commissions
//!
//! Implementations provide different backends (in-memory, SQLite). Workers in
//! separate processes share nothing but the store, so every transition that
//! matters for exclusivity is a single conditional write.

mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payfirst_core::{
    NewPendingWork, PendingKind, PendingStats, PendingStatus, PendingWork, PendingWorkId,
    RolloutChange, RolloutFlag,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backing store failed.
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// A persisted value could not be decoded.
    #[error("corrupted {what} in store")]
    Corruption { what: String },

    /// A record for this payment already exists and is not re-armable.
    #[error("payment {payment_id} already has pending work")]
    DuplicatePayment { payment_id: String },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Uniqueness conflict on a secondary key (e.g. account email).
    #[error("{what} already exists: {existing}")]
    Conflict { what: &'static str, existing: String },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        RepositoryError::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        RepositoryError::Corruption { what: what.into() }
    }
}

/// Durable queue of pending registration work.
#[async_trait]
pub trait PendingWorkStore: Send + Sync {
    /// Persist a new record as `Pending` with zero attempts.
    ///
    /// Fails with `DuplicatePayment` when the payment id is already present as
    /// `Pending`, `Processing` or `Completed`. A `Failed` record for the same
    /// payment is re-armed in place and its id returned.
    async fn enqueue(&self, new: NewPendingWork) -> Result<PendingWorkId, RepositoryError>;

    /// Atomically claim up to `limit` records, oldest first.
    ///
    /// Eligible: `Pending` with `attempts < max_attempts`, or `Processing` whose
    /// `updated_at` is older than `stale_lock_timeout` (crash recovery). Claimed
    /// records are moved to `Processing` before being returned, and no record is
    /// returned to two concurrent callers.
    ///
    /// Stale records that came from `begin_manual` or have used up their
    /// attempts are not claimed; the same write returns them to `Failed`.
    async fn claim_batch(
        &self,
        limit: usize,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Vec<PendingWork>, RepositoryError>;

    /// `Processing -> Completed`. Returns false if the record was not
    /// `Processing` (the claim was lost).
    async fn mark_completed(&self, id: &PendingWorkId) -> Result<bool, RepositoryError>;

    /// `Processing -> Failed`, incrementing `attempts`. Returns the new attempt
    /// count, or `None` if the record was not `Processing`.
    async fn mark_failed(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError>;

    /// `Processing -> Pending`, incrementing `attempts`. Returns the new attempt
    /// count, or `None` if the record was not `Processing`.
    async fn mark_retry(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError>;

    async fn get(&self, id: &PendingWorkId) -> Result<Option<PendingWork>, RepositoryError>;

    async fn list_by_status(
        &self,
        status: PendingStatus,
    ) -> Result<Vec<PendingWork>, RepositoryError>;

    async fn list_failed(
        &self,
        kind: Option<PendingKind>,
    ) -> Result<Vec<PendingWork>, RepositoryError>;

    /// `Failed -> Processing` for an operator-triggered completion. The record
    /// is flagged so stale recovery sends it back to `Failed`.
    async fn begin_manual(
        &self,
        id: &PendingWorkId,
    ) -> Result<Option<PendingWork>, RepositoryError>;

    /// Return stale `Processing` records to `Pending`, or to `Failed` when they
    /// came from `begin_manual` or have `attempts >= max_attempts`.
    async fn release_stale(
        &self,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<StaleRecovery, RepositoryError>;

    async fn stats(&self) -> Result<PendingStats, RepositoryError>;
}

/// What `release_stale` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Back to `Pending` for the next sweep.
    pub requeued: usize,
    /// Back to `Failed`; operators were already notified about these.
    pub refailed: usize,
}

impl StaleRecovery {
    pub fn total(&self) -> usize {
        self.requeued + self.refailed
    }
}

/// Durable rollout flags.
#[async_trait]
pub trait FlagRepository: Send + Sync {
    /// Load a flag with its full history (oldest entry first).
    async fn load_flag(&self, name: &str) -> Result<Option<RolloutFlag>, RepositoryError>;

    /// Store `flag` unless one with the same name exists; return whichever is stored.
    async fn create_flag_if_absent(
        &self,
        flag: &RolloutFlag,
    ) -> Result<RolloutFlag, RepositoryError>;

    /// Update the flag's current values and append `change` to its history,
    /// as one write.
    async fn save_flag(
        &self,
        flag: &RolloutFlag,
        change: &RolloutChange,
    ) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tag written on every account created through this pipeline.
pub const REGISTRATION_FLOW_VERSION: &str = "payment_first_v1";

/// Identity plus profile of a member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub payment_id: Option<String>,
    pub display_name: String,
    pub national_id: String,
    pub phone: String,
    pub address: serde_json::Value,
    pub member_type: String,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub status: String,
    pub registration_flow_version: String,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile data written on create, and re-applied on convergence.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountProfile {
    pub email: String,
    pub credential: String,
    pub payment_id: String,
    pub display_name: String,
    pub national_id: String,
    pub phone: String,
    pub address: serde_json::Value,
    pub member_type: String,
    pub external_customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Affiliate {
    pub id: String,
    pub code: String,
    /// `None` falls back to the default commission rate.
    pub commission_percentage: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommission {
    pub affiliate_id: String,
    pub account_id: AccountId,
    pub payment_id: String,
    pub amount: Decimal,
    pub percentage: Decimal,
}

/// Accounts, affiliates and commissions.
///
/// Every write here is keyed so that repeating it converges instead of
/// duplicating: accounts are unique by email, commissions by payment id.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_account_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<Account>, RepositoryError>;

    async fn find_account_by_email(&self, email: &str)
        -> Result<Option<Account>, RepositoryError>;

    /// Create identity and profile in one write. Returns `Conflict` if the
    /// email is already registered.
    async fn create_account(&self, profile: &AccountProfile) -> Result<Account, RepositoryError>;

    /// Re-apply profile fields to an existing account and mark it active.
    async fn update_profile(
        &self,
        account_id: &AccountId,
        profile: &AccountProfile,
    ) -> Result<(), RepositoryError>;

    async fn link_subscription(
        &self,
        account_id: &AccountId,
        subscription_id: &str,
        payment_id: &str,
    ) -> Result<(), RepositoryError>;

    /// Look up an affiliate by id or by referral code.
    async fn find_affiliate(&self, reference: &str)
        -> Result<Option<Affiliate>, RepositoryError>;

    async fn upsert_affiliate(&self, affiliate: &Affiliate) -> Result<(), RepositoryError>;

    /// Returns false when a commission for this payment already exists.
    async fn record_commission(&self, commission: &NewCommission)
        -> Result<bool, RepositoryError>;

    async fn count_commissions(&self, payment_id: &str) -> Result<usize, RepositoryError>;
}

/// `now - timeout`, saturating at the earliest representable instant.
pub(crate) fn stale_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|t| now.checked_sub_signed(t))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
