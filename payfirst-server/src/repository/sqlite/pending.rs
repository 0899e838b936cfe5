//! Pending-work queue operations for the SQLite repository.
//!
//! Every state transition is a single conditional `UPDATE`, so two processes
//! sharing the database file can never both observe a successful claim or both
//! apply the same terminal transition.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use payfirst_core::{
    NewPendingWork, PendingKind, PendingStats, PendingStatus, PendingWork, PendingWorkId,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::super::{stale_cutoff, PendingWorkStore, RepositoryError, StaleRecovery};
use super::{from_millis, sql_err, to_millis, usize_to_i64_limit, SqliteRepository};

const WORK_COLUMNS: &str = "seq, id, kind, payment_id, external_customer_id, \
     external_subscription_id, user_payload, subscription_context, attempts, last_error, \
     status, created_at, updated_at";

/// A row as stored, before JSON and enum columns are decoded.
struct WorkRow {
    seq: i64,
    id: String,
    kind: String,
    payment_id: String,
    external_customer_id: Option<String>,
    external_subscription_id: Option<String>,
    user_payload: String,
    subscription_context: String,
    attempts: i64,
    last_error: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl WorkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            payment_id: row.get(3)?,
            external_customer_id: row.get(4)?,
            external_subscription_id: row.get(5)?,
            user_payload: row.get(6)?,
            subscription_context: row.get(7)?,
            attempts: row.get(8)?,
            last_error: row.get(9)?,
            status: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn decode(self) -> Result<PendingWork, RepositoryError> {
        Ok(PendingWork {
            id: self
                .id
                .parse()
                .map_err(|_| RepositoryError::corruption("pending work id"))?,
            kind: self
                .kind
                .parse()
                .map_err(|_| RepositoryError::corruption("pending work kind"))?,
            payment_id: self.payment_id,
            external_customer_id: self.external_customer_id,
            external_subscription_id: self.external_subscription_id,
            user_payload: serde_json::from_str(&self.user_payload)
                .map_err(|_| RepositoryError::corruption("user payload JSON"))?,
            subscription_context: serde_json::from_str(&self.subscription_context)
                .map_err(|_| RepositoryError::corruption("subscription context JSON"))?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| RepositoryError::corruption("attempt counter"))?,
            last_error: self.last_error,
            status: self
                .status
                .parse()
                .map_err(|_| RepositoryError::corruption("pending work status"))?,
            created_at: from_millis(self.created_at, "created_at")?,
            updated_at: from_millis(self.updated_at, "updated_at")?,
        })
    }
}

fn query_works(
    conn: &Connection,
    operation: &'static str,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingWork>, RepositoryError> {
    let mut stmt = conn.prepare(sql).map_err(sql_err(operation))?;
    let rows = stmt
        .query_map(params, WorkRow::from_row)
        .map_err(sql_err(operation))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err(operation))?;
    rows.into_iter().map(WorkRow::decode).collect()
}

/// Send stale claims that the sweep must not retry back to `failed`: manual
/// completions and records out of attempts.
fn refail_stale_sync(
    conn: &Connection,
    operation: &'static str,
    now: i64,
    cutoff: i64,
    max_attempts: u32,
) -> Result<usize, RepositoryError> {
    conn.execute(
        "UPDATE pending_work SET status = 'failed', manual_claim = 0, updated_at = ?1
         WHERE status = 'processing' AND updated_at < ?2
           AND (manual_claim = 1 OR attempts >= ?3)",
        params![now, cutoff, max_attempts],
    )
    .map_err(sql_err(operation))
}

/// Shared body of `mark_failed` / `mark_retry`: increment and transition in one
/// statement, returning the new attempt count only if the record was ours.
fn fail_transition_sync(
    conn: &Connection,
    operation: &'static str,
    id: &str,
    error: &str,
    next: PendingStatus,
) -> Result<Option<u32>, RepositoryError> {
    let attempts: Option<i64> = conn
        .query_row(
            "UPDATE pending_work
             SET status = ?1, attempts = attempts + 1, last_error = ?2, updated_at = ?3,
                 manual_claim = 0
             WHERE id = ?4 AND status = 'processing'
             RETURNING attempts",
            params![next.as_str(), error, to_millis(Utc::now()), id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err(operation))?;

    attempts
        .map(|a| u32::try_from(a).map_err(|_| RepositoryError::corruption("attempt counter")))
        .transpose()
}

#[async_trait]
impl PendingWorkStore for SqliteRepository {
    async fn enqueue(&self, new: NewPendingWork) -> Result<PendingWorkId, RepositoryError> {
        new.validate().map_err(RepositoryError::InvalidRecord)?;

        let user_payload = serde_json::to_string(&new.user_payload)
            .map_err(|e| RepositoryError::storage("serialize user payload", e.to_string()))?;
        let subscription_context = serde_json::to_string(&new.subscription_context)
            .map_err(|e| RepositoryError::storage("serialize subscription context", e.to_string()))?;

        self.with_conn("enqueue", move |conn| {
            let now = to_millis(Utc::now());
            // IMMEDIATE takes the write lock up front so the lookup and the
            // insert cannot interleave with another process's enqueue.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("enqueue"))?;

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, status FROM pending_work WHERE payment_id = ?1",
                    params![new.payment_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err("enqueue"))?;

            let id = match existing {
                Some((id, status)) if status == PendingStatus::Failed.as_str() => {
                    tx.execute(
                        "UPDATE pending_work
                         SET kind = ?1, external_customer_id = ?2, external_subscription_id = ?3,
                             user_payload = ?4, subscription_context = ?5, attempts = 0,
                             status = 'pending', manual_claim = 0, updated_at = ?6
                         WHERE id = ?7",
                        params![
                            new.kind.as_str(),
                            new.external_customer_id,
                            new.external_subscription_id,
                            user_payload,
                            subscription_context,
                            now,
                            id
                        ],
                    )
                    .map_err(sql_err("enqueue"))?;
                    id.parse()
                        .map_err(|_| RepositoryError::corruption("pending work id"))?
                }
                Some(_) => {
                    return Err(RepositoryError::DuplicatePayment {
                        payment_id: new.payment_id,
                    })
                }
                None => {
                    let id = PendingWorkId::new();
                    tx.execute(
                        "INSERT INTO pending_work (
                            id, kind, payment_id, external_customer_id, external_subscription_id,
                            user_payload, subscription_context, attempts, status,
                            created_at, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'pending', ?8, ?8)",
                        params![
                            id.to_string(),
                            new.kind.as_str(),
                            new.payment_id,
                            new.external_customer_id,
                            new.external_subscription_id,
                            user_payload,
                            subscription_context,
                            now
                        ],
                    )
                    .map_err(sql_err("enqueue"))?;
                    id
                }
            };

            tx.commit().map_err(sql_err("enqueue"))?;
            Ok(id)
        })
        .await
    }

    async fn claim_batch(
        &self,
        limit: usize,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        let limit = usize_to_i64_limit(limit, "claim batch")?;

        self.with_conn("claim batch", move |conn| {
            let now = Utc::now();
            let cutoff = to_millis(stale_cutoff(now, stale_lock_timeout));
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("claim batch"))?;

            refail_stale_sync(&tx, "claim batch", to_millis(now), cutoff, max_attempts)?;

            let sql = format!(
                "UPDATE pending_work
                 SET status = 'processing', updated_at = ?1
                 WHERE id IN (
                     SELECT id FROM pending_work
                     WHERE (status = 'pending' AND attempts < ?2)
                        OR (status = 'processing' AND updated_at < ?3
                            AND manual_claim = 0 AND attempts < ?2)
                     ORDER BY created_at, seq
                     LIMIT ?4
                 )
                 RETURNING {WORK_COLUMNS}"
            );
            let mut rows = {
                let mut stmt = tx.prepare(&sql).map_err(sql_err("claim batch"))?;
                let rows = stmt
                    .query_map(
                        params![to_millis(now), max_attempts, cutoff, limit],
                        WorkRow::from_row,
                    )
                    .map_err(sql_err("claim batch"))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sql_err("claim batch"))?;
                rows
            };
            tx.commit().map_err(sql_err("claim batch"))?;

            // RETURNING order is unspecified.
            rows.sort_by_key(|r| (r.created_at, r.seq));
            rows.into_iter().map(WorkRow::decode).collect()
        })
        .await
    }

    async fn mark_completed(&self, id: &PendingWorkId) -> Result<bool, RepositoryError> {
        let id = id.to_string();
        self.with_conn("mark completed", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE pending_work SET status = 'completed', manual_claim = 0, updated_at = ?1
                     WHERE id = ?2 AND status = 'processing'",
                    params![to_millis(Utc::now()), id],
                )
                .map_err(sql_err("mark completed"))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError> {
        let id = id.to_string();
        let error = error.to_string();
        self.with_conn("mark failed", move |conn| {
            fail_transition_sync(conn, "mark failed", &id, &error, PendingStatus::Failed)
        })
        .await
    }

    async fn mark_retry(
        &self,
        id: &PendingWorkId,
        error: &str,
    ) -> Result<Option<u32>, RepositoryError> {
        let id = id.to_string();
        let error = error.to_string();
        self.with_conn("mark retry", move |conn| {
            fail_transition_sync(conn, "mark retry", &id, &error, PendingStatus::Pending)
        })
        .await
    }

    async fn get(&self, id: &PendingWorkId) -> Result<Option<PendingWork>, RepositoryError> {
        let id = id.to_string();
        self.with_conn("get pending work", move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {WORK_COLUMNS} FROM pending_work WHERE id = ?1"),
                    params![id],
                    WorkRow::from_row,
                )
                .optional()
                .map_err(sql_err("get pending work"))?;
            row.map(WorkRow::decode).transpose()
        })
        .await
    }

    async fn list_by_status(
        &self,
        status: PendingStatus,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        self.with_conn("list by status", move |conn| {
            query_works(
                conn,
                "list by status",
                &format!(
                    "SELECT {WORK_COLUMNS} FROM pending_work WHERE status = ?1
                     ORDER BY created_at, seq"
                ),
                params![status.as_str()],
            )
        })
        .await
    }

    async fn list_failed(
        &self,
        kind: Option<PendingKind>,
    ) -> Result<Vec<PendingWork>, RepositoryError> {
        self.with_conn("list failed", move |conn| {
            query_works(
                conn,
                "list failed",
                &format!(
                    "SELECT {WORK_COLUMNS} FROM pending_work
                     WHERE status = 'failed' AND (?1 IS NULL OR kind = ?1)
                     ORDER BY created_at, seq"
                ),
                params![kind.map(|k| k.as_str())],
            )
        })
        .await
    }

    async fn begin_manual(
        &self,
        id: &PendingWorkId,
    ) -> Result<Option<PendingWork>, RepositoryError> {
        let id = id.to_string();
        self.with_conn("begin manual completion", move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "UPDATE pending_work
                         SET status = 'processing', manual_claim = 1, updated_at = ?1
                         WHERE id = ?2 AND status = 'failed'
                         RETURNING {WORK_COLUMNS}"
                    ),
                    params![to_millis(Utc::now()), id],
                    WorkRow::from_row,
                )
                .optional()
                .map_err(sql_err("begin manual completion"))?;
            row.map(WorkRow::decode).transpose()
        })
        .await
    }

    async fn release_stale(
        &self,
        stale_lock_timeout: Duration,
        max_attempts: u32,
    ) -> Result<StaleRecovery, RepositoryError> {
        self.with_conn("release stale", move |conn| {
            let now = Utc::now();
            let cutoff = to_millis(stale_cutoff(now, stale_lock_timeout));
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(sql_err("release stale"))?;

            let refailed =
                refail_stale_sync(&tx, "release stale", to_millis(now), cutoff, max_attempts)?;
            let requeued = tx
                .execute(
                    "UPDATE pending_work SET status = 'pending', updated_at = ?1
                     WHERE status = 'processing' AND updated_at < ?2",
                    params![to_millis(now), cutoff],
                )
                .map_err(sql_err("release stale"))?;

            tx.commit().map_err(sql_err("release stale"))?;
            Ok(StaleRecovery { requeued, refailed })
        })
        .await
    }

    async fn stats(&self) -> Result<PendingStats, RepositoryError> {
        self.with_conn("pending stats", move |conn| {
            let mut stats = PendingStats::default();

            let mut stmt = conn
                .prepare(
                    "SELECT status, kind, COUNT(*), COALESCE(SUM(attempts), 0)
                     FROM pending_work GROUP BY status, kind",
                )
                .map_err(sql_err("pending stats"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(sql_err("pending stats"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err("pending stats"))?;

            for (status, kind, count, attempts) in rows {
                let count = u64::try_from(count)
                    .map_err(|_| RepositoryError::corruption("pending count"))?;
                let attempts = u64::try_from(attempts)
                    .map_err(|_| RepositoryError::corruption("attempt counter"))?;
                let status: PendingStatus = status
                    .parse()
                    .map_err(|_| RepositoryError::corruption("pending work status"))?;
                let kind: PendingKind = kind
                    .parse()
                    .map_err(|_| RepositoryError::corruption("pending work kind"))?;

                match status {
                    PendingStatus::Pending => stats.pending += count,
                    PendingStatus::Processing => stats.processing += count,
                    PendingStatus::Completed => stats.completed += count,
                    PendingStatus::Failed => stats.failed += count,
                }
                match kind {
                    PendingKind::AwaitingAccountCreation => {
                        stats.awaiting_account_creation += count
                    }
                    PendingKind::AwaitingSubscriptionLink => {
                        stats.awaiting_subscription_link += count
                    }
                }
                stats.total_attempts += attempts;
            }

            stats.success_rate =
                PendingStats::compute_success_rate(stats.completed, stats.failed);
            Ok(stats)
        })
        .await
    }
}
