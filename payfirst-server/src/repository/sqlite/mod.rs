//! SQLite implementation of the repository traits.
//!
//! This provides persistent storage that survives service restarts and lets
//! several worker processes share one queue.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Timestamps
//!
//! All timestamps are stored as unix milliseconds so that claim staleness can
//! be compared inside a single SQL statement.

mod accounts;
mod flags;
mod pending;


use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::RepositoryError;

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 4;

/// SQLite-backed repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    /// Database connection. Exposed as `pub(crate)` for test access to
    /// manipulate timestamps when testing staleness.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for concurrent readers and crash safety
    /// - `synchronous = FULL` so an acknowledged claim survives power loss
    /// - `busy_timeout = 5000ms` so competing workers wait instead of failing
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // The database holds member PII and credential material.
        #[cfg(unix)]
        if !is_in_memory && !path_str.is_empty() {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support; the claim protocol assumes WAL.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // v1: the pending-work queue. `seq` breaks created_at ties so claims
        // stay oldest-first within one millisecond.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS pending_work (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    payment_id TEXT NOT NULL UNIQUE,
                    external_customer_id TEXT,
                    external_subscription_id TEXT,
                    user_payload TEXT NOT NULL,
                    subscription_context TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pending_work_claim
                    ON pending_work(status, created_at, seq);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // v2: rollout flags and their audit trail.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS rollout_flags (
                    name TEXT PRIMARY KEY,
                    enabled INTEGER NOT NULL,
                    rollout_percentage INTEGER NOT NULL
                        CHECK (rollout_percentage BETWEEN 0 AND 100),
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rollout_flag_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    flag_name TEXT NOT NULL,
                    action TEXT NOT NULL,
                    old_percentage INTEGER NOT NULL,
                    new_percentage INTEGER NOT NULL,
                    reason TEXT,
                    changed_by TEXT,
                    changed_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_flag_history_lookup
                    ON rollout_flag_history(flag_name, id);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        // v3: accounts, affiliates and commissions. Email is the secondary
        // idempotency key; commissions are unique per payment.
        if from_version < 3 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS accounts (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    credential TEXT NOT NULL,
                    payment_id TEXT,
                    display_name TEXT NOT NULL,
                    national_id TEXT NOT NULL,
                    phone TEXT NOT NULL,
                    address TEXT NOT NULL,
                    member_type TEXT NOT NULL,
                    external_customer_id TEXT,
                    external_subscription_id TEXT,
                    status TEXT NOT NULL,
                    registration_flow_version TEXT NOT NULL,
                    payment_confirmed_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_accounts_payment
                    ON accounts(payment_id) WHERE payment_id IS NOT NULL;

                CREATE TABLE IF NOT EXISTS affiliates (
                    id TEXT PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    commission_percentage TEXT
                );

                CREATE TABLE IF NOT EXISTS commissions (
                    payment_id TEXT PRIMARY KEY,
                    affiliate_id TEXT NOT NULL,
                    account_id TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    percentage TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    kind TEXT NOT NULL DEFAULT 'filiacao',
                    created_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v3", e.to_string()))?;
        }

        // v4: `manual_claim` marks a record an operator took out of `failed`, so
        // crash recovery returns it there. Flags gain their target groups.
        if from_version < 4 {
            conn.execute_batch(
                r#"
                ALTER TABLE pending_work ADD COLUMN manual_claim INTEGER NOT NULL DEFAULT 0;
                ALTER TABLE rollout_flags ADD COLUMN target_groups TEXT NOT NULL DEFAULT '[]';
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v4", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    pub(super) async fn with_conn<T, F>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| RepositoryError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

pub(super) fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

pub(super) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(super) fn from_millis(millis: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| RepositoryError::corruption(format!("{what} timestamp {millis}")))
}

/// Convert a usize limit to i64 for a SQLite LIMIT clause without wrapping.
pub(super) fn usize_to_i64_limit(
    limit: usize,
    operation: &'static str,
) -> Result<i64, RepositoryError> {
    i64::try_from(limit).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}
