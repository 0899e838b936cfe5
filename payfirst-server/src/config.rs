use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::rollout::{HealthThresholds, RolloutConfig};
use crate::worker::WorkerConfig;

pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://sandbox.asaas.com/api/v3";

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    /// Bearer token for the operator API. If not set, every operator endpoint
    /// answers 503.
    pub operator_auth_token: Option<String>,
    /// Operator alerts and welcome messages are POSTed here when set.
    pub notification_webhook_url: Option<String>,
    pub worker: WorkerConfig,
    pub sweep_interval: Duration,
    pub rollout: RolloutConfig,
    pub health_check_interval: Duration,
    /// Flag values used only when the flag does not exist in the store yet.
    pub initial_flow_enabled: bool,
    pub initial_flow_percentage: u8,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let gateway_api_key = lookup("PAYMENT_GATEWAY_API_KEY")
            .filter(|s| !s.trim().is_empty())
            .context("PAYMENT_GATEWAY_API_KEY environment variable is required")?;

        let gateway_base_url = lookup("PAYMENT_GATEWAY_BASE_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string());

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let worker = WorkerConfig {
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", 3)?,
            batch_size: parse_or(&lookup, "SWEEP_BATCH_SIZE", 50)?,
            concurrency: parse_or(&lookup, "SWEEP_CONCURRENCY", 4)?,
            stale_lock_timeout: secs_or(&lookup, "STALE_LOCK_TIMEOUT_SECS", 600)?,
            record_timeout: secs_or(&lookup, "RECORD_TIMEOUT_SECS", 30)?,
            sweep_deadline: secs_or(&lookup, "SWEEP_DEADLINE_SECS", 240)?,
        };
        anyhow::ensure!(worker.max_attempts >= 1, "MAX_ATTEMPTS must be at least 1");
        anyhow::ensure!(worker.batch_size >= 1, "SWEEP_BATCH_SIZE must be at least 1");

        let window_minutes: u64 = parse_or(&lookup, "HEALTH_WINDOW_MINUTES", 30)?;
        let rollout = RolloutConfig {
            window: Duration::from_secs(window_minutes.saturating_mul(60)),
            thresholds: HealthThresholds {
                min_success_rate: parse_or(&lookup, "HEALTH_MIN_SUCCESS_RATE", 95.0)?,
                max_error_rate: parse_or(&lookup, "HEALTH_MAX_ERROR_RATE", 5.0)?,
                max_avg_processing_ms: parse_or(&lookup, "HEALTH_MAX_AVG_PROCESSING_MS", 20_000.0)?,
            },
            min_samples: parse_or(&lookup, "HEALTH_MIN_SAMPLES", 5)?,
            rollback_after_unhealthy_cycles: parse_or(
                &lookup,
                "ROLLBACK_AFTER_UNHEALTHY_CYCLES",
                3,
            )?,
            force_enabled: parse_flag(lookup("PAYMENT_FIRST_FLOW_FORCE_ENABLED")),
            force_disabled: parse_flag(lookup("PAYMENT_FIRST_FLOW_FORCE_DISABLED")),
        };

        let initial_flow_percentage: u8 = parse_or(&lookup, "PAYMENT_FIRST_FLOW_PERCENTAGE", 0)?;
        anyhow::ensure!(
            initial_flow_percentage <= 100,
            "PAYMENT_FIRST_FLOW_PERCENTAGE must be between 0 and 100"
        );

        Ok(Config {
            port: parse_or(&lookup, "PORT", 3000)?,
            state_dir,
            gateway_base_url,
            gateway_api_key,
            operator_auth_token: parse_operator_auth_token(lookup("OPERATOR_AUTH_TOKEN")),
            notification_webhook_url: lookup("NOTIFICATION_WEBHOOK_URL")
                .filter(|s| !s.trim().is_empty()),
            worker,
            sweep_interval: secs_or(&lookup, "SWEEP_INTERVAL_SECS", 60)?,
            rollout,
            health_check_interval: secs_or(&lookup, "HEALTH_CHECK_INTERVAL_SECS", 60)?,
            initial_flow_enabled: parse_flag(lookup("PAYMENT_FIRST_FLOW_ENABLED")),
            initial_flow_percentage,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration> {
    let secs: u64 = parse_or(lookup, key, default)?;
    anyhow::ensure!(secs > 0, "{key} must be greater than zero");
    Ok(Duration::from_secs(secs))
}

/// `true`, `1` and `yes` (any case) are on; anything else, including unset,
/// is off.
pub fn parse_flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Parse OPERATOR_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so that an empty token can never authenticate a request.
pub fn parse_operator_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
