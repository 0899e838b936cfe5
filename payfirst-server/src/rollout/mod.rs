//! Gradual rollout of the payment-first flow.
//!
//! A `RolloutController` owns one flag. It answers flow assignments from a
//! cached copy of the flag (no I/O on the request path), keeps a trailing
//! health window of reconciliation outcomes, and rolls the flag back to 0%
//! when the window stays unhealthy.
//!
//! Flag mutations are serialized per controller and written through to the
//! `FlagRepository`; `refresh()` pulls changes made by other processes.
//!
//! A gradual rollout schedule lives in the controller that accepted it and is
//! stepped by `health_check_loop`. It is dropped on rollback, when the window
//! turns unhealthy, and on restart.

mod bucket;
mod health;

pub use bucket::{bucket, in_rollout};
pub use health::{HealthThresholds, HealthWindow};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use payfirst_core::{
    FlagAction, FlagStatus, FlowVersion, GradualRollout, HealthSummary, RolloutChange, RolloutFlag,
};
use thiserror::Error;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::notify::{NotificationEvent, NotificationSink};
use crate::repository::{FlagRepository, RepositoryError};

/// Actor recorded on automatic rollbacks.
pub const HEALTH_MONITOR: &str = "health-monitor";

/// Longest accepted gap between scheduled rollout steps (one week).
pub const MAX_STEP_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout percentage must be between 0 and 100, got {0}")]
    InvalidPercentage(u32),

    #[error("rollout step must be between 1 and 100, got {0}")]
    InvalidStep(u32),

    #[error("rollout interval must be between 1 and {MAX_STEP_INTERVAL_SECS} seconds, got {0}")]
    InvalidInterval(u64),

    #[error("flag {0} is unhealthy; refusing to advance rollout")]
    Unhealthy(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    pub window: Duration,
    pub thresholds: HealthThresholds,
    /// Fewer outcomes than this never count as unhealthy.
    pub min_samples: u64,
    pub rollback_after_unhealthy_cycles: u32,
    pub force_enabled: bool,
    /// Wins over `force_enabled`.
    pub force_disabled: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 60),
            thresholds: HealthThresholds::default(),
            min_samples: 5,
            rollback_after_unhealthy_cycles: 3,
            force_enabled: false,
            force_disabled: false,
        }
    }
}

/// What one `evaluate_health` call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    InsufficientSamples,
    Unhealthy { streak: u32 },
    RolledBack,
}

/// What one `run_gradual_step` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradualStep {
    Idle,
    NotDue,
    Advanced(u8),
    /// Reached the target; the schedule is gone.
    Completed(u8),
    /// The window was unhealthy; the schedule is gone.
    Halted,
}

pub struct RolloutController {
    flags: Arc<dyn FlagRepository>,
    notifier: Arc<dyn NotificationSink>,
    config: RolloutConfig,
    current: RwLock<RolloutFlag>,
    window: Mutex<HealthWindow>,
    unhealthy_streak: AtomicU32,
    gradual: Mutex<Option<GradualRollout>>,
    /// Serializes read-modify-write cycles on the flag.
    mutation: tokio::sync::Mutex<()>,
}

impl RolloutController {
    /// Load the flag, creating it from `seed` if the store has none.
    pub async fn load(
        seed: RolloutFlag,
        flags: Arc<dyn FlagRepository>,
        notifier: Arc<dyn NotificationSink>,
        config: RolloutConfig,
    ) -> Result<Self, RolloutError> {
        let flag = flags.create_flag_if_absent(&seed).await?;
        info!(
            flag = %flag.name,
            enabled = flag.enabled,
            percentage = flag.rollout_percentage,
            "Loaded rollout flag"
        );
        let window = chrono::Duration::from_std(config.window).unwrap_or(chrono::Duration::MAX);
        Ok(Self {
            flags,
            notifier,
            current: RwLock::new(flag),
            window: Mutex::new(HealthWindow::new(window)),
            unhealthy_streak: AtomicU32::new(0),
            gradual: Mutex::new(None),
            mutation: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn name(&self) -> String {
        self.snapshot().name
    }

    pub fn snapshot(&self) -> RolloutFlag {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, flag: RolloutFlag) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = flag;
    }

    /// Pick a flow for one user. A disabled flag or 0% always means the old
    /// flow; otherwise membership of a target group wins over the hash bucket.
    pub fn assign_flow(&self, user_key: &str, user_groups: &[String]) -> FlowVersion {
        if self.config.force_disabled {
            return FlowVersion::OldFlow;
        }
        if self.config.force_enabled {
            return FlowVersion::NewFlow;
        }
        let flag = self.current.read().unwrap_or_else(PoisonError::into_inner);
        if !flag.enabled || flag.rollout_percentage == 0 {
            return FlowVersion::OldFlow;
        }
        let targeted = flag.target_groups.iter().any(|g| user_groups.contains(g));
        if targeted || in_rollout(&flag.name, user_key, flag.rollout_percentage) {
            FlowVersion::NewFlow
        } else {
            FlowVersion::OldFlow
        }
    }

    pub fn record_outcome(&self, success: bool, processing_time_ms: u64) {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_at(Utc::now(), success, processing_time_ms);
    }

    pub fn health(&self) -> HealthSummary {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary_at(Utc::now(), &self.config.thresholds)
    }

    pub fn is_healthy(&self) -> bool {
        self.health().is_healthy
    }

    pub fn status(&self) -> FlagStatus {
        FlagStatus {
            flag: self.snapshot(),
            health: self.health(),
            unhealthy_streak: self.unhealthy_streak.load(Ordering::SeqCst),
            gradual_rollout: self.gradual_rollout(),
        }
    }

    pub fn gradual_rollout(&self) -> Option<GradualRollout> {
        self.gradual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the gradual rollout schedule, if any, and return it.
    pub fn cancel_gradual_rollout(&self) -> Option<GradualRollout> {
        let cancelled = self
            .gradual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(plan) = &cancelled {
            info!(flag = %self.name(), target = plan.target, "Gradual rollout cancelled");
        }
        cancelled
    }

    pub fn history(&self) -> Vec<RolloutChange> {
        self.snapshot().history
    }

    /// Persist `change` applied to `flag`, then publish it to the cache.
    async fn commit(
        &self,
        mut flag: RolloutFlag,
        change: RolloutChange,
    ) -> Result<RolloutFlag, RolloutError> {
        flag.updated_at = change.at;
        self.flags.save_flag(&flag, &change).await?;
        flag.history.push(change);
        self.store(flag.clone());
        Ok(flag)
    }

    async fn set_percentage(
        &self,
        new_percentage: u8,
        action: FlagAction,
        reason: Option<String>,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        let mut flag = self.snapshot();
        let old_percentage = flag.rollout_percentage;
        flag.rollout_percentage = new_percentage;
        let change = RolloutChange {
            action,
            old_percentage,
            new_percentage,
            reason,
            changed_by,
            at: Utc::now(),
        };
        self.commit(flag, change).await
    }

    pub async fn update_rollout(
        &self,
        percentage: u32,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        let new_percentage = u8::try_from(percentage)
            .ok()
            .filter(|p| *p <= 100)
            .ok_or(RolloutError::InvalidPercentage(percentage))?;

        let _guard = self.mutation.lock().await;
        let current = self.snapshot();
        if current.rollout_percentage == new_percentage {
            return Ok(current);
        }

        let flag = self
            .set_percentage(new_percentage, FlagAction::PercentageChanged, None, changed_by)
            .await?;
        info!(
            flag = %flag.name,
            "Rollout percentage changed {} -> {}",
            current.rollout_percentage,
            new_percentage
        );
        Ok(flag)
    }

    /// Raise the percentage by `step`, capped at `target`. Refused while the
    /// health window is unhealthy.
    pub async fn advance_rollout(
        &self,
        target: u32,
        step: u32,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        if target > 100 {
            return Err(RolloutError::InvalidPercentage(target));
        }
        if !(1..=100).contains(&step) {
            return Err(RolloutError::InvalidStep(step));
        }
        if !self.is_healthy() {
            return Err(RolloutError::Unhealthy(self.name()));
        }

        let _guard = self.mutation.lock().await;
        let current = self.snapshot();
        let next = (u32::from(current.rollout_percentage) + step).min(target);
        if next <= u32::from(current.rollout_percentage) {
            return Ok(current);
        }

        // `next <= target <= 100` was checked above.
        let next = next as u8;
        let flag = self
            .set_percentage(next, FlagAction::PercentageChanged, None, changed_by)
            .await?;
        info!(
            flag = %flag.name,
            "Gradual rollout advanced {} -> {} (target {})",
            current.rollout_percentage,
            next,
            target
        );
        Ok(flag)
    }

    /// Take one step now and, unless that reaches `target`, schedule further
    /// steps every `interval_secs`. Replaces any existing schedule.
    pub async fn schedule_gradual_rollout(
        &self,
        target: u32,
        step: u32,
        interval_secs: u64,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        if !(1..=MAX_STEP_INTERVAL_SECS).contains(&interval_secs) {
            return Err(RolloutError::InvalidInterval(interval_secs));
        }
        let flag = self.advance_rollout(target, step, changed_by.clone()).await?;

        // `advance_rollout` validated both.
        let (target, step) = (target as u8, step as u8);
        let mut gradual = self.gradual.lock().unwrap_or_else(PoisonError::into_inner);
        if flag.rollout_percentage >= target {
            *gradual = None;
            return Ok(flag);
        }
        *gradual = Some(GradualRollout {
            target,
            step,
            interval_secs,
            next_step_at: Utc::now() + chrono::Duration::seconds(interval_secs as i64),
            changed_by,
        });
        info!(
            flag = %flag.name,
            percentage = flag.rollout_percentage,
            target,
            step,
            interval_secs,
            "Gradual rollout scheduled"
        );
        Ok(flag)
    }

    /// Take the next scheduled step if it is due.
    pub async fn run_gradual_step(&self) -> Result<GradualStep, RolloutError> {
        self.run_gradual_step_at(Utc::now()).await
    }

    async fn run_gradual_step_at(&self, now: DateTime<Utc>) -> Result<GradualStep, RolloutError> {
        let Some(plan) = self.gradual_rollout() else {
            return Ok(GradualStep::Idle);
        };
        if now < plan.next_step_at {
            return Ok(GradualStep::NotDue);
        }

        let result = if self.is_healthy() {
            self.advance_rollout(
                u32::from(plan.target),
                u32::from(plan.step),
                plan.changed_by.clone(),
            )
            .await
        } else {
            Err(RolloutError::Unhealthy(self.name()))
        };

        let mut gradual = self.gradual.lock().unwrap_or_else(PoisonError::into_inner);
        if gradual.as_ref() != Some(&plan) {
            // Replaced or cancelled while we were stepping.
            return Ok(GradualStep::NotDue);
        }
        match result {
            Ok(flag) if flag.rollout_percentage >= plan.target => {
                *gradual = None;
                info!(flag = %flag.name, target = plan.target, "Gradual rollout reached target");
                Ok(GradualStep::Completed(flag.rollout_percentage))
            }
            Ok(flag) => {
                let interval = chrono::Duration::seconds(plan.interval_secs as i64);
                *gradual = Some(GradualRollout {
                    next_step_at: now + interval,
                    ..plan
                });
                Ok(GradualStep::Advanced(flag.rollout_percentage))
            }
            Err(RolloutError::Unhealthy(name)) => {
                *gradual = None;
                warn!(flag = %name, target = plan.target, "Gradual rollout halted: flag is unhealthy");
                Ok(GradualStep::Halted)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the target groups. Percentages are untouched.
    pub async fn set_target_groups(
        &self,
        groups: Vec<String>,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        let mut groups: Vec<String> = groups
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        groups.sort();
        groups.dedup();

        let _guard = self.mutation.lock().await;
        let mut flag = self.snapshot();
        if flag.target_groups == groups {
            return Ok(flag);
        }
        let reason = if groups.is_empty() {
            "target groups cleared".to_string()
        } else {
            format!("target groups: {}", groups.join(", "))
        };
        flag.target_groups = groups;
        let change = RolloutChange {
            action: FlagAction::TargetGroupsChanged,
            old_percentage: flag.rollout_percentage,
            new_percentage: flag.rollout_percentage,
            reason: Some(reason),
            changed_by,
            at: Utc::now(),
        };
        let flag = self.commit(flag, change).await?;
        info!(flag = %flag.name, groups = ?flag.target_groups, "Target groups changed");
        Ok(flag)
    }

    pub async fn set_enabled(
        &self,
        enabled: bool,
        changed_by: Option<String>,
    ) -> Result<RolloutFlag, RolloutError> {
        let _guard = self.mutation.lock().await;
        let mut flag = self.snapshot();
        if flag.enabled == enabled {
            return Ok(flag);
        }
        flag.enabled = enabled;
        let change = RolloutChange {
            action: if enabled {
                FlagAction::Enabled
            } else {
                FlagAction::Disabled
            },
            old_percentage: flag.rollout_percentage,
            new_percentage: flag.rollout_percentage,
            reason: None,
            changed_by,
            at: Utc::now(),
        };
        let flag = self.commit(flag, change).await?;
        info!(flag = %flag.name, enabled, "Rollout flag toggled");
        Ok(flag)
    }

    /// Force the percentage to 0. `enabled` is left alone so that a later
    /// `update_rollout` resumes without a separate enable step.
    ///
    /// Returns false when the flag was already at 0%: nothing is written and
    /// nobody is notified.
    pub async fn emergency_rollback(
        &self,
        reason: &str,
        changed_by: Option<String>,
    ) -> Result<bool, RolloutError> {
        let _guard = self.mutation.lock().await;
        let previous_percentage = self.snapshot().rollout_percentage;
        if previous_percentage == 0 {
            return Ok(false);
        }

        let flag = self
            .set_percentage(
                0,
                FlagAction::EmergencyRollback,
                Some(reason.to_string()),
                changed_by,
            )
            .await?;
        self.unhealthy_streak.store(0, Ordering::SeqCst);
        self.cancel_gradual_rollout();

        warn!(
            flag = %flag.name,
            previous_percentage,
            "Emergency rollback: {}",
            reason
        );
        self.notifier
            .notify(&NotificationEvent::RollbackTriggered {
                flag: flag.name.clone(),
                reason: reason.to_string(),
                previous_percentage,
            })
            .await;
        Ok(true)
    }

    /// One tick of the automatic rollback policy.
    pub async fn evaluate_health(&self) -> Result<HealthVerdict, RolloutError> {
        let summary = self.health();

        if summary.attempts < self.config.min_samples {
            self.unhealthy_streak.store(0, Ordering::SeqCst);
            return Ok(HealthVerdict::InsufficientSamples);
        }
        if summary.is_healthy {
            self.unhealthy_streak.store(0, Ordering::SeqCst);
            return Ok(HealthVerdict::Healthy);
        }

        let streak = self.unhealthy_streak.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            flag = %self.name(),
            streak,
            success_rate = summary.success_rate,
            error_rate = summary.error_rate,
            avg_processing_ms = summary.avg_processing_ms,
            "Rollout health check failed"
        );
        if streak < self.config.rollback_after_unhealthy_cycles {
            return Ok(HealthVerdict::Unhealthy { streak });
        }

        let reason = format!(
            "automatic rollback: success rate {:.2}%, error rate {:.2}%, avg processing {:.0} ms over {} outcomes",
            summary.success_rate, summary.error_rate, summary.avg_processing_ms, summary.attempts
        );
        let rolled_back = self
            .emergency_rollback(&reason, Some(HEALTH_MONITOR.to_string()))
            .await?;
        // Already at 0%: start counting afresh rather than alerting every tick.
        self.unhealthy_streak.store(0, Ordering::SeqCst);
        Ok(if rolled_back {
            HealthVerdict::RolledBack
        } else {
            HealthVerdict::Unhealthy { streak }
        })
    }

    /// Reload the flag from the store, picking up changes made elsewhere.
    pub async fn refresh(&self) -> Result<RolloutFlag, RolloutError> {
        let _guard = self.mutation.lock().await;
        let name = self.name();
        match self.flags.load_flag(&name).await? {
            Some(flag) => {
                self.store(flag.clone());
                Ok(flag)
            }
            None => Ok(self.snapshot()),
        }
    }
}

/// Periodically refresh each flag, apply the rollback policy and take any
/// due gradual rollout step.
pub async fn health_check_loop(controllers: Vec<Arc<RolloutController>>, period: Duration) {
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        for controller in &controllers {
            if let Err(e) = controller.refresh().await {
                error!(flag = %controller.name(), "Failed to refresh rollout flag: {}", e);
            }
            match controller.evaluate_health().await {
                Ok(HealthVerdict::RolledBack) => {
                    info!(flag = %controller.name(), "Health check triggered rollback")
                }
                Ok(_) => {}
                Err(e) => error!(flag = %controller.name(), "Health check failed: {}", e),
            }
            match controller.run_gradual_step().await {
                Ok(GradualStep::Advanced(percentage)) => {
                    info!(flag = %controller.name(), percentage, "Gradual rollout advanced")
                }
                Ok(_) => {}
                Err(e) => error!(flag = %controller.name(), "Gradual rollout step failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::test_support::RecordingSink;
    use payfirst_core::PAYMENT_FIRST_FLOW;

    async fn controller_with(
        percentage: u8,
        config: RolloutConfig,
    ) -> (Arc<InMemoryRepository>, Arc<RecordingSink>, RolloutController) {
        let repo = Arc::new(InMemoryRepository::new());
        let sink = Arc::new(RecordingSink::default());
        let controller = RolloutController::load(
            RolloutFlag::new(PAYMENT_FIRST_FLOW, true, percentage),
            repo.clone(),
            sink.clone(),
            config,
        )
        .await
        .unwrap();
        (repo, sink, controller)
    }

    #[tokio::test]
    async fn test_assign_flow_bounds_and_disabled() {
        let (_, _, controller) = controller_with(100, RolloutConfig::default()).await;
        assert_eq!(controller.assign_flow("ana@example.com", &[]), FlowVersion::NewFlow);

        controller.update_rollout(0, None).await.unwrap();
        assert_eq!(controller.assign_flow("ana@example.com", &[]), FlowVersion::OldFlow);

        controller.update_rollout(100, None).await.unwrap();
        controller.set_enabled(false, None).await.unwrap();
        assert_eq!(controller.assign_flow("ana@example.com", &[]), FlowVersion::OldFlow);
    }

    #[tokio::test]
    async fn test_force_overrides() {
        let config = RolloutConfig {
            force_enabled: true,
            ..RolloutConfig::default()
        };
        let (_, _, controller) = controller_with(0, config).await;
        assert_eq!(controller.assign_flow("anyone", &[]), FlowVersion::NewFlow);

        let config = RolloutConfig {
            force_enabled: true,
            force_disabled: true,
            ..RolloutConfig::default()
        };
        let (_, _, controller) = controller_with(100, config).await;
        assert_eq!(controller.assign_flow("anyone", &[]), FlowVersion::OldFlow);
    }

    #[tokio::test]
    async fn test_update_rollout_validates_and_audits() {
        let (repo, _, controller) = controller_with(10, RolloutConfig::default()).await;

        let err = controller.update_rollout(101, None).await.unwrap_err();
        assert!(matches!(err, RolloutError::InvalidPercentage(101)));

        controller
            .update_rollout(25, Some("ops@example.com".to_string()))
            .await
            .unwrap();
        let stored = repo.load_flag(PAYMENT_FIRST_FLOW).await.unwrap().unwrap();
        assert_eq!(stored.rollout_percentage, 25);
        let last = stored.history.last().unwrap();
        assert_eq!(last.action, FlagAction::PercentageChanged);
        assert_eq!((last.old_percentage, last.new_percentage), (10, 25));
        assert_eq!(last.changed_by.as_deref(), Some("ops@example.com"));
        assert_eq!(controller.history().len(), stored.history.len());
    }

    #[tokio::test]
    async fn test_manual_rollback_keeps_enabled_and_notifies() {
        let (_, sink, controller) = controller_with(40, RolloutConfig::default()).await;

        assert!(controller.emergency_rollback("bad deploy", None).await.unwrap());
        let flag = controller.snapshot();
        assert!(flag.enabled);
        assert_eq!(flag.rollout_percentage, 0);
        assert_eq!(
            sink.events(),
            vec![NotificationEvent::RollbackTriggered {
                flag: PAYMENT_FIRST_FLOW.to_string(),
                reason: "bad deploy".to_string(),
                previous_percentage: 40,
            }]
        );

        assert!(!controller.emergency_rollback("again", None).await.unwrap());
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_window_rolls_back_exactly_once() {
        let config = RolloutConfig {
            rollback_after_unhealthy_cycles: 2,
            ..RolloutConfig::default()
        };
        let (_, sink, controller) = controller_with(50, config).await;
        for _ in 0..5 {
            controller.record_outcome(true, 500);
        }
        for _ in 0..5 {
            controller.record_outcome(false, 500);
        }

        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::Unhealthy { streak: 1 }
        );
        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::RolledBack
        );
        for _ in 0..6 {
            assert_ne!(
                controller.evaluate_health().await.unwrap(),
                HealthVerdict::RolledBack
            );
        }

        assert_eq!(controller.snapshot().rollout_percentage, 0);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_too_few_samples_never_roll_back() {
        let config = RolloutConfig {
            rollback_after_unhealthy_cycles: 1,
            ..RolloutConfig::default()
        };
        let (_, sink, controller) = controller_with(50, config).await;
        for _ in 0..4 {
            controller.record_outcome(false, 500);
        }
        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::InsufficientSamples
        );
        assert_eq!(controller.snapshot().rollout_percentage, 50);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_healthy_check_resets_streak() {
        let config = RolloutConfig {
            min_samples: 1,
            rollback_after_unhealthy_cycles: 2,
            ..RolloutConfig::default()
        };
        let (_, _, controller) = controller_with(50, config).await;
        controller.record_outcome(false, 10);
        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::Unhealthy { streak: 1 }
        );
        for _ in 0..100 {
            controller.record_outcome(true, 10);
        }
        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::Healthy
        );
        assert_eq!(controller.status().unhealthy_streak, 0);
    }

    #[tokio::test]
    async fn test_advance_rollout_steps_to_target() {
        let (_, _, controller) = controller_with(0, RolloutConfig::default()).await;
        for expected in [10, 20, 25, 25] {
            let flag = controller.advance_rollout(25, 10, None).await.unwrap();
            assert_eq!(flag.rollout_percentage, expected);
        }
        assert!(matches!(
            controller.advance_rollout(50, 0, None).await,
            Err(RolloutError::InvalidStep(0))
        ));
    }

    #[tokio::test]
    async fn test_advance_refused_while_unhealthy() {
        let (_, _, controller) = controller_with(10, RolloutConfig::default()).await;
        controller.record_outcome(false, 10);
        assert!(matches!(
            controller.advance_rollout(50, 10, None).await,
            Err(RolloutError::Unhealthy(_))
        ));
        assert_eq!(controller.snapshot().rollout_percentage, 10);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_other_process_changes() {
        let (repo, _, controller) = controller_with(10, RolloutConfig::default()).await;
        let other = RolloutController::load(
            RolloutFlag::new(PAYMENT_FIRST_FLOW, false, 0),
            repo.clone(),
            Arc::new(RecordingSink::default()),
            RolloutConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(other.snapshot().rollout_percentage, 10);

        other.update_rollout(60, None).await.unwrap();
        assert_eq!(controller.snapshot().rollout_percentage, 10);
        controller.refresh().await.unwrap();
        assert_eq!(controller.snapshot().rollout_percentage, 60);
    }

    #[tokio::test]
    async fn test_target_group_wins_over_bucket_but_not_over_zero() {
        let (repo, _, controller) = controller_with(1, RolloutConfig::default()).await;
        let user = (0..1000)
            .map(|i| format!("user{i}@example.com"))
            .find(|k| !in_rollout(PAYMENT_FIRST_FLOW, k, 1))
            .unwrap();
        let pastors = vec!["pastors".to_string()];
        assert_eq!(controller.assign_flow(&user, &pastors), FlowVersion::OldFlow);

        controller
            .set_target_groups(vec![" pastors ".to_string(), String::new()], None)
            .await
            .unwrap();
        assert_eq!(controller.assign_flow(&user, &pastors), FlowVersion::NewFlow);
        assert_eq!(controller.assign_flow(&user, &[]), FlowVersion::OldFlow);

        let stored = repo.load_flag(PAYMENT_FIRST_FLOW).await.unwrap().unwrap();
        assert_eq!(stored.target_groups, pastors);
        assert_eq!(
            stored.history.last().unwrap().action,
            FlagAction::TargetGroupsChanged
        );

        controller.emergency_rollback("bad deploy", None).await.unwrap();
        assert_eq!(controller.assign_flow(&user, &pastors), FlowVersion::OldFlow);
        controller.update_rollout(50, None).await.unwrap();
        controller.set_enabled(false, None).await.unwrap();
        assert_eq!(controller.assign_flow(&user, &pastors), FlowVersion::OldFlow);
    }

    #[tokio::test]
    async fn test_gradual_rollout_steps_on_schedule_to_target() {
        let (_, _, controller) = controller_with(0, RolloutConfig::default()).await;
        let flag = controller
            .schedule_gradual_rollout(30, 10, 3600, Some("ana".to_string()))
            .await
            .unwrap();
        assert_eq!(flag.rollout_percentage, 10);
        let plan = controller.gradual_rollout().unwrap();
        assert_eq!((plan.target, plan.step, plan.interval_secs), (30, 10, 3600));

        assert_eq!(controller.run_gradual_step().await.unwrap(), GradualStep::NotDue);
        assert_eq!(controller.snapshot().rollout_percentage, 10);

        let due = plan.next_step_at;
        assert_eq!(
            controller.run_gradual_step_at(due).await.unwrap(),
            GradualStep::Advanced(20)
        );
        let next = controller.gradual_rollout().unwrap().next_step_at;
        assert_eq!(next, due + chrono::Duration::hours(1));
        assert_eq!(
            controller.run_gradual_step_at(next).await.unwrap(),
            GradualStep::Completed(30)
        );
        assert!(controller.gradual_rollout().is_none());
        assert_eq!(
            controller.run_gradual_step_at(next).await.unwrap(),
            GradualStep::Idle
        );

        let history = controller.history();
        assert!(history[1..]
            .iter()
            .all(|c| c.action == FlagAction::PercentageChanged
                && c.changed_by.as_deref() == Some("ana")));
    }

    #[tokio::test]
    async fn test_gradual_rollout_halts_when_unhealthy() {
        let (_, _, controller) = controller_with(0, RolloutConfig::default()).await;
        controller
            .schedule_gradual_rollout(100, 10, 60, None)
            .await
            .unwrap();
        controller.record_outcome(false, 10);

        let due = controller.gradual_rollout().unwrap().next_step_at;
        assert_eq!(
            controller.run_gradual_step_at(due).await.unwrap(),
            GradualStep::Halted
        );
        assert!(controller.gradual_rollout().is_none());
        assert_eq!(controller.snapshot().rollout_percentage, 10);
    }

    #[tokio::test]
    async fn test_rollback_cancels_gradual_rollout() {
        let (_, _, controller) = controller_with(0, RolloutConfig::default()).await;
        controller
            .schedule_gradual_rollout(100, 20, 60, None)
            .await
            .unwrap();
        assert!(controller.status().gradual_rollout.is_some());

        controller.emergency_rollback("bad deploy", None).await.unwrap();
        assert!(controller.gradual_rollout().is_none());
        assert_eq!(controller.snapshot().rollout_percentage, 0);

        assert!(matches!(
            controller.schedule_gradual_rollout(100, 20, 0, None).await,
            Err(RolloutError::InvalidInterval(0))
        ));
    }
}
