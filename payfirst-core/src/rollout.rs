//! Feature-flag and health types shared by the server and the operator CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the flag guarding the payment-first registration flow.
pub const PAYMENT_FIRST_FLOW: &str = "payment_first_flow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowVersion {
    NewFlow,
    OldFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagAction {
    Created,
    Enabled,
    Disabled,
    PercentageChanged,
    EmergencyRollback,
    TargetGroupsChanged,
}

impl FlagAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagAction::Created => "created",
            FlagAction::Enabled => "enabled",
            FlagAction::Disabled => "disabled",
            FlagAction::PercentageChanged => "percentage_changed",
            FlagAction::EmergencyRollback => "emergency_rollback",
            FlagAction::TargetGroupsChanged => "target_groups_changed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(FlagAction::Created),
            "enabled" => Some(FlagAction::Enabled),
            "disabled" => Some(FlagAction::Disabled),
            "percentage_changed" => Some(FlagAction::PercentageChanged),
            "emergency_rollback" => Some(FlagAction::EmergencyRollback),
            "target_groups_changed" => Some(FlagAction::TargetGroupsChanged),
            _ => None,
        }
    }
}

/// One audit entry in a flag's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutChange {
    pub action: FlagAction,
    pub old_percentage: u8,
    pub new_percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutFlag {
    pub name: String,
    pub enabled: bool,
    /// 0..=100
    pub rollout_percentage: u8,
    /// Members of any of these groups get the new flow whenever the flag is
    /// enabled and above 0%, regardless of their hash bucket.
    #[serde(default)]
    pub target_groups: Vec<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<RolloutChange>,
}

impl RolloutFlag {
    pub fn new(name: impl Into<String>, enabled: bool, rollout_percentage: u8) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            enabled,
            rollout_percentage: rollout_percentage.min(100),
            target_groups: Vec::new(),
            updated_at: now,
            history: vec![RolloutChange {
                action: FlagAction::Created,
                old_percentage: 0,
                new_percentage: rollout_percentage.min(100),
                reason: None,
                changed_by: None,
                at: now,
            }],
        }
    }
}

/// Aggregate over the trailing health window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub window_secs: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Percent, 0..=100. 100 when the window is empty.
    pub success_rate: f64,
    /// Percent, 0..=100. 0 when the window is empty.
    pub error_rate: f64,
    pub avg_processing_ms: f64,
    pub is_healthy: bool,
}

/// A scheduled gradual rollout: raise the flag by `step` every `interval_secs`
/// until it reaches `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradualRollout {
    pub target: u8,
    pub step: u8,
    pub interval_secs: u64,
    pub next_step_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
}

/// Flag state plus health, as returned by the operator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagStatus {
    pub flag: RolloutFlag,
    pub health: HealthSummary,
    pub unhealthy_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradual_rollout: Option<GradualRollout>,
}
