use serde::{Deserialize, Serialize};

use crate::pending::{PendingStatus, PendingWorkId};

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Records left in `Processing` because the sweep deadline passed.
    pub abandoned: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SweepReport {
    pub fn message(&self) -> String {
        if self.claimed == 0 {
            return "no pending work to process".to_string();
        }
        format!(
            "processed {} pending records: {} completed, {} retrying, {} failed",
            self.claimed, self.completed, self.retried, self.failed
        )
    }
}

/// Result of an operator-triggered completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualCompletion {
    pub id: PendingWorkId,
    pub status: PendingStatus,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
