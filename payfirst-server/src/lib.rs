pub mod config;
pub mod gateway;
pub mod http_log;
pub mod notify;
pub mod operator;
pub mod provisioner;
pub mod recovery;
pub mod repository;
pub mod rollout;
pub mod worker;

#[cfg(test)]
mod test_support;

use std::collections::HashMap;
use std::sync::Arc;

pub use repository::{InMemoryRepository, PendingWorkStore, RepositoryError, SqliteRepository};
pub use rollout::RolloutController;
pub use worker::ReconciliationWorker;

/// Shared state behind the operator API.
pub struct AppState {
    pub store: Arc<dyn PendingWorkStore>,
    pub worker: Arc<ReconciliationWorker>,
    /// Rollout controllers by flag name.
    pub rollouts: HashMap<String, Arc<RolloutController>>,
    pub operator_auth_token: Option<String>,
}
