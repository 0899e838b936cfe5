//! Reconciliation worker.
//!
//! Each sweep claims a batch of pending records and drives every record to
//! one of three places: `Completed`, back to `Pending` for another try, or
//! `Failed` with a single operator notification. Records are reconciled
//! concurrently with a per-record timeout, and the sweep as a whole stops
//! waiting at its deadline. A record still being checked at that point stays
//! `Processing` and is picked up again through the stale-claim path. Saving a
//! result (and the notification or welcome that goes with it) runs in its own
//! task and finishes even after the sweep has stopped waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use payfirst_core::{
    ManualCompletion, PaymentDisposition, PendingStatus, PendingWork, PendingWorkId, SweepReport,
};
use thiserror::Error;
use tokio::time::{interval, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::gateway::PaymentGateway;
use crate::notify::{NotificationEvent, NotificationSink, WelcomeMessage, WelcomeSender};
use crate::provisioner::{AccountProvisioner, ProvisionOutcome};
use crate::repository::{PendingWorkStore, RepositoryError};
use crate::rollout::RolloutController;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("pending work {0} not found")]
    NotFound(PendingWorkId),

    /// Pending and processing records belong to the sweep.
    #[error("pending work {id} is {status}; only failed or completed records can be completed manually")]
    NotManuallyCompletable {
        id: PendingWorkId,
        status: PendingStatus,
    },

    #[error("pending work {0} changed state while being completed")]
    Contended(PendingWorkId),

    #[error("settlement task failed: {0}")]
    Settlement(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_attempts: u32,
    pub batch_size: usize,
    pub concurrency: usize,
    /// A `Processing` record older than this is considered abandoned.
    pub stale_lock_timeout: Duration,
    pub record_timeout: Duration,
    pub sweep_deadline: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            batch_size: 50,
            concurrency: 4,
            stale_lock_timeout: Duration::from_secs(600),
            record_timeout: Duration::from_secs(30),
            sweep_deadline: Duration::from_secs(240),
        }
    }
}

/// What one reconciliation attempt concluded, before touching the store.
#[derive(Debug)]
enum Attempt {
    Confirmed(ProvisionOutcome),
    /// Worth retrying: payment not confirmed yet, upstream outage, timeout.
    Transient(String),
    /// Will never succeed without a human.
    Permanent(String),
}

/// Where a claimed record ended up after a sweep processed it.
#[derive(Debug)]
enum Settled {
    Completed,
    Retrying(String),
    Failed(String),
    /// The conditional transition did not apply because the record had
    /// already left `Processing`, e.g. another worker reclaimed it after our
    /// claim went stale and settled it first. Transitions only check the
    /// status, so whichever owner settles first wins.
    Lost,
}

struct Processed {
    id: PendingWorkId,
    timed_out: bool,
    settled: Result<Settled, WorkerError>,
}

/// Saves the result of an attempt and sends what goes with it. Cloned into
/// a task of its own for every settled record.
#[derive(Clone)]
struct Settler {
    store: Arc<dyn PendingWorkStore>,
    notifier: Arc<dyn NotificationSink>,
    welcome: Arc<dyn WelcomeSender>,
    rollout: Option<Arc<RolloutController>>,
    max_attempts: u32,
}

pub struct ReconciliationWorker {
    store: Arc<dyn PendingWorkStore>,
    gateway: Arc<dyn PaymentGateway>,
    provisioner: Arc<AccountProvisioner>,
    settler: Settler,
    config: WorkerConfig,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<dyn PendingWorkStore>,
        gateway: Arc<dyn PaymentGateway>,
        provisioner: Arc<AccountProvisioner>,
        notifier: Arc<dyn NotificationSink>,
        welcome: Arc<dyn WelcomeSender>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            settler: Settler {
                store: store.clone(),
                notifier,
                welcome,
                rollout: None,
                max_attempts: config.max_attempts,
            },
            store,
            gateway,
            provisioner,
            config,
        }
    }

    /// Feed terminal outcomes into this controller's health window.
    pub fn with_rollout(mut self, controller: Arc<RolloutController>) -> Self {
        self.settler.rollout = Some(controller);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim one batch and reconcile it.
    ///
    /// Safe to call concurrently, from this process or another: the claim is
    /// the only mutual exclusion needed.
    pub async fn run_sweep(&self) -> Result<SweepReport, WorkerError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.sweep_deadline;

        let claimed = self
            .store
            .claim_batch(
                self.config.batch_size,
                self.config.stale_lock_timeout,
                self.config.max_attempts,
            )
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        info!("Claimed {} pending records", claimed.len());

        let mut results = stream::iter(claimed)
            .map(|work| self.process(work))
            .buffer_unordered(self.config.concurrency.max(1));

        let mut handled = 0;
        loop {
            match timeout_at(deadline, results.next()).await {
                Ok(Some(processed)) => {
                    handled += 1;
                    tally(&mut report, processed);
                }
                Ok(None) => break,
                Err(_) => {
                    report.abandoned = report.claimed - handled;
                    warn!(
                        abandoned = report.abandoned,
                        "Sweep deadline reached; unreported records finish in the background or are reclaimed once stale"
                    );
                    break;
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn process(&self, work: PendingWork) -> Processed {
        let started = Instant::now();
        let (attempt, timed_out) = match timeout(self.config.record_timeout, self.attempt(&work)).await
        {
            Ok(attempt) => (attempt, false),
            Err(_) => (
                Attempt::Transient(format!(
                    "reconciliation timed out after {}s",
                    self.config.record_timeout.as_secs_f64()
                )),
                true,
            ),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let id = work.id;
        let settler = self.settler.clone();
        let settled = tokio::spawn(async move { settler.settle(&work, attempt, elapsed_ms).await })
            .await
            .unwrap_or_else(|e| Err(WorkerError::Settlement(e.to_string())));

        Processed {
            id,
            timed_out,
            settled,
        }
    }

    /// Check the payment and, if it is confirmed, provision the account.
    /// Nothing here changes the record's status.
    async fn attempt(&self, work: &PendingWork) -> Attempt {
        let status = match self.gateway.get_payment_status(&work.payment_id).await {
            Ok(status) => status,
            Err(e) => return Attempt::Transient(format!("payment gateway error: {e}")),
        };

        match status.disposition() {
            PaymentDisposition::NotYetConfirmed => {
                return Attempt::Transient(format!("payment not confirmed: {status}"))
            }
            PaymentDisposition::Rejected => {
                return Attempt::Permanent(format!("payment rejected: {status}"))
            }
            PaymentDisposition::Confirmed => {}
        }

        match self.provisioner.provision(work).await {
            Ok(outcome) => Attempt::Confirmed(outcome),
            Err(e) if e.is_permanent() => Attempt::Permanent(e.to_string()),
            Err(e) => Attempt::Transient(e.to_string()),
        }
    }

    /// Operator-triggered reconciliation of a single record.
    ///
    /// A `Failed` record is claimed, reconciled and moved to `Completed` or
    /// back to `Failed` (without another notification). A `Completed` record
    /// is re-checked as a no-op and stays `Completed`.
    pub async fn complete_manually(
        &self,
        id: &PendingWorkId,
    ) -> Result<ManualCompletion, WorkerError> {
        let work = self
            .store
            .get(id)
            .await?
            .ok_or(WorkerError::NotFound(*id))?;

        match work.status {
            PendingStatus::Pending | PendingStatus::Processing => {
                Err(WorkerError::NotManuallyCompletable {
                    id: *id,
                    status: work.status,
                })
            }
            PendingStatus::Completed => {
                let attempt = self.attempt_with_timeout(&work).await;
                Ok(match attempt {
                    Attempt::Confirmed(outcome) => ManualCompletion {
                        id: *id,
                        status: PendingStatus::Completed,
                        success: true,
                        account_id: Some(outcome.account_id.to_string()),
                        error: None,
                    },
                    Attempt::Transient(reason) | Attempt::Permanent(reason) => ManualCompletion {
                        id: *id,
                        status: PendingStatus::Completed,
                        success: false,
                        account_id: None,
                        error: Some(reason),
                    },
                })
            }
            PendingStatus::Failed => {
                let work = self
                    .store
                    .begin_manual(id)
                    .await?
                    .ok_or(WorkerError::Contended(*id))?;
                info!(id = %id, payment_id = %work.payment_id, "Manual completion started");

                match self.attempt_with_timeout(&work).await {
                    Attempt::Confirmed(outcome) => {
                        if !self.store.mark_completed(id).await? {
                            return Err(WorkerError::Contended(*id));
                        }
                        info!(id = %id, account_id = %outcome.account_id, "Manual completion succeeded");
                        if outcome.created {
                            self.settler.send_welcome(&work, &outcome).await;
                        }
                        Ok(ManualCompletion {
                            id: *id,
                            status: PendingStatus::Completed,
                            success: true,
                            account_id: Some(outcome.account_id.to_string()),
                            error: None,
                        })
                    }
                    Attempt::Transient(reason) | Attempt::Permanent(reason) => {
                        // Operators already know about this record.
                        self.store.mark_failed(id, &reason).await?;
                        warn!(id = %id, "Manual completion failed: {}", reason);
                        Ok(ManualCompletion {
                            id: *id,
                            status: PendingStatus::Failed,
                            success: false,
                            account_id: None,
                            error: Some(reason),
                        })
                    }
                }
            }
        }
    }

    async fn attempt_with_timeout(&self, work: &PendingWork) -> Attempt {
        timeout(self.config.record_timeout, self.attempt(work))
            .await
            .unwrap_or_else(|_| {
                Attempt::Transient(format!(
                    "reconciliation timed out after {}s",
                    self.config.record_timeout.as_secs_f64()
                ))
            })
    }
}

impl Settler {
    async fn settle(
        &self,
        work: &PendingWork,
        attempt: Attempt,
        elapsed_ms: u64,
    ) -> Result<Settled, WorkerError> {
        match attempt {
            Attempt::Confirmed(outcome) => {
                if !self.store.mark_completed(&work.id).await? {
                    warn!(id = %work.id, "Record was reclaimed before completion could be saved");
                    return Ok(Settled::Lost);
                }
                info!(
                    id = %work.id,
                    payment_id = %work.payment_id,
                    account_id = %outcome.account_id,
                    created = outcome.created,
                    "Pending registration completed"
                );
                self.record_outcome(true, elapsed_ms);
                if outcome.created {
                    self.send_welcome(work, &outcome).await;
                }
                Ok(Settled::Completed)
            }
            Attempt::Transient(reason) if work.attempts + 1 < self.max_attempts => {
                match self.store.mark_retry(&work.id, &reason).await? {
                    Some(attempts) => {
                        info!(
                            id = %work.id,
                            attempts,
                            max_attempts = self.max_attempts,
                            "Will retry: {}",
                            reason
                        );
                        Ok(Settled::Retrying(reason))
                    }
                    None => Ok(Settled::Lost),
                }
            }
            Attempt::Transient(reason) | Attempt::Permanent(reason) => {
                self.fail(work, reason, elapsed_ms).await
            }
        }
    }

    /// Mark the record `Failed` and, only if that transition was ours, alert
    /// an operator.
    async fn fail(
        &self,
        work: &PendingWork,
        reason: String,
        elapsed_ms: u64,
    ) -> Result<Settled, WorkerError> {
        let Some(attempts) = self.store.mark_failed(&work.id, &reason).await? else {
            return Ok(Settled::Lost);
        };

        error!(
            id = %work.id,
            payment_id = %work.payment_id,
            attempts,
            "Pending registration failed: {}",
            reason
        );
        self.record_outcome(false, elapsed_ms);
        self.notifier
            .notify(&NotificationEvent::ManualInterventionRequired {
                pending_id: work.id,
                kind: work.kind,
                payment_id: work.payment_id.clone(),
                email: work.user_payload.email.clone(),
                attempts,
                error: reason.clone(),
            })
            .await;
        Ok(Settled::Failed(reason))
    }

    fn record_outcome(&self, success: bool, elapsed_ms: u64) {
        if let Some(rollout) = &self.rollout {
            rollout.record_outcome(success, elapsed_ms);
        }
    }

    async fn send_welcome(&self, work: &PendingWork, outcome: &ProvisionOutcome) {
        let message = WelcomeMessage {
            account_id: outcome.account_id.to_string(),
            email: work.user_payload.email.clone(),
            display_name: work.user_payload.display_name.clone(),
        };
        if let Err(e) = self.welcome.send_welcome(&message).await {
            warn!(id = %work.id, "Failed to send welcome message: {}", e);
        }
    }
}

fn tally(report: &mut SweepReport, processed: Processed) {
    if processed.timed_out {
        report.timed_out += 1;
    }
    match processed.settled {
        Ok(Settled::Completed) => report.completed += 1,
        Ok(Settled::Retrying(reason)) => {
            report.retried += 1;
            report.errors.push(format!("{}: {}", processed.id, reason));
        }
        Ok(Settled::Failed(reason)) => {
            report.failed += 1;
            report.errors.push(format!("{}: {}", processed.id, reason));
        }
        Ok(Settled::Lost) => {}
        Err(e) => {
            error!(id = %processed.id, "Failed to record reconciliation result: {}", e);
            report.errors.push(format!("{}: {}", processed.id, e));
        }
    }
}

/// Run a sweep every `period`. Errors are logged; the loop never exits.
pub async fn sweep_loop(worker: Arc<ReconciliationWorker>, period: Duration) {
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        match worker.run_sweep().await {
            Ok(report) if report.claimed == 0 => debug!("No pending work to process"),
            Ok(report) => info!(
                timed_out = report.timed_out,
                abandoned = report.abandoned,
                duration_ms = report.duration_ms,
                "Sweep finished: {}",
                report.message()
            ),
            Err(e) => error!("Error running reconciliation sweep: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::repository::{AccountDirectory, InMemoryRepository};
    use crate::rollout::RolloutConfig;
    use crate::test_support::{new_work, FakeGateway, RecordingSink, RecordingWelcome};
    use async_trait::async_trait;
    use payfirst_core::{PaymentStatus, RolloutFlag, PAYMENT_FIRST_FLOW};
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        sink: Arc<RecordingSink>,
        welcome: Arc<RecordingWelcome>,
        worker: ReconciliationWorker,
    }

    fn fixture_with(
        gateway: Arc<dyn PaymentGateway>,
        welcome: RecordingWelcome,
        config: WorkerConfig,
    ) -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let sink = Arc::new(RecordingSink::default());
        let welcome = Arc::new(welcome);
        let provisioner = Arc::new(AccountProvisioner::new(repo.clone(), gateway.clone()));
        let worker = ReconciliationWorker::new(
            repo.clone(),
            gateway,
            provisioner,
            sink.clone(),
            welcome.clone(),
            config,
        );
        Fixture {
            repo,
            sink,
            welcome,
            worker,
        }
    }

    fn fixture(gateway: Arc<FakeGateway>) -> Fixture {
        fixture_with(gateway, RecordingWelcome::default(), WorkerConfig::default())
    }

    fn gateway_with(status: PaymentStatus) -> Arc<FakeGateway> {
        Arc::new(FakeGateway::with_payment(
            "pay_1",
            status,
            Decimal::new(10000, 2),
        ))
    }

    /// A gateway that never answers within the test's timeouts.
    struct SlowGateway(Duration);

    #[async_trait]
    impl PaymentGateway for SlowGateway {
        async fn get_payment_status(&self, _: &str) -> Result<PaymentStatus, GatewayError> {
            tokio::time::sleep(self.0).await;
            Ok(PaymentStatus::Confirmed)
        }

        async fn get_payment_value(&self, _: &str) -> Result<Decimal, GatewayError> {
            Ok(Decimal::ONE_HUNDRED)
        }
    }

    /// Records events, but only after sitting on each one for a while.
    struct SlowSink {
        delay: Duration,
        inner: RecordingSink,
    }

    #[async_trait]
    impl NotificationSink for SlowSink {
        async fn notify(&self, event: &NotificationEvent) {
            tokio::time::sleep(self.delay).await;
            self.inner.notify(event).await;
        }
    }

    #[tokio::test]
    async fn test_confirmed_payment_completes_with_one_account() {
        let f = fixture(gateway_with(PaymentStatus::Confirmed));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!((report.claimed, report.completed), (1, 1));
        assert!(report.errors.is_empty());

        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Completed);
        let account = f.repo.find_account_by_payment("pay_1").await.unwrap().unwrap();
        assert_eq!(account.email, "pay_1@example.com");
        assert!(f.sink.events().is_empty());
        assert_eq!(f.welcome.sent().len(), 1);

        let again = f.worker.run_sweep().await.unwrap();
        assert_eq!(again.claimed, 0);
    }

    #[tokio::test]
    async fn test_declined_payment_fails_after_one_cycle() {
        let f = fixture(gateway_with(PaymentStatus::Declined));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!(report.failed, 1);

        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Failed);
        assert_eq!(work.last_error.as_deref(), Some("payment rejected: DECLINED"));
        assert!(f.repo.find_account_by_payment("pay_1").await.unwrap().is_none());

        let events = f.sink.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NotificationEvent::ManualInterventionRequired { attempts: 1, payment_id, .. }
                if payment_id == "pay_1"
        ));
    }

    #[tokio::test]
    async fn test_unconfirmed_payment_retries_exactly_max_attempts() {
        let gateway = gateway_with(PaymentStatus::Pending);
        let f = fixture(gateway.clone());
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let first = f.worker.run_sweep().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(first.errors, vec![format!("{id}: payment not confirmed: PENDING")]);

        for _ in 0..5 {
            f.worker.run_sweep().await.unwrap();
        }

        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Failed);
        assert_eq!(work.attempts, 3);
        assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_outage_is_retried_then_completes() {
        let gateway = Arc::new(FakeGateway::default());
        let f = fixture(gateway.clone());
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        assert_eq!(f.worker.run_sweep().await.unwrap().retried, 1);
        gateway.set("pay_1", PaymentStatus::Received, Decimal::ONE_HUNDRED);
        assert_eq!(f.worker.run_sweep().await.unwrap().completed, 1);

        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Completed);
        assert_eq!(work.attempts, 1);
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_without_retry() {
        let f = fixture(gateway_with(PaymentStatus::Confirmed));
        let mut new = new_work("pay_1");
        new.user_payload.national_id = "123".to_string();
        let id = f.repo.enqueue(new).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            f.repo.get(&id).await.unwrap().unwrap().status,
            PendingStatus::Failed
        );
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_welcome_failure_does_not_fail_record() {
        let f = fixture_with(
            gateway_with(PaymentStatus::Confirmed),
            RecordingWelcome::failing(),
            WorkerConfig::default(),
        );
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            f.repo.get(&id).await.unwrap().unwrap().status,
            PendingStatus::Completed
        );
        assert_eq!(f.welcome.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_completion_is_idempotent() {
        let gateway = gateway_with(PaymentStatus::Declined);
        let f = fixture(gateway.clone());
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();
        f.worker.run_sweep().await.unwrap();

        gateway.set("pay_1", PaymentStatus::Confirmed, Decimal::ONE_HUNDRED);
        let first = f.worker.complete_manually(&id).await.unwrap();
        assert!(first.success);
        assert_eq!(first.status, PendingStatus::Completed);

        let second = f.worker.complete_manually(&id).await.unwrap();
        assert!(second.success);
        assert_eq!(second.status, PendingStatus::Completed);
        assert_eq!(second.account_id, first.account_id);

        let account = f.repo.find_account_by_email("pay_1@example.com").await.unwrap().unwrap();
        assert_eq!(Some(account.id.to_string()), first.account_id);
        assert_eq!(f.sink.events().len(), 1);
        assert_eq!(f.welcome.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_manual_attempt_does_not_renotify() {
        let f = fixture(gateway_with(PaymentStatus::Cancelled));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();
        f.worker.run_sweep().await.unwrap();

        let result = f.worker.complete_manually(&id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.status, PendingStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("payment rejected: CANCELLED"));
        assert_eq!(
            f.repo.get(&id).await.unwrap().unwrap().status,
            PendingStatus::Failed
        );
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_completion_rejects_records_owned_by_sweep() {
        let f = fixture(gateway_with(PaymentStatus::Confirmed));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let err = f.worker.complete_manually(&id).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::NotManuallyCompletable {
                status: PendingStatus::Pending,
                ..
            }
        ));

        let missing = PendingWorkId::new();
        assert!(matches!(
            f.worker.complete_manually(&missing).await,
            Err(WorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_outcomes_feed_rollout_health() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.set("pay_1", PaymentStatus::Confirmed, Decimal::ONE_HUNDRED);
        gateway.set("pay_2", PaymentStatus::Declined, Decimal::ONE_HUNDRED);
        gateway.set("pay_3", PaymentStatus::Pending, Decimal::ONE_HUNDRED);
        let f = fixture(gateway);
        let controller = Arc::new(
            RolloutController::load(
                RolloutFlag::new(PAYMENT_FIRST_FLOW, true, 50),
                f.repo.clone(),
                f.sink.clone(),
                RolloutConfig::default(),
            )
            .await
            .unwrap(),
        );
        let worker = f.worker.with_rollout(controller.clone());
        for pid in ["pay_1", "pay_2", "pay_3"] {
            f.repo.enqueue(new_work(pid)).await.unwrap();
        }

        worker.run_sweep().await.unwrap();

        let health = controller.health();
        assert_eq!((health.successes, health.failures), (1, 1));
    }

    #[tokio::test]
    async fn test_record_timeout_counts_as_retry() {
        let config = WorkerConfig {
            record_timeout: Duration::from_millis(20),
            ..WorkerConfig::default()
        };
        let f = fixture_with(
            Arc::new(SlowGateway(Duration::from_secs(5))),
            RecordingWelcome::default(),
            config,
        );
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!((report.timed_out, report.retried), (1, 1));
        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Pending);
        assert_eq!(work.attempts, 1);
    }

    #[tokio::test]
    async fn test_sweep_deadline_leaves_records_processing() {
        let config = WorkerConfig {
            sweep_deadline: Duration::from_millis(20),
            ..WorkerConfig::default()
        };
        let f = fixture_with(
            Arc::new(SlowGateway(Duration::from_secs(5))),
            RecordingWelcome::default(),
            config,
        );
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = f.worker.run_sweep().await.unwrap();
        assert_eq!((report.claimed, report.abandoned), (1, 1));
        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Processing);
        assert_eq!(work.attempts, 0);
    }

    #[tokio::test]
    async fn test_sweep_deadline_does_not_cut_off_failure_notification() {
        let repo = Arc::new(InMemoryRepository::new());
        let gateway = gateway_with(PaymentStatus::Declined);
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(300),
            inner: RecordingSink::default(),
        });
        let worker = ReconciliationWorker::new(
            repo.clone(),
            gateway.clone(),
            Arc::new(AccountProvisioner::new(repo.clone(), gateway)),
            sink.clone(),
            Arc::new(RecordingWelcome::default()),
            WorkerConfig {
                sweep_deadline: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );
        let id = repo.enqueue(new_work("pay_1")).await.unwrap();

        let report = worker.run_sweep().await.unwrap();
        assert_eq!((report.claimed, report.abandoned), (1, 1));
        for _ in 0..3 {
            assert_eq!(worker.run_sweep().await.unwrap().claimed, 0);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(
            repo.get(&id).await.unwrap().unwrap().status,
            PendingStatus::Failed
        );
        assert_eq!(sink.inner.events().len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_manual_completion_is_not_resurrected() {
        let f = fixture(gateway_with(PaymentStatus::Pending));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();
        for _ in 0..3 {
            f.worker.run_sweep().await.unwrap();
        }
        assert_eq!(f.repo.get(&id).await.unwrap().unwrap().attempts, 3);

        // An operator starts a completion and the process dies mid-way.
        f.repo.begin_manual(&id).await.unwrap().unwrap();
        f.repo.backdate(&id, chrono::Duration::minutes(20)).await;
        crate::recovery::release_orphaned_work(
            f.repo.as_ref(),
            f.worker.config().stale_lock_timeout,
            f.worker.config().max_attempts,
        )
        .await;
        for _ in 0..5 {
            f.worker.run_sweep().await.unwrap();
        }

        let work = f.repo.get(&id).await.unwrap().unwrap();
        assert_eq!(work.status, PendingStatus::Failed);
        assert_eq!(work.attempts, 3);
        assert_eq!(f.repo.list_failed(None).await.unwrap().len(), 1);
        assert_eq!(f.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_late_owner_loses_to_whoever_settles_first() {
        let f = fixture(gateway_with(PaymentStatus::Declined));
        let id = f.repo.enqueue(new_work("pay_1")).await.unwrap();
        let stale = f.repo.claim_batch(10, Duration::from_secs(600), 3).await.unwrap();
        f.repo.backdate(&id, chrono::Duration::minutes(20)).await;

        // A second worker takes over the stale claim and fails the record.
        assert_eq!(f.worker.run_sweep().await.unwrap().failed, 1);

        // The original owner's transition no longer applies.
        assert_eq!(f.repo.mark_failed(&stale[0].id, "late").await.unwrap(), None);
        assert!(!f.repo.mark_completed(&stale[0].id).await.unwrap());
        assert_eq!(f.sink.events().len(), 1);
    }
}
