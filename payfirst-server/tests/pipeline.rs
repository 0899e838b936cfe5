//! End-to-end tests of the reconciliation pipeline against an on-disk SQLite
//! database, with the payment gateway and notification channels faked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use payfirst_core::{
    FlagAction, NewPendingWork, PaymentStatus, PendingKind, PendingStatus, RolloutFlag,
    SubscriptionContext, UserPayload, PAYMENT_FIRST_FLOW,
};
use payfirst_server::gateway::{GatewayError, PaymentGateway};
use payfirst_server::notify::{
    DeliveryError, NotificationEvent, NotificationSink, WelcomeMessage, WelcomeSender,
};
use payfirst_server::provisioner::AccountProvisioner;
use payfirst_server::repository::{AccountDirectory, Affiliate, FlagRepository};
use payfirst_server::rollout::{HealthVerdict, RolloutConfig};
use payfirst_server::worker::WorkerConfig;
use payfirst_server::{PendingWorkStore, ReconciliationWorker, RolloutController, SqliteRepository};
use rust_decimal::Decimal;
use tempfile::TempDir;

#[derive(Default)]
struct ScriptedGateway {
    payments: Mutex<HashMap<String, PaymentStatus>>,
}

impl ScriptedGateway {
    fn set(&self, payment_id: &str, status: PaymentStatus) {
        self.payments
            .lock()
            .unwrap()
            .insert(payment_id.to_string(), status);
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::Upstream {
                status: 503,
                body: "unavailable".to_string(),
            })
    }

    async fn get_payment_value(&self, _payment_id: &str) -> Result<Decimal, GatewayError> {
        Ok(Decimal::new(19990, 2))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<NotificationEvent>>,
    welcomes: Mutex<Vec<WelcomeMessage>>,
}

#[async_trait]
impl NotificationSink for Recorder {
    async fn notify(&self, event: &NotificationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[async_trait]
impl WelcomeSender for Recorder {
    async fn send_welcome(&self, message: &WelcomeMessage) -> Result<(), DeliveryError> {
        self.welcomes.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn registration(payment_id: &str, affiliate: Option<&str>) -> NewPendingWork {
    NewPendingWork {
        kind: PendingKind::AwaitingAccountCreation,
        payment_id: payment_id.to_string(),
        external_customer_id: Some(format!("cus_{payment_id}")),
        external_subscription_id: Some(format!("sub_{payment_id}")),
        user_payload: UserPayload {
            email: format!("{payment_id}@Example.com"),
            display_name: "Maria Lima".to_string(),
            national_id: "987.654.321-00".to_string(),
            phone: "81988887777".to_string(),
            address: serde_json::json!({"city": "Olinda"}),
            member_type: "member".to_string(),
            credential: "argon2id$hash".to_string(),
        },
        subscription_context: SubscriptionContext {
            plan_id: "plan_monthly".to_string(),
            affiliate_id: affiliate.map(str::to_string),
            revenue_split: None,
        },
    }
}

struct Pipeline {
    repo: Arc<SqliteRepository>,
    recorder: Arc<Recorder>,
    worker: ReconciliationWorker,
}

fn pipeline(db: &std::path::Path, gateway: Arc<ScriptedGateway>, config: WorkerConfig) -> Pipeline {
    let repo = Arc::new(SqliteRepository::new(db).unwrap());
    let recorder = Arc::new(Recorder::default());
    let provisioner = Arc::new(AccountProvisioner::new(repo.clone(), gateway.clone()));
    let worker = ReconciliationWorker::new(
        repo.clone(),
        gateway,
        provisioner,
        recorder.clone(),
        recorder.clone(),
        config,
    );
    Pipeline {
        repo,
        recorder,
        worker,
    }
}

#[tokio::test]
async fn test_confirmed_payment_creates_one_account_and_one_commission() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.set("pay_1", PaymentStatus::Confirmed);
    let p = pipeline(&db, gateway, WorkerConfig::default());

    p.repo
        .upsert_affiliate(&Affiliate {
            id: "aff_1".to_string(),
            code: "MARIA10".to_string(),
            commission_percentage: None,
        })
        .await
        .unwrap();
    let id = p.repo.enqueue(registration("pay_1", Some("MARIA10"))).await.unwrap();

    let report = p.worker.run_sweep().await.unwrap();
    assert_eq!(report.completed, 1);

    let work = p.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(work.status, PendingStatus::Completed);
    let account = p.repo.find_account_by_payment("pay_1").await.unwrap().unwrap();
    assert_eq!(account.email, "pay_1@example.com");
    assert_eq!(account.national_id, "98765432100");
    assert_eq!(account.external_subscription_id.as_deref(), Some("sub_pay_1"));
    assert_eq!(p.repo.count_commissions("pay_1").await.unwrap(), 1);
    assert!(p.recorder.events.lock().unwrap().is_empty());
    assert_eq!(p.recorder.welcomes.lock().unwrap().len(), 1);

    // Re-running provisioning through a manual completion converges.
    let again = p.worker.complete_manually(&id).await.unwrap();
    assert!(again.success);
    assert_eq!(again.account_id, Some(account.id.to_string()));
    assert_eq!(p.repo.count_commissions("pay_1").await.unwrap(), 1);
    assert_eq!(p.recorder.welcomes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_declined_payment_fails_once_and_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    let gateway = Arc::new(ScriptedGateway::default());
    gateway.set("pay_1", PaymentStatus::Declined);

    let id = {
        let p = pipeline(&db, gateway.clone(), WorkerConfig::default());
        let id = p.repo.enqueue(registration("pay_1", None)).await.unwrap();
        assert_eq!(p.worker.run_sweep().await.unwrap().failed, 1);
        assert_eq!(p.recorder.events.lock().unwrap().len(), 1);
        id
    };

    let p = pipeline(&db, gateway, WorkerConfig::default());
    let failed = p.repo.list_failed(Some(PendingKind::AwaitingAccountCreation)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(p.worker.run_sweep().await.unwrap().claimed, 0);
    assert!(p.repo.find_account_by_payment("pay_1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_gateway_outage_exhausts_retries_with_one_alert() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(ScriptedGateway::default());
    let config = WorkerConfig {
        max_attempts: 4,
        ..WorkerConfig::default()
    };
    let p = pipeline(&dir.path().join("state.db"), gateway, config);
    let id = p.repo.enqueue(registration("pay_1", None)).await.unwrap();

    for _ in 0..8 {
        p.worker.run_sweep().await.unwrap();
    }

    let work = p.repo.get(&id).await.unwrap().unwrap();
    assert_eq!(work.status, PendingStatus::Failed);
    assert_eq!(work.attempts, 4);
    assert!(work.last_error.unwrap().contains("503"));
    assert_eq!(p.recorder.events.lock().unwrap().len(), 1);
    let stats = p.repo.stats().await.unwrap();
    assert_eq!((stats.failed, stats.total_attempts), (1, 4));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_on_one_database_never_double_process() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    let gateway = Arc::new(ScriptedGateway::default());
    let config = WorkerConfig {
        batch_size: 7,
        ..WorkerConfig::default()
    };
    let a = pipeline(&db, gateway.clone(), config.clone());
    let b = pipeline(&db, gateway.clone(), config);

    for i in 0..20 {
        let payment_id = format!("pay_{i}");
        gateway.set(&payment_id, PaymentStatus::Received);
        a.repo.enqueue(registration(&payment_id, None)).await.unwrap();
    }

    let mut completed = 0;
    for _ in 0..3 {
        let (ra, rb) = tokio::join!(a.worker.run_sweep(), b.worker.run_sweep());
        completed += ra.unwrap().completed + rb.unwrap().completed;
    }

    assert_eq!(completed, 20);
    let welcomes = a.recorder.welcomes.lock().unwrap().len() + b.recorder.welcomes.lock().unwrap().len();
    assert_eq!(welcomes, 20);
    let stats = a.repo.stats().await.unwrap();
    assert_eq!((stats.completed, stats.pending, stats.processing), (20, 0, 0));
}

#[tokio::test]
async fn test_rollback_is_persisted_and_audited() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    let recorder = Arc::new(Recorder::default());
    let config = RolloutConfig {
        min_samples: 2,
        rollback_after_unhealthy_cycles: 1,
        ..RolloutConfig::default()
    };

    {
        let repo = Arc::new(SqliteRepository::new(&db).unwrap());
        let controller = RolloutController::load(
            RolloutFlag::new(PAYMENT_FIRST_FLOW, true, 30),
            repo,
            recorder.clone(),
            config.clone(),
        )
        .await
        .unwrap();
        controller.record_outcome(false, 100);
        controller.record_outcome(false, 100);
        assert_eq!(
            controller.evaluate_health().await.unwrap(),
            HealthVerdict::RolledBack
        );
    }

    let repo = SqliteRepository::new(&db).unwrap();
    let flag = repo.load_flag(PAYMENT_FIRST_FLOW).await.unwrap().unwrap();
    assert!(flag.enabled);
    assert_eq!(flag.rollout_percentage, 0);
    let actions: Vec<FlagAction> = flag.history.iter().map(|c| c.action).collect();
    assert_eq!(actions, vec![FlagAction::Created, FlagAction::EmergencyRollback]);
    assert_eq!(
        flag.history[1].changed_by.as_deref(),
        Some(payfirst_server::rollout::HEALTH_MONITOR)
    );
    assert_eq!(recorder.events.lock().unwrap().len(), 1);
}
