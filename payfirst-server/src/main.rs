use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};

use payfirst_core::{RolloutFlag, PAYMENT_FIRST_FLOW};
use payfirst_server::config::Config;
use payfirst_server::gateway::HttpPaymentGateway;
use payfirst_server::notify::{
    FanoutSink, JsonWebhook, LogNotificationSink, LogWelcomeSender, NotificationSink,
    WelcomeSender,
};
use payfirst_server::operator::router;
use payfirst_server::provisioner::AccountProvisioner;
use payfirst_server::recovery::release_orphaned_work;
use payfirst_server::rollout::health_check_loop;
use payfirst_server::worker::sweep_loop;
use payfirst_server::{AppState, ReconciliationWorker, RolloutController, SqliteRepository};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting payment-first reconciliation service");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let db_path = config.state_dir.join("payfirst-state.db");
    info!("Using state database: {}", db_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    let gateway = Arc::new(
        HttpPaymentGateway::new(
            config.gateway_base_url.clone(),
            config.gateway_api_key.clone(),
            GATEWAY_TIMEOUT,
        )
        .context("Failed to build payment gateway client")?,
    );

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogNotificationSink)];
    let welcome: Arc<dyn WelcomeSender> = match &config.notification_webhook_url {
        Some(url) => {
            info!("Delivering notifications to webhook");
            let webhook = Arc::new(
                JsonWebhook::new(url.clone(), WEBHOOK_TIMEOUT)
                    .context("Failed to build notification webhook client")?,
            );
            sinks.push(webhook.clone());
            webhook
        }
        None => Arc::new(LogWelcomeSender),
    };
    let notifier: Arc<dyn NotificationSink> = Arc::new(FanoutSink::new(sinks));

    let controller = Arc::new(
        RolloutController::load(
            RolloutFlag::new(
                PAYMENT_FIRST_FLOW,
                config.initial_flow_enabled,
                config.initial_flow_percentage,
            ),
            repo.clone(),
            notifier.clone(),
            config.rollout.clone(),
        )
        .await
        .context("Failed to load rollout flag")?,
    );

    let provisioner = Arc::new(AccountProvisioner::new(repo.clone(), gateway.clone()));
    let worker = Arc::new(
        ReconciliationWorker::new(
            repo.clone(),
            gateway,
            provisioner,
            notifier,
            welcome,
            config.worker.clone(),
        )
        .with_rollout(controller.clone()),
    );

    // Release claims orphaned by a previous crash before the first sweep.
    release_orphaned_work(
        repo.as_ref(),
        config.worker.stale_lock_timeout,
        config.worker.max_attempts,
    )
    .await;

    let app_state = Arc::new(AppState {
        store: repo,
        worker: worker.clone(),
        rollouts: HashMap::from([(PAYMENT_FIRST_FLOW.to_string(), controller.clone())]),
        operator_auth_token: config.operator_auth_token.clone(),
    });
    if app_state.operator_auth_token.is_none() {
        info!("OPERATOR_AUTH_TOKEN not set; operator API is disabled");
    }

    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        sweep_loop(worker, sweep_interval).await;
    });

    let health_interval = config.health_check_interval;
    tokio::spawn(async move {
        health_check_loop(vec![controller], health_interval).await;
    });

    let app = router(app_state);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
