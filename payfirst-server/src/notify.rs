//! Outbound notifications: operator alerts and member welcome messages.
//!
//! Delivery is fire-and-forget. A failed delivery is logged and never changes
//! the outcome of the reconciliation or rollout decision that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use payfirst_core::{PendingKind, PendingWorkId};
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::http_log::create_http_client;

/// Events that need a human.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// A pending record exhausted its retries or failed permanently.
    ManualInterventionRequired {
        pending_id: PendingWorkId,
        kind: PendingKind,
        payment_id: String,
        email: String,
        attempts: u32,
        error: String,
    },
    /// A rollout flag was forced to 0%.
    RollbackTriggered {
        flag: String,
        reason: String,
        previous_percentage: u8,
    },
}

impl NotificationEvent {
    pub fn title(&self) -> &'static str {
        match self {
            NotificationEvent::ManualInterventionRequired { .. } => "fallback_system_failure",
            NotificationEvent::RollbackTriggered { .. } => "rollout_emergency_rollback",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Transport(String),

    #[error("delivery endpoint returned {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &NotificationEvent);
}

/// Welcome message sent after an account is created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WelcomeMessage {
    pub account_id: String,
    pub email: String,
    pub display_name: String,
}

#[async_trait]
pub trait WelcomeSender: Send + Sync {
    async fn send_welcome(&self, message: &WelcomeMessage) -> Result<(), DeliveryError>;
}

/// Writes every event to the log at error level.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: &NotificationEvent) {
        match event {
            NotificationEvent::ManualInterventionRequired {
                pending_id,
                kind,
                payment_id,
                attempts,
                error,
                ..
            } => error!(
                title = event.title(),
                %pending_id,
                %kind,
                payment_id = %payment_id,
                attempts,
                "Manual intervention required: {}",
                error
            ),
            NotificationEvent::RollbackTriggered {
                flag,
                reason,
                previous_percentage,
            } => error!(
                title = event.title(),
                flag = %flag,
                previous_percentage,
                "Rollout rolled back: {}",
                reason
            ),
        }
    }
}

/// Posts JSON documents to a fixed URL.
pub struct JsonWebhook {
    client: ClientWithMiddleware,
    url: String,
}

impl JsonWebhook {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = create_http_client("notification-webhook", timeout)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, body: &T) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(DeliveryError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct AlertEnvelope<'a> {
    title: &'static str,
    severity: &'static str,
    sent_at: String,
    event: &'a NotificationEvent,
}

#[derive(Serialize)]
struct WelcomeEnvelope<'a> {
    title: &'static str,
    sent_at: String,
    message: &'a WelcomeMessage,
}

#[async_trait]
impl NotificationSink for JsonWebhook {
    async fn notify(&self, event: &NotificationEvent) {
        let envelope = AlertEnvelope {
            title: event.title(),
            severity: "high",
            sent_at: Utc::now().to_rfc3339(),
            event,
        };
        if let Err(e) = self.post(&envelope).await {
            warn!("Failed to deliver {} notification: {}", event.title(), e);
        }
    }
}

#[async_trait]
impl WelcomeSender for JsonWebhook {
    async fn send_welcome(&self, message: &WelcomeMessage) -> Result<(), DeliveryError> {
        self.post(&WelcomeEnvelope {
            title: "welcome_email",
            sent_at: Utc::now().to_rfc3339(),
            message,
        })
        .await
    }
}

/// Logs the welcome message instead of sending it. Used when no webhook is
/// configured.
pub struct LogWelcomeSender;

#[async_trait]
impl WelcomeSender for LogWelcomeSender {
    async fn send_welcome(&self, message: &WelcomeMessage) -> Result<(), DeliveryError> {
        info!(
            account_id = %message.account_id,
            "Welcome message for {} not sent: no webhook configured",
            message.display_name
        );
        Ok(())
    }
}

/// Delivers each event to every inner sink, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn notify(&self, event: &NotificationEvent) {
        for sink in &self.sinks {
            sink.notify(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    fn rollback() -> NotificationEvent {
        NotificationEvent::RollbackTriggered {
            flag: "payment_first_flow".to_string(),
            reason: "error rate 12%".to_string(),
            previous_percentage: 25,
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(rollback()).unwrap();
        assert_eq!(json["type"], "rollback_triggered");
        assert_eq!(json["previous_percentage"], 25);
    }

    #[test]
    fn test_manual_intervention_title() {
        let event = NotificationEvent::ManualInterventionRequired {
            pending_id: PendingWorkId::new(),
            kind: PendingKind::AwaitingAccountCreation,
            payment_id: "pay_1".to_string(),
            email: "ana@example.com".to_string(),
            attempts: 3,
            error: "payment not confirmed: PENDING".to_string(),
        };
        assert_eq!(event.title(), "fallback_system_failure");
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_every_sink() {
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new(vec![
            a.clone() as Arc<dyn NotificationSink>,
            Arc::new(LogNotificationSink),
            b.clone(),
        ]);

        fanout.notify(&rollback()).await;

        assert_eq!(a.events(), vec![rollback()]);
        assert_eq!(b.events(), vec![rollback()]);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_does_not_panic() {
        let webhook = JsonWebhook::new("http://127.0.0.1:9/alerts", Duration::from_millis(200))
            .unwrap();
        webhook.notify(&rollback()).await;
        let message = WelcomeMessage {
            account_id: "acc_1".to_string(),
            email: "ana@example.com".to_string(),
            display_name: "Ana".to_string(),
        };
        assert!(webhook.send_welcome(&message).await.is_err());
    }
}
