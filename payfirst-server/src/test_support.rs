//! Fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use payfirst_core::{
    NewPendingWork, PaymentStatus, PendingKind, SubscriptionContext, UserPayload,
};
use rust_decimal::Decimal;

use crate::gateway::{GatewayError, PaymentGateway};
use crate::notify::{DeliveryError, NotificationEvent, NotificationSink, WelcomeMessage, WelcomeSender};

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: &NotificationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
pub struct RecordingWelcome {
    sent: Mutex<Vec<WelcomeMessage>>,
    pub fail: bool,
}

impl RecordingWelcome {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<WelcomeMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl WelcomeSender for RecordingWelcome {
    async fn send_welcome(&self, message: &WelcomeMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(message.clone());
        if self.fail {
            return Err(DeliveryError::Rejected(500));
        }
        Ok(())
    }
}

/// Gateway with scripted per-payment answers. Unknown payments are transport
/// errors.
#[derive(Default)]
pub struct FakeGateway {
    payments: Mutex<HashMap<String, (PaymentStatus, Decimal)>>,
    pub status_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn with_payment(payment_id: &str, status: PaymentStatus, value: Decimal) -> Self {
        let gateway = Self::default();
        gateway.set(payment_id, status, value);
        gateway
    }

    pub fn set(&self, payment_id: &str, status: PaymentStatus, value: Decimal) {
        self.payments
            .lock()
            .unwrap()
            .insert(payment_id.to_string(), (status, value));
    }

    fn lookup(&self, payment_id: &str) -> Result<(PaymentStatus, Decimal), GatewayError> {
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| GatewayError::Transport(format!("connection refused ({payment_id})")))
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(payment_id).map(|(status, _)| status)
    }

    async fn get_payment_value(&self, payment_id: &str) -> Result<Decimal, GatewayError> {
        self.lookup(payment_id).map(|(_, value)| value)
    }
}

pub fn new_work(payment_id: &str) -> NewPendingWork {
    NewPendingWork {
        kind: PendingKind::AwaitingAccountCreation,
        payment_id: payment_id.to_string(),
        external_customer_id: Some("cus_1".to_string()),
        external_subscription_id: Some(format!("sub_{payment_id}")),
        user_payload: UserPayload {
            email: format!("{payment_id}@example.com"),
            display_name: "Ana Souza".to_string(),
            national_id: "123.456.789-01".to_string(),
            phone: "11999999999".to_string(),
            address: serde_json::json!({"city": "Recife", "state": "PE"}),
            member_type: "pastor".to_string(),
            credential: "argon2-hash".to_string(),
        },
        subscription_context: SubscriptionContext {
            plan_id: "plan_annual".to_string(),
            affiliate_id: None,
            revenue_split: None,
        },
    }
}
