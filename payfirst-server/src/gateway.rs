//! Payment provider client.
//!
//! Only two reads are needed by reconciliation: the current status of a
//! payment and its value (for affiliate commissions). Both come from the same
//! `GET /payments/{id}` resource.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use payfirst_core::PaymentStatus;
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::http_log::create_http_client;

/// Every gateway error is treated as transient by the worker.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway request failed: {0}")]
    Transport(String),

    #[error("payment gateway returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("unexpected payment gateway response: {0}")]
    Decode(String),

    #[error("invalid payment gateway URL: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError>;

    async fn get_payment_value(&self, payment_id: &str) -> Result<Decimal, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct PaymentResource {
    status: PaymentStatus,
    /// Number or numeric string, depending on the provider's serializer.
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
struct PaymentSnapshot {
    status: PaymentStatus,
    value: Decimal,
}

fn decode_payment(body: &str) -> Result<PaymentSnapshot, GatewayError> {
    let resource: PaymentResource =
        serde_json::from_str(body).map_err(|e| GatewayError::Decode(e.to_string()))?;

    let raw_value = match &resource.value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "0".to_string(),
        other => return Err(GatewayError::Decode(format!("payment value {other}"))),
    };
    let value = Decimal::from_str(&raw_value)
        .or_else(|_| Decimal::from_scientific(&raw_value))
        .map_err(|e| GatewayError::Decode(format!("payment value {raw_value:?}: {e}")))?;

    Ok(PaymentSnapshot {
        status: resource.status,
        value,
    })
}

/// HTTP client for the provider's REST API.
pub struct HttpPaymentGateway {
    client: ClientWithMiddleware,
    base_url: Url,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let base_url = base_url.into();
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| GatewayError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = create_http_client("payment-gateway", timeout)
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// `{base}/payments/{id}`, with the id percent-encoded as one segment.
    fn payment_url(&self, payment_id: &str) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("payments")
            .push(payment_id);
        Ok(url)
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentSnapshot, GatewayError> {
        let url = self.payment_url(payment_id)?;
        let response = self
            .client
            .get(url)
            .header("access_token", &self.api_key)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        decode_payment(&body)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn get_payment_status(&self, payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        Ok(self.fetch_payment(payment_id).await?.status)
    }

    async fn get_payment_value(&self, payment_id: &str) -> Result<Decimal, GatewayError> {
        Ok(self.fetch_payment(payment_id).await?.value)
    }
}
