//! Outbound HTTP call logging.
//!
//! Every request to the payment provider or the notification webhook carries a
//! correlation id header and produces one log line with status and latency.
//! Headers are never logged: the gateway authenticates with an `access_token`
//! header.

use std::time::{Duration, Instant};

use axum::http;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

pub struct CallLogMiddleware {
    service: &'static str,
}

impl CallLogMiddleware {
    pub fn new(service: &'static str) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl Middleware for CallLogMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let method = req.method().clone();
        // Path only; query strings may carry identifiers we don't want in logs.
        let path = req.url().path().to_string();
        debug!(
            service = self.service,
            %correlation_id,
            "-> {} {}",
            method,
            path
        );

        let started = Instant::now();
        let result = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(resp) if resp.status().is_success() => info!(
                service = self.service,
                %correlation_id,
                status = resp.status().as_u16(),
                elapsed_ms,
                "{} {}",
                method,
                path
            ),
            Ok(resp) => warn!(
                service = self.service,
                %correlation_id,
                status = resp.status().as_u16(),
                elapsed_ms,
                "{} {} returned non-success status",
                method,
                path
            ),
            Err(err) => warn!(
                service = self.service,
                %correlation_id,
                elapsed_ms,
                "{} {} failed: {}",
                method,
                path,
                err
            ),
        }

        result
    }
}

/// Build a client for one outbound service with call logging attached.
pub fn create_http_client(
    service: &'static str,
    timeout: Duration,
) -> Result<ClientWithMiddleware, reqwest::Error> {
    let client = Client::builder()
        .user_agent(concat!("payfirst/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()?;

    Ok(ClientBuilder::new(client)
        .with(CallLogMiddleware::new(service))
        .build())
}
