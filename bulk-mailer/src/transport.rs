//! Message transports.
//!
//! The processor only needs `send(to, subject, body)`. Two transports are
//! provided: a simulator for load testing the control plane and an HTTP
//! transport for Mailgun-style `messages` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

/// Pretends to send: logs, waits for `latency`, and fails with the
/// configured probability.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    latency: Duration,
    failure_probability: f64,
}

impl SimulatedTransport {
    pub fn new(latency: Duration, failure_probability: f64) -> Self {
        Self {
            latency,
            failure_probability: failure_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), TransportError> {
        info!(to, subject, "simulated_send_starting");
        sleep(self.latency).await;

        // ThreadRng is not Send; keep it out of scope across awaits.
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_probability {
            info!(to, roll, threshold = self.failure_probability, "simulated_send_failed");
            return Err(TransportError::Rejected {
                to: to.to_string(),
                reason: "simulated failure".to_string(),
            });
        }

        info!(to, "simulated_send_complete");
        Ok(())
    }
}

/// Sends through an HTTP mail API that accepts form-encoded
/// `from`/`to`/`subject`/`text` and basic auth as `api:<key>`.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let form = [
            ("from", self.from.as_str()),
            ("to", to),
            ("subject", subject),
            ("text", body),
        ];

        let resp = self
            .client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(to, error = %e, "http_send_timeout");
                } else {
                    error!(to, error = %e, "http_send_request_error");
                }
                TransportError::Request(e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            let reason = resp.text().await.unwrap_or_default();
            error!(to, status_code = status.as_u16(), "http_send_rejected");
            return Err(TransportError::Rejected {
                to: to.to_string(),
                reason: format!("HTTP {}: {}", status.as_u16(), truncate(&reason, 200)),
            });
        }

        info!(to, status_code = status.as_u16(), "http_send_complete");
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
