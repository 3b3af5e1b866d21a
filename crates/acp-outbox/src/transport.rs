//! Event transports.
//!
//! [`HttpTransport`] POSTs the envelope to a webhook endpoint and maps
//! every way that can go wrong into the failure taxonomy. [`LogTransport`]
//! is the no-endpoint fallback: it logs the envelope and succeeds, which
//! keeps the outbox draining in environments without a consumer.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use acp_schemas::EventEnvelope;

use crate::failure::TransportError;

#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), TransportError>;

    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Build a webhook transport with a bounded per-call timeout.
    pub fn new(url: String, timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

/// Parse a seconds-form `Retry-After` response header.
fn retry_after_header(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::connection(err.to_string())
    } else if err.is_request() || err.is_body() || err.is_decode() || err.is_builder() {
        TransportError::transport(err.to_string())
    } else {
        TransportError::unknown(err.to_string())
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .header("X-Message-Key", &envelope.aggregate_id)
            .json(envelope)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = retry_after_header(&resp);
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::http(
            status.as_u16(),
            format!("webhook returned {status}: {body}"),
            retry_after,
        ))
    }

    fn name(&self) -> &'static str {
        "http-webhook"
    }
}

// ---------------------------------------------------------------------------
// LogTransport
// ---------------------------------------------------------------------------

/// Delivery into the log stream; always succeeds.
pub struct LogTransport;

#[async_trait]
impl EventTransport for LogTransport {
    async fn deliver(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        info!(
            event_id = %envelope.id_event,
            event_type = %envelope.event_type,
            aggregate_id = %envelope.aggregate_id,
            "event delivered to log transport"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
