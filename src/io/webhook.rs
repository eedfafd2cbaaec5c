//! Webhook client for entry notifications

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one delivery attempt
#[derive(Debug)]
pub enum Delivery {
    /// Server answered with a 2xx status
    Delivered { status: u16, latency_us: u64 },
    /// Server answered with a non-2xx status
    Rejected { status: u16, latency_us: u64 },
}

pub struct WebhookClient {
    url: String,
    http_client: reqwest::Client,
    #[cfg(test)]
    mock_enabled: bool,
}

impl WebhookClient {
    /// Create a client with a hard per-request timeout
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Created once for reuse (connection pooling)
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        info!(url = %url, timeout_ms = %timeout.as_millis(), "webhook_client_initialized");

        Ok(Self {
            url: url.to_string(),
            http_client,
            #[cfg(test)]
            mock_enabled: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a JSON payload. Transport errors (including timeouts) are returned.
    pub async fn post<T: Serialize>(&self, payload: &T) -> anyhow::Result<Delivery> {
        let start = Instant::now();
        let body = serde_json::to_vec(payload)?;

        #[cfg(test)]
        if self.mock_enabled {
            let latency_us = start.elapsed().as_micros() as u64;
            debug!(bytes = %body.len(), mock = true, "webhook_posted");
            return Ok(Delivery::Delivered { status: 200, latency_us });
        }

        let response = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let latency_us = start.elapsed().as_micros() as u64;
        let status = response.status();
        debug!(status = %status.as_u16(), latency_us = %latency_us, "webhook_posted");

        if status.is_success() {
            Ok(Delivery::Delivered { status: status.as_u16(), latency_us })
        } else {
            Ok(Delivery::Rejected { status: status.as_u16(), latency_us })
        }
    }

    #[cfg(test)]
    pub(crate) fn mocked(mut self) -> Self {
        self.mock_enabled = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_post() {
        let client = WebhookClient::new("http://127.0.0.1:1/hook", Duration::from_millis(200))
            .unwrap()
            .mocked();
        let delivery = client.post(&json!({"event": "enter"})).await.unwrap();
        assert!(matches!(delivery, Delivery::Delivered { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let client =
            WebhookClient::new("http://127.0.0.1:1/hook", Duration::from_millis(500)).unwrap();
        let result = client.post(&json!({"event": "enter"})).await;
        assert!(result.is_err());
    }
}
