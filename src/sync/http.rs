//! reqwest-backed [`SyncTransport`].

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::transport::{SyncRequest, SyncResponse, SyncTransport, TransportError};

/// Default request timeout (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Correlation header attached to every request.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Longest error body kept in `TransportError` messages.
const MAX_ERROR_BODY: usize = 512;

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    /// Full URL of the sync endpoint, e.g. `https://api.example.com/sync`.
    pub endpoint: String,
    /// Per-request timeout (default: 30s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra request headers (values already env-expanded).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Posts batches as JSON to the remote API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait::async_trait]
impl SyncTransport for HttpTransport {
    async fn send(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let request_id = Uuid::new_v4().to_string();

        let mut builder = self
            .client
            .post(&self.config.endpoint)
            .header(REQUEST_ID_HEADER, &request_id)
            .json(request);
        for (key, value) in &self.config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        tracing::debug!(
            request_id = %request_id,
            endpoint = %self.config.endpoint,
            samples = request.samples.len(),
            "Sending sync batch"
        );

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.config.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.config.timeout)
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        if !status.is_success() {
            let mut message = String::from_utf8_lossy(&body).into_owned();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            tracing::debug!(request_id = %request_id, status = status.as_u16(), "Sync request failed");
            return Err(TransportError::from_status(status.as_u16(), message));
        }

        SyncResponse::from_body(&body)
    }
}
