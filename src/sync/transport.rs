//! Wire types and the transport trait used by the sync engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BufferEntry, Metrics, SampleId, TelemetrySample};

/// Errors from a single request/response exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (DNS, refused, reset).
    #[error("network error: {0}")]
    Network(String),

    /// No response within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx or other non-client failure status.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 4xx: the server will never accept this payload.
    #[error("rejected by server {status}: {message}")]
    Rejected { status: u16, message: String },

    /// 2xx with a body that is not an acknowledgment.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Self::Rejected { status, message }
        } else {
            Self::Server { status, message }
        }
    }

    /// Permanent errors are not retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// One sample as sent over the wire. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSample {
    pub id: SampleId,
    pub timestamp: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metrics: Metrics,
}

impl From<&TelemetrySample> for WireSample {
    fn from(sample: &TelemetrySample) -> Self {
        let location = sample.location();
        Self {
            id: sample.id(),
            timestamp: sample.timestamp().timestamp_millis(),
            latitude: location.map(|p| p.latitude),
            longitude: location.map(|p| p.longitude),
            metrics: sample.metrics().clone(),
        }
    }
}

/// Body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub device_id: String,
    pub samples: Vec<WireSample>,
}

impl SyncRequest {
    pub fn from_batch(device_id: impl Into<String>, batch: &[BufferEntry]) -> Self {
        Self {
            device_id: device_id.into(),
            samples: batch.iter().map(|e| WireSample::from(&e.sample)).collect(),
        }
    }
}

/// Successful response: the ids the server has stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResponse {
    pub acknowledged_ids: Vec<SampleId>,
}

/// Accepted acknowledgment bodies: `{"acknowledged_ids": [..]}` or `[..]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AckBody {
    Object { acknowledged_ids: Vec<SampleId> },
    Bare(Vec<SampleId>),
}

impl SyncResponse {
    /// Parse an acknowledgment body.
    pub fn from_body(body: &[u8]) -> Result<Self, TransportError> {
        let parsed: AckBody =
            serde_json::from_slice(body).map_err(|e| TransportError::Decode(e.to_string()))?;
        let acknowledged_ids = match parsed {
            AckBody::Object { acknowledged_ids } => acknowledged_ids,
            AckBody::Bare(ids) => ids,
        };
        Ok(Self { acknowledged_ids })
    }
}

/// Stateless request/response transport to the remote API.
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    async fn send(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{GeoPoint, NewSample};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_status_classification() {
        assert!(TransportError::from_status(400, "bad").is_permanent());
        assert!(TransportError::from_status(422, "invalid").is_permanent());
        assert!(!TransportError::from_status(500, "boom").is_permanent());
        assert!(!TransportError::from_status(503, "busy").is_permanent());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_permanent());
    }

    #[test]
    fn test_ack_body_shapes() {
        let object = SyncResponse::from_body(br#"{"acknowledged_ids": [1, 2]}"#).unwrap();
        assert_eq!(
            object.acknowledged_ids,
            vec![SampleId::new(1), SampleId::new(2)]
        );

        let bare = SyncResponse::from_body(b"[3]").unwrap();
        assert_eq!(bare.acknowledged_ids, vec![SampleId::new(3)]);

        assert!(matches!(
            SyncResponse::from_body(b"{\"ok\": true}"),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_wire_sample_shape() {
        let sample = TelemetrySample::from_parts(
            SampleId::new(9),
            NewSample::new(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap())
                .with_location(GeoPoint::new(1.5, 2.5).unwrap())
                .with_metric("speed", 12.0),
        );

        let json = serde_json::to_value(WireSample::from(&sample)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 9,
                "timestamp": 1_700_000_000_123_i64,
                "latitude": 1.5,
                "longitude": 2.5,
                "metrics": { "speed": 12.0 }
            })
        );
    }
}
