//! Core data types for the storage layer.
//!
//! - [`TelemetrySample`]: Immutable captured reading (location + dashboard metrics)
//! - [`NewSample`]: A reading that has not been assigned an id yet
//! - [`BufferEntry`]: A sample plus its delivery-state metadata
//! - [`Event`]: Structured pipeline event (dropped, rejected, abandoned samples)

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Named dashboard values captured with a sample (e.g. `speed`, `fuel_percentage`).
pub type Metrics = BTreeMap<String, f64>;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

// =============================================================================
// Samples
// =============================================================================

/// Unique, monotonic sample identifier assigned by the durable buffer.
///
/// Ids come from an SQLite `AUTOINCREMENT` column and are never reused,
/// even after the entry has been purged.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SampleId(i64);

impl SampleId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SampleId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// WGS84 coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a coordinate, returning `None` when either axis is out of range.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance to `other` in kilometers (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let (lat1, lon1) = (self.latitude.to_radians(), self.longitude.to_radians());
        let (lat2, lon2) = (other.latitude.to_radians(), other.longitude.to_radians());

        let d_lat = lat2 - lat1;
        let d_lon = lon2 - lon1;

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

/// A captured reading waiting to be appended to the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoPoint>,
    pub metrics: Metrics,
}

impl NewSample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            location: None,
            metrics: Metrics::new(),
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// An immutable captured reading.
///
/// Fields are only readable; once the buffer has assigned the id the sample
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySample {
    id: SampleId,
    timestamp: DateTime<Utc>,
    location: Option<GeoPoint>,
    metrics: Metrics,
}

impl TelemetrySample {
    pub(crate) fn from_parts(id: SampleId, sample: NewSample) -> Self {
        Self {
            id,
            timestamp: sample.timestamp,
            location: sample.location,
            metrics: sample.metrics,
        }
    }

    pub fn id(&self) -> SampleId {
        self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn location(&self) -> Option<GeoPoint> {
        self.location
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

// =============================================================================
// Buffer entries
// =============================================================================

/// Delivery state of a buffered sample.
///
/// Transitions only move forward (`Pending -> InFlight -> Acknowledged`), with
/// the single exception of `InFlight -> Pending` when a send fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EntryState {
    /// Waiting to be leased by the sync engine.
    Pending,
    /// Leased into a batch that is currently being sent.
    InFlight,
    /// Done: delivered, rejected or abandoned.
    Acknowledged,
}

/// Why an entry reached the `Acknowledged` state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeliveryOutcome {
    /// The server acknowledged the sample id.
    Delivered,
    /// The server rejected the payload with a 4xx response.
    Rejected,
    /// The retry ceiling was exceeded.
    Abandoned,
}

/// A sample plus its delivery-state metadata, owned by the durable buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferEntry {
    pub sample: TelemetrySample,
    pub state: EntryState,
    /// Number of concluded send attempts.
    pub attempt_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Set once the entry is acknowledged.
    pub outcome: Option<DeliveryOutcome>,
}

impl BufferEntry {
    pub fn id(&self) -> SampleId {
        self.sample.id()
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct Appended {
    /// Id assigned to the new sample.
    pub id: SampleId,
    /// Pending samples evicted to make room (reported as `SampleDropped`).
    pub dropped: Vec<TelemetrySample>,
}

// =============================================================================
// Events
// =============================================================================

/// Component that emitted an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSource {
    Capture,
    Buffer,
    Sync,
    Maintenance,
    System,
}

/// Event kind classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EventKind {
    /// A pending sample was evicted to make room for a new one.
    SampleDropped,
    /// The server rejected a sample with a client error.
    SampleRejected,
    /// A sample exceeded the retry ceiling.
    DeliveryAbandoned,
    /// An append failed because every buffered entry is in flight.
    StorageFull,
    /// Internal system event (startup, shutdown, maintenance).
    System,
}

/// Event severity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// A pipeline event stored in the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated identifier (None until persisted).
    pub id: Option<i64>,
    pub ts: DateTime<Utc>,
    pub source: EventSource,
    pub kind: EventKind,
    pub severity: EventSeverity,
    pub message: String,
    /// Context snapshot as a JSON object.
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        source: EventSource,
        kind: EventKind,
        severity: EventSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            ts: Utc::now(),
            source,
            kind,
            severity,
            message: message.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.payload {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn sample_dropped(sample: &TelemetrySample) -> Self {
        Self::new(
            EventSource::Buffer,
            EventKind::SampleDropped,
            EventSeverity::Warn,
            format!("Sample {} dropped: buffer at capacity", sample.id()),
        )
        .with_payload("sample_id", sample.id().get())
        .with_payload("timestamp", sample.timestamp().timestamp_millis())
    }

    pub fn sample_rejected(id: SampleId, status: u16, reason: &str) -> Self {
        Self::new(
            EventSource::Sync,
            EventKind::SampleRejected,
            EventSeverity::Error,
            format!("Sample {id} rejected by server ({status})"),
        )
        .with_payload("sample_id", id.get())
        .with_payload("status", status)
        .with_payload("reason", reason)
    }

    pub fn delivery_abandoned(id: SampleId, attempts: u32, last_error: &str) -> Self {
        Self::new(
            EventSource::Sync,
            EventKind::DeliveryAbandoned,
            EventSeverity::Error,
            format!("Sample {id} abandoned after {attempts} attempts"),
        )
        .with_payload("sample_id", id.get())
        .with_payload("attempts", attempts)
        .with_payload("last_error", last_error)
    }

    pub fn storage_full(capacity: usize) -> Self {
        Self::new(
            EventSource::Capture,
            EventKind::StorageFull,
            EventSeverity::Critical,
            "Sample lost: buffer is full of in-flight entries",
        )
        .with_payload("capacity", capacity as u64)
    }

    pub fn system(severity: EventSeverity, message: impl Into<String>) -> Self {
        Self::new(EventSource::System, EventKind::System, severity, message)
    }
}
