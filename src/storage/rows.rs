//! Row types shared by the writer actor and the read facades.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::storage::StorageError;
use crate::storage::types::{
    BufferEntry, DeliveryOutcome, EntryState, Event, EventKind, EventSeverity, EventSource,
    GeoPoint, Metrics, NewSample, SampleId, TelemetrySample,
};

/// Column list matching [`EntryRow`].
pub(crate) const ENTRY_COLUMNS: &str =
    "id, ts, latitude, longitude, metrics, state, attempt_count, last_attempt, outcome";

/// Column list matching [`EventRow`].
pub(crate) const EVENT_COLUMNS: &str = "id, ts, source, kind, severity, message, payload";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub ts: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub metrics: String,
    pub state: String,
    pub attempt_count: i64,
    pub last_attempt: Option<i64>,
    pub outcome: Option<String>,
}

impl TryFrom<EntryRow> for BufferEntry {
    type Error = StorageError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let metrics: Metrics = serde_json::from_str(&row.metrics)?;
        let location = match (row.latitude, row.longitude) {
            (Some(lat), Some(lon)) => GeoPoint::new(lat, lon),
            _ => None,
        };

        let mut sample = NewSample::new(from_millis(row.ts)?).with_metrics(metrics);
        sample.location = location;

        let state = EntryState::from_str(&row.state)
            .map_err(|_| StorageError::InvalidData(format!("unknown entry state '{}'", row.state)))?;
        let outcome = row
            .outcome
            .as_deref()
            .map(|o| {
                DeliveryOutcome::from_str(o)
                    .map_err(|_| StorageError::InvalidData(format!("unknown outcome '{o}'")))
            })
            .transpose()?;

        Ok(BufferEntry {
            sample: TelemetrySample::from_parts(SampleId::new(row.id), sample),
            state,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX),
            last_attempt: row.last_attempt.map(from_millis).transpose()?,
            outcome,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub ts: i64,
    pub source: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub payload: String,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: Some(row.id),
            ts: DateTime::from_timestamp_millis(row.ts).unwrap_or(DateTime::UNIX_EPOCH),
            source: EventSource::from_str(&row.source).unwrap_or(EventSource::System),
            kind: EventKind::from_str(&row.kind).unwrap_or(EventKind::System),
            severity: EventSeverity::from_str(&row.severity).unwrap_or(EventSeverity::Info),
            message: row.message,
            payload: serde_json::from_str(&row.payload).unwrap_or_else(|e| {
                tracing::debug!(error = %e, raw = %row.payload, "Failed to parse event payload");
                serde_json::Value::Object(serde_json::Map::new())
            }),
        }
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {ms}")))
}
