//! Core capture traits and types.

use std::time::Duration;

use thiserror::Error;

use crate::storage::{GeoPoint, Metrics};

/// Minimum allowed capture interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Reasons a reading could not be acquired.
///
/// All of them are local and non-fatal: the scheduler skips the tick and
/// tries again on the next one.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The source could not be reached (controller offline, no GPS fix).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The platform refused access to the source.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The source did not answer in time.
    #[error("timeout elapsed after {0:?}")]
    Timeout(Duration),

    /// The source answered with something that is not a reading.
    #[error("malformed reading: {0}")]
    Malformed(String),
}

/// Errors raised while constructing a source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Invalid source configuration (e.g. JSONPath expression).
    #[error("config error: {0}")]
    Config(String),

    /// HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// One raw reading from a source, before it becomes a sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub location: Option<GeoPoint>,
    pub metrics: Metrics,
    /// Device battery level in percent, when the source reports it.
    pub battery_percent: Option<f64>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_battery(mut self, percent: f64) -> Self {
        self.battery_percent = Some(percent);
        self
    }
}

/// A location / telemetry source polled by the capture scheduler.
#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync + 'static {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Acquire one reading.
    async fn read(&self) -> Result<Reading, AcquisitionError>;
}
