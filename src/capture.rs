//! Capture Layer
//!
//! Periodic acquisition of location and dashboard telemetry into the durable
//! buffer. The scheduler runs in its own Tokio task and only talks to the
//! rest of the pipeline through [`DurableBuffer`](crate::storage::DurableBuffer).
//!
//! - [`ReadingSource`]: Core trait for location/metric sources
//! - [`CaptureScheduler`]: Idle/Capturing state machine driven by `tick()`
//! - [`HttpReadingSource`]: Polls the dashboard controller's JSON endpoint

pub mod http;
mod scheduler;
mod traits;

pub use http::{HttpReadingSource, HttpSourceConfig, MetricExtraction};
pub use scheduler::{CaptureConfig, CaptureScheduler, CaptureState, TickOutcome};
pub use traits::{AcquisitionError, MIN_INTERVAL, Reading, ReadingSource, SourceError};
