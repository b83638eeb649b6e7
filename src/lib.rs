//! Activa Sync - offline-resilient telemetry for the ActivadasBoard dashboard
//!
//! Captures location and dashboard readings on a fixed cadence, keeps them in
//! a durable SQLite buffer that survives restarts, and drains the buffer to a
//! remote API whenever the network allows. It can be used as a library or run
//! as the standalone `activa-sync` binary.
//!
//! # Architecture
//!
//! - **Capture**: [`CaptureScheduler`] polls a [`ReadingSource`] and appends samples
//! - **Storage**: [`DurableBuffer`] actor over SQLite (Pending / InFlight / Acknowledged)
//! - **Sync**: [`SyncEngine`] leases batches, sends them, acknowledges or retries
//! - **Maintenance**: cron-scheduled retention and JSON backups
//! - **Presentation**: read-only JSON API for the dashboard
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use activa_sync::{
//!     EventRecorder, HttpTransport, HttpTransportConfig, NetworkSignal, StorageBuilder,
//!     SyncConfig, SyncEngine, SystemClock,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handles = StorageBuilder::new("data/activa.db").build().await?;
//!     let transport = HttpTransport::new(HttpTransportConfig::new("https://api.example.com/sync"))?;
//!
//!     let engine = SyncEngine::new(
//!         SyncConfig::default(),
//!         handles.buffer.clone(),
//!         Arc::new(transport),
//!         Arc::new(EventRecorder::new(handles.buffer.clone())),
//!         Arc::new(SystemClock),
//!     );
//!     let shutdown = CancellationToken::new();
//!     engine.run(NetworkSignal::new(), shutdown).await;
//!
//!     handles.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod clock;
pub mod config;
pub mod maintenance;
pub mod server;
pub mod sink;
pub mod storage;
pub mod sync;

pub use capture::{
    AcquisitionError, CaptureConfig, CaptureScheduler, CaptureState, HttpReadingSource,
    HttpSourceConfig, Reading, ReadingSource, TickOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use maintenance::{MaintenanceScheduler, RetentionConfig, RetentionTask, Schedule};
pub use sink::{ChannelSink, ErrorSink, EventRecorder, TracingSink};
pub use storage::{
    BufferEntry, BufferReader, BufferStats, DashboardReader, DashboardSummary, DeliveryOutcome,
    DurableBuffer, EntryState, Event, EventKind, EventReader, EventSeverity, EventSource,
    GeoPoint, NewSample, SampleId, StorageAdmin, StorageBuilder, StorageError, StorageHandles,
    TelemetrySample,
};
pub use sync::{
    CycleOutcome, HttpTransport, HttpTransportConfig, NetworkSignal, SyncConfig, SyncEngine,
    SyncPhase, SyncStatus, SyncTransport, TransportError,
};
