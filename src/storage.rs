//! Storage Layer
//!
//! Durable SQLite buffer with async read/write separation:
//! - **Writer**: Async actor task that owns every buffer transition (tokio mpsc channel)
//! - **Reader**: sqlx connection pool for concurrent reads (WAL mode)
//!
//! # Components
//!
//! - [`DurableBuffer`]: append / lease / acknowledge / release via the actor
//! - [`BufferReader`] / [`EventReader`] / [`DashboardReader`]: Async read facades
//! - [`StorageAdmin`]: Retention, backup export and shutdown
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod actor;
mod builder;
mod dashboard;
pub mod db;
mod error;
mod facades;
mod rows;
mod schema;
mod types;

pub use builder::{DEFAULT_CAPACITY, StorageBuilder, StorageHandles};
pub use dashboard::{
    Bucket, DashboardReader, DashboardSummary, MetricSummary, OutcomeCounts, TimeRange,
};
pub use error::StorageError;
pub use facades::{
    BACKUP_PREFIX, BufferReader, BufferStats, DurableBuffer, EntryQuery, EventQuery, EventReader,
    SortOrder, StorageAdmin,
};
pub use types::{
    Appended, BufferEntry, DeliveryOutcome, EARTH_RADIUS_KM, EntryState, Event, EventKind,
    EventSeverity, EventSource, GeoPoint, Metrics, NewSample, SampleId, TelemetrySample,
};
