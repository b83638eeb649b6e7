//! Sync Layer
//!
//! Moves buffered samples to the remote API when the network allows.
//!
//! - [`SyncEngine`]: Lease / send / acknowledge cycle with retry and backoff
//! - [`SyncTransport`]: Request/response seam; [`HttpTransport`] is the reqwest implementation
//! - [`BackoffPolicy`]: Exponential delay between failed cycles
//! - [`NetworkSignal`]: Early wake-up when connectivity returns

mod backoff;
pub mod http;
mod engine;
mod transport;

pub use backoff::BackoffPolicy;
pub use engine::{
    CycleOutcome, MAX_BATCH_SIZE, NetworkSignal, SyncConfig, SyncEngine, SyncPhase, SyncStatus,
};
pub use http::{HttpTransport, HttpTransportConfig, REQUEST_ID_HEADER};
pub use transport::{SyncRequest, SyncResponse, SyncTransport, TransportError, WireSample};
