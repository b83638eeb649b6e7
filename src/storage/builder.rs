//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::storage::StorageError;
use crate::storage::actor::BufferActor;
use crate::storage::db::SqlitePool;
use crate::storage::{BufferReader, DashboardReader, DurableBuffer, EventReader, StorageAdmin};

/// Default maximum number of buffered entries.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default channel capacity for writer commands.
const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

enum Target {
    Path(PathBuf),
    Url(String),
}

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    target: Target,
    capacity: usize,
    channel_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl StorageBuilder {
    /// Create a storage builder for a database file, creating parent
    /// directories as needed.
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self::with_target(Target::Path(db_path.as_ref().to_path_buf()))
    }

    /// Create a storage builder from an sqlx connection URL
    /// (e.g. `sqlite::memory:`).
    pub fn from_url(url: impl Into<String>) -> Self {
        Self::with_target(Target::Url(url.into()))
    }

    fn with_target(target: Target) -> Self {
        Self {
            target,
            capacity: DEFAULT_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }

    /// Set the maximum number of buffered entries.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the channel capacity for writer commands.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the clock used for attempt and acknowledgment timestamps.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Open the database, spawn the writer actor and return handles.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        if self.capacity == 0 {
            return Err(StorageError::InvalidData(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }

        let pool = match &self.target {
            Target::Path(path) => SqlitePool::open(path).await?,
            Target::Url(url) => SqlitePool::connect(url).await?,
        };

        let (actor_handle, tx) = BufferActor::spawn(
            pool.inner().clone(),
            self.capacity,
            self.channel_capacity.max(1),
            Arc::clone(&self.clock),
        )
        .await?;

        let reader_pool = pool.inner().clone();
        Ok(StorageHandles {
            buffer: DurableBuffer::new(tx.clone()),
            buffer_reader: BufferReader::new(reader_pool.clone()),
            event_reader: EventReader::new(reader_pool.clone()),
            dashboard: DashboardReader::new(reader_pool.clone()),
            admin: StorageAdmin::new(tx, reader_pool, self.clock),
            pool,
            actor_handle: Some(actor_handle),
        })
    }
}

/// Handles to all storage layer facades.
pub struct StorageHandles {
    /// Durable buffer transitions.
    pub buffer: DurableBuffer,
    /// Facade for inspecting buffer entries.
    pub buffer_reader: BufferReader,
    /// Facade for reading events.
    pub event_reader: EventReader,
    /// Facade for dashboard aggregates.
    pub dashboard: DashboardReader,
    /// Facade for storage administration.
    pub admin: StorageAdmin,
    pool: SqlitePool,
    /// Internal actor handle for graceful shutdown.
    actor_handle: Option<JoinHandle<()>>,
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Sends shutdown command to the writer actor, waits for it to finish
    /// and closes the connection pool.
    pub async fn shutdown(mut self) -> Result<(), StorageError> {
        self.admin.shutdown().await?;

        if let Some(handle) = self.actor_handle.take() {
            handle
                .await
                .map_err(|e| StorageError::Internal(format!("Failed to join actor task: {e}")))?;
        }

        self.pool.close().await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{EntryState, NewSample};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_storage_builder_persists_across_restart() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data").join("activa.db");

        let id = {
            let handles = StorageBuilder::new(&db_path).build().await.unwrap();
            let id = handles
                .buffer
                .append(NewSample::new(Utc::now()).with_metric("speed", 12.5))
                .await
                .unwrap()
                .id;
            handles.buffer.lease(1).await.unwrap();
            handles.shutdown().await.unwrap();
            id
        };

        let handles = StorageBuilder::new(&db_path).build().await.unwrap();
        let entry = handles.buffer_reader.get(id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.sample.metric("speed"), Some(12.5));

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let result = StorageBuilder::from_url("sqlite::memory:")
            .capacity(0)
            .build()
            .await;
        assert!(matches!(result, Err(StorageError::InvalidData(_))));
    }
}
