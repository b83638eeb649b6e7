//! User-facing storage facades.
//!
//! Provides ergonomic APIs for storage operations:
//! - `DurableBuffer`: Buffer transitions via the writer actor
//! - `BufferReader`: Inspect buffer contents and statistics
//! - `EventReader`: Query events
//! - `StorageAdmin`: Retention, backup export and shutdown

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use strum_macros::{AsRefStr, EnumString};
use tokio::sync::{mpsc, oneshot};

use crate::clock::Clock;
use crate::storage::StorageError;
use crate::storage::actor::Command;
use crate::storage::rows::{ENTRY_COLUMNS, EVENT_COLUMNS, EntryRow, EventRow};
use crate::storage::types::{
    Appended, BufferEntry, DeliveryOutcome, EntryState, Event, EventKind, EventSeverity,
    EventSource, NewSample, SampleId,
};

// =============================================================================
// Constants
// =============================================================================

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;
const DEFAULT_RANGE_DAYS: i64 = 30;

/// File name prefix of backup exports.
pub const BACKUP_PREFIX: &str = "activa_backup_";

// =============================================================================
// Query Types
// =============================================================================

/// Sort order for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Query for events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub source: Option<EventSource>,
    pub kind: Option<EventKind>,
    pub severity: Option<EventSeverity>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

/// Query for buffer entries.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub state: Option<EntryState>,
    pub outcome: Option<DeliveryOutcome>,
    pub limit: Option<u32>,
    pub order: Option<SortOrder>,
}

// =============================================================================
// Result Types
// =============================================================================

/// Buffer occupancy by state and outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub total: u64,
    pub pending: u64,
    pub in_flight: u64,
    pub acknowledged: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

// =============================================================================
// Durable buffer
// =============================================================================

/// Send a command and wait for the actor's reply.
pub(crate) async fn call<T>(
    tx: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<Result<T, StorageError>>) -> Command,
) -> Result<T, StorageError> {
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply))
        .await
        .map_err(|_| StorageError::ChannelSend)?;
    rx.await.map_err(|_| StorageError::ActorGone)?
}

/// Handle to the durable sample buffer.
///
/// Every operation is executed by the writer actor, so transitions are
/// atomic with respect to each other. Cloning is cheap.
#[derive(Clone)]
pub struct DurableBuffer {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for DurableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBuffer").finish_non_exhaustive()
    }
}

impl DurableBuffer {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Store a new pending sample.
    ///
    /// At capacity the oldest acknowledged entries are purged first, then the
    /// oldest pending entry (returned in [`Appended::dropped`]). Fails with
    /// [`StorageError::StorageFull`] only when every entry is in flight.
    pub async fn append(&self, sample: NewSample) -> Result<Appended, StorageError> {
        call(&self.tx, |reply| Command::Append { sample, reply }).await
    }

    /// Lease up to `max_count` pending entries, oldest first.
    pub async fn lease(&self, max_count: usize) -> Result<Vec<BufferEntry>, StorageError> {
        call(&self.tx, |reply| Command::Lease { max_count, reply }).await
    }

    /// Acknowledge in-flight entries as delivered.
    ///
    /// Idempotent: ids that are unknown or already acknowledged are ignored.
    /// Returns the number of entries that changed state.
    pub async fn acknowledge(&self, ids: &[SampleId]) -> Result<u64, StorageError> {
        self.acknowledge_with(ids, DeliveryOutcome::Delivered).await
    }

    /// Acknowledge in-flight entries with an explicit outcome.
    pub async fn acknowledge_with(
        &self,
        ids: &[SampleId],
        outcome: DeliveryOutcome,
    ) -> Result<u64, StorageError> {
        let ids = ids.to_vec();
        call(&self.tx, |reply| Command::Acknowledge {
            ids,
            outcome,
            reply,
        })
        .await
    }

    /// Revert in-flight entries to pending and count the attempt.
    ///
    /// Returns the released entries; ids that were not in flight are skipped.
    pub async fn release(&self, ids: &[SampleId]) -> Result<Vec<BufferEntry>, StorageError> {
        let ids = ids.to_vec();
        call(&self.tx, |reply| Command::Release { ids, reply }).await
    }

    /// Record an event. Non-blocking; dropped if the channel is full.
    pub fn record_event(&self, event: Event) -> Result<(), StorageError> {
        self.tx.try_send(Command::RecordEvent(event)).map_err(|_| {
            tracing::warn!("Channel full, dropping event");
            StorageError::ChannelSend
        })
    }
}

// =============================================================================
// Readers
// =============================================================================

/// Read-only view over buffer entries.
#[derive(Clone)]
pub struct BufferReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader").finish_non_exhaustive()
    }
}

impl BufferReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count entries per state and outcome.
    pub async fn stats(&self) -> Result<BufferStats, StorageError> {
        let rows: Vec<(String, Option<String>, i64)> = sqlx::query_as(
            "SELECT state, outcome, COUNT(*) FROM buffer_entries GROUP BY state, outcome",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = BufferStats::default();
        for (state, outcome, count) in rows {
            let count = count.max(0) as u64;
            stats.total += count;
            match EntryState::from_str(&state) {
                Ok(EntryState::Pending) => stats.pending += count,
                Ok(EntryState::InFlight) => stats.in_flight += count,
                Ok(EntryState::Acknowledged) => stats.acknowledged += count,
                Err(_) => {
                    return Err(StorageError::InvalidData(format!(
                        "unknown entry state '{state}'"
                    )));
                }
            }
            match outcome.as_deref().map(DeliveryOutcome::from_str) {
                Some(Ok(DeliveryOutcome::Delivered)) => stats.delivered += count,
                Some(Ok(DeliveryOutcome::Rejected)) => stats.rejected += count,
                Some(Ok(DeliveryOutcome::Abandoned)) => stats.abandoned += count,
                _ => {}
            }
        }

        let (oldest,): (Option<i64>,) =
            sqlx::query_as("SELECT MIN(ts) FROM buffer_entries WHERE state = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        stats.oldest_pending = oldest.and_then(DateTime::from_timestamp_millis);

        Ok(stats)
    }

    /// List entries, newest first by default.
    pub async fn list(&self, q: EntryQuery) -> Result<Vec<BufferEntry>, StorageError> {
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(ENTRY_COLUMNS);
        qb.push(" FROM buffer_entries WHERE 1 = 1");
        if let Some(state) = q.state {
            qb.push(" AND state = ").push_bind(state.to_string());
        }
        if let Some(outcome) = q.outcome {
            qb.push(" AND outcome = ").push_bind(outcome.to_string());
        }
        qb.push(format!(
            " ORDER BY ts {0}, id {0} LIMIT {limit}",
            order.as_sql()
        ));

        let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(BufferEntry::try_from).collect()
    }

    /// Fetch a single entry by id.
    pub async fn get(&self, id: SampleId) -> Result<Option<BufferEntry>, StorageError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM buffer_entries WHERE id = ?"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;
        row.map(BufferEntry::try_from).transpose()
    }
}

/// Event reader.
#[derive(Clone)]
pub struct EventReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for EventReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReader").finish_non_exhaustive()
    }
}

impl EventReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Query events with filters.
    pub async fn query(&self, q: EventQuery) -> Result<Vec<Event>, StorageError> {
        let now = Utc::now();
        let start = q
            .start
            .unwrap_or_else(|| now - Duration::days(DEFAULT_RANGE_DAYS));
        let end = q.end.unwrap_or(now);
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let order = q.order.unwrap_or_default();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(EVENT_COLUMNS);
        qb.push(" FROM events WHERE ts >= ")
            .push_bind(start.timestamp_millis());
        qb.push(" AND ts <= ").push_bind(end.timestamp_millis());

        if let Some(src) = q.source {
            qb.push(" AND source = ").push_bind(src.to_string());
        }
        if let Some(kind) = q.kind {
            qb.push(" AND kind = ").push_bind(kind.to_string());
        }
        if let Some(sev) = q.severity {
            qb.push(" AND severity = ").push_bind(sev.to_string());
        }

        qb.push(format!(
            " ORDER BY ts {0}, id {0} LIMIT {limit}",
            order.as_sql()
        ));

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Event::from).collect())
    }
}

// =============================================================================
// Admin
// =============================================================================

/// Backup document written by [`StorageAdmin::export_backup`].
#[derive(Debug, Serialize)]
struct Backup {
    exported_at: DateTime<Utc>,
    entries: Vec<BufferEntry>,
    events: Vec<Event>,
}

/// Storage administration.
#[derive(Clone)]
pub struct StorageAdmin {
    tx: mpsc::Sender<Command>,
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StorageAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdmin").finish_non_exhaustive()
    }
}

impl StorageAdmin {
    pub(crate) fn new(tx: mpsc::Sender<Command>, pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { tx, pool, clock }
    }

    /// Delete acknowledged entries acknowledged more than `max_age` ago.
    pub async fn purge_acknowledged(&self, max_age: Duration) -> Result<u64, StorageError> {
        let older_than = self.clock.now() - max_age;
        call(&self.tx, |reply| Command::PurgeAcknowledged { older_than, reply }).await
    }

    /// Delete events older than `max_age`.
    pub async fn purge_events(&self, max_age: Duration) -> Result<u64, StorageError> {
        let older_than = self.clock.now() - max_age;
        call(&self.tx, |reply| Command::PurgeEvents { older_than, reply }).await
    }

    /// Write every buffer entry and event to a pretty-printed JSON file in
    /// `dir`, then delete all but the newest `keep` backups.
    pub async fn export_backup(&self, dir: &Path, keep: usize) -> Result<PathBuf, StorageError> {
        let entries: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM buffer_entries ORDER BY ts ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        let events: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY ts ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let exported_at = self.clock.now();
        let backup = Backup {
            exported_at,
            entries: entries
                .into_iter()
                .map(BufferEntry::try_from)
                .collect::<Result<_, _>>()?,
            events: events.into_iter().map(Event::from).collect(),
        };

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "{BACKUP_PREFIX}{}.json",
            exported_at.format("%Y%m%d_%H%M%S%3f")
        ));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&backup)?).await?;
        tracing::info!(
            path = %path.display(),
            entries = backup.entries.len(),
            events = backup.events.len(),
            "Backup exported"
        );

        let pruned = prune_backups(dir, keep).await?;
        if pruned > 0 {
            tracing::info!(pruned, keep, "Old backups removed");
        }

        Ok(path)
    }

    /// Ask the writer actor to stop; in-flight entries revert to pending.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| StorageError::ChannelSend)?;
        rx.await.map_err(|_| StorageError::ActorGone)
    }
}

/// Delete all but the newest `keep` backup files. Timestamps in the file
/// names sort lexicographically.
async fn prune_backups(dir: &Path, keep: usize) -> Result<usize, StorageError> {
    let mut backups = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(BACKUP_PREFIX) && name.ends_with(".json") {
            backups.push((name, entry.path()));
        }
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0));
    let mut pruned = 0;
    for (_, path) in backups.into_iter().skip(keep) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(error = %e, path = %path.display(), "Failed to remove old backup");
            continue;
        }
        pruned += 1;
    }
    Ok(pruned)
}
