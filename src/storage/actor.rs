//! Writer actor with exclusive write access and MPSC command channel.
//!
//! Single-writer pattern: one task owns every state transition of the buffer,
//! processes commands in arrival order and answers over `oneshot` channels.
//! Because commands never interleave, leases cannot overlap and the ring
//! eviction in `append` always sees a consistent row count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::storage::StorageError;
use crate::storage::rows::{ENTRY_COLUMNS, EntryRow};
use crate::storage::schema::init_schema;
use crate::storage::types::{
    Appended, BufferEntry, DeliveryOutcome, Event, NewSample, SampleId, TelemetrySample,
};

type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// Ids bound per `IN (..)` list, well under SQLite's variable limit.
const MAX_IDS_PER_STATEMENT: usize = 500;

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the writer actor.
#[derive(Debug)]
pub enum Command {
    /// Store a new pending sample, evicting per the ring policy when full.
    Append { sample: NewSample, reply: Reply<Appended> },
    /// Move up to `max_count` pending entries to in-flight.
    Lease { max_count: usize, reply: Reply<Vec<BufferEntry>> },
    /// Move in-flight entries to acknowledged with the given outcome.
    Acknowledge {
        ids: Vec<SampleId>,
        outcome: DeliveryOutcome,
        reply: Reply<u64>,
    },
    /// Move in-flight entries back to pending.
    Release { ids: Vec<SampleId>, reply: Reply<Vec<BufferEntry>> },
    /// Insert event (fire and forget).
    RecordEvent(Event),
    /// Delete acknowledged entries acknowledged before the cutoff.
    PurgeAcknowledged { older_than: DateTime<Utc>, reply: Reply<u64> },
    /// Delete events older than the cutoff.
    PurgeEvents { older_than: DateTime<Utc>, reply: Reply<u64> },
    /// Graceful shutdown: in-flight entries revert to pending.
    Shutdown { reply: oneshot::Sender<()> },
}

// =============================================================================
// Actor
// =============================================================================

/// Buffer writer actor.
pub struct BufferActor {
    pool: SqlitePool,
    rx: mpsc::Receiver<Command>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl BufferActor {
    /// Initialize the schema, recover in-flight rows and spawn the actor task.
    ///
    /// Returns the task handle and the command sender.
    pub async fn spawn(
        pool: SqlitePool,
        capacity: usize,
        channel_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<(JoinHandle<()>, mpsc::Sender<Command>), StorageError> {
        init_schema(&pool).await?;

        let recovered = recover_in_flight(&pool).await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered in-flight entries to pending");
        }

        let (tx, rx) = mpsc::channel(channel_capacity);
        let actor = BufferActor {
            pool,
            rx,
            capacity,
            clock,
        };
        let handle = tokio::spawn(actor.run());

        Ok((handle, tx))
    }

    async fn run(mut self) {
        tracing::info!(capacity = self.capacity, "BufferActor started");

        while let Some(cmd) = self.rx.recv().await {
            if self.handle_command(cmd).await {
                return; // Shutdown requested
            }
        }

        tracing::warn!("Channel disconnected, shutting down");
        self.recover_on_shutdown().await;
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Append { sample, reply } => {
                let result = self.append(sample).await;
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "Append failed");
                }
                let _ = reply.send(result);
            }
            Command::Lease { max_count, reply } => {
                let _ = reply.send(self.lease(max_count).await);
            }
            Command::Acknowledge {
                ids,
                outcome,
                reply,
            } => {
                let _ = reply.send(self.acknowledge(&ids, outcome).await);
            }
            Command::Release { ids, reply } => {
                let _ = reply.send(self.release(&ids).await);
            }
            Command::RecordEvent(event) => {
                if let Err(e) = self.insert_event(&event).await {
                    tracing::error!(error = %e, "Event insert failed");
                }
            }
            Command::PurgeAcknowledged { older_than, reply } => {
                let _ = reply.send(self.purge_acknowledged(older_than).await);
            }
            Command::PurgeEvents { older_than, reply } => {
                let _ = reply.send(self.purge_events(older_than).await);
            }
            Command::Shutdown { reply } => {
                tracing::info!("BufferActor shutting down");
                self.recover_on_shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn recover_on_shutdown(&self) {
        match recover_in_flight(&self.pool).await {
            Ok(0) => {}
            Ok(recovered) => tracing::info!(recovered, "Reverted in-flight entries on shutdown"),
            Err(e) => tracing::error!(error = %e, "Failed to revert in-flight entries"),
        }
        tracing::info!("BufferActor stopped");
    }

    // =========================================================================
    // Buffer transitions
    // =========================================================================

    /// Insert a pending entry, applying the ring policy at capacity:
    /// oldest acknowledged first, then oldest pending. Fails only when
    /// nothing but in-flight entries remain.
    async fn append(&self, sample: NewSample) -> Result<Appended, StorageError> {
        // serde_json writes NaN and infinities as null, which never decodes back.
        if let Some((name, value)) = sample.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StorageError::InvalidData(format!(
                "metric '{name}' is not finite: {value}"
            )));
        }
        let metrics_json = serde_json::to_string(&sample.metrics)?;
        let mut tx = self.pool.begin().await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buffer_entries")
            .fetch_one(&mut *tx)
            .await?;
        let mut excess = (count.max(0) as usize + 1).saturating_sub(self.capacity);
        let mut dropped = Vec::new();

        if excess > 0 {
            let purged = sqlx::query(
                "DELETE FROM buffer_entries WHERE id IN (
                     SELECT id FROM buffer_entries WHERE state = 'acknowledged'
                     ORDER BY ts ASC, id ASC LIMIT ?)",
            )
            .bind(excess as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            excess = excess.saturating_sub(purged as usize);
        }

        if excess > 0 {
            let rows: Vec<EntryRow> = sqlx::query_as(&format!(
                "DELETE FROM buffer_entries WHERE id IN (
                     SELECT id FROM buffer_entries WHERE state = 'pending'
                     ORDER BY ts ASC, id ASC LIMIT ?)
                 RETURNING {ENTRY_COLUMNS}"
            ))
            .bind(excess as i64)
            .fetch_all(&mut *tx)
            .await?;
            excess = excess.saturating_sub(rows.len());
            dropped = into_entries(rows)?
                .into_iter()
                .map(|e| e.sample)
                .collect::<Vec<TelemetrySample>>();
        }

        if excess > 0 {
            // Dropping `tx` rolls back any eviction done above.
            return Err(StorageError::StorageFull {
                capacity: self.capacity,
            });
        }

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO buffer_entries (ts, latitude, longitude, metrics, state)
             VALUES (?, ?, ?, ?, 'pending') RETURNING id",
        )
        .bind(sample.timestamp.timestamp_millis())
        .bind(sample.location.map(|p| p.latitude))
        .bind(sample.location.map(|p| p.longitude))
        .bind(metrics_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if !dropped.is_empty() {
            tracing::warn!(count = dropped.len(), "Evicted pending samples at capacity");
        }
        tracing::debug!(id, "Sample appended");

        Ok(Appended {
            id: SampleId::new(id),
            dropped,
        })
    }

    async fn lease(&self, max_count: usize) -> Result<Vec<BufferEntry>, StorageError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "UPDATE buffer_entries SET state = 'in_flight' WHERE id IN (
                 SELECT id FROM buffer_entries WHERE state = 'pending'
                 ORDER BY ts ASC, id ASC LIMIT ?)
             RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(max_count as i64)
        .fetch_all(&mut *tx)
        .await?;

        // A row that fails to decode rolls the whole lease back.
        let mut entries = into_entries(rows)?;
        tx.commit().await?;
        // RETURNING order is unspecified.
        entries.sort_by_key(|e| (e.sample.timestamp(), e.id()));

        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "Entries leased");
        }
        Ok(entries)
    }

    async fn acknowledge(
        &self,
        ids: &[SampleId],
        outcome: DeliveryOutcome,
    ) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE buffer_entries SET state = 'acknowledged', attempt_count = attempt_count + 1, last_attempt = ",
            );
            qb.push_bind(now);
            qb.push(", acked_at = ");
            qb.push_bind(now);
            qb.push(", outcome = ");
            qb.push_bind(outcome.to_string());
            qb.push(" WHERE state = 'in_flight' AND id IN (");
            push_ids(&mut qb, chunk);
            qb.push(")");

            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        tracing::debug!(affected, %outcome, "Entries acknowledged");
        Ok(affected)
    }

    async fn release(&self, ids: &[SampleId]) -> Result<Vec<BufferEntry>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now().timestamp_millis();

        let mut tx = self.pool.begin().await?;
        let mut rows: Vec<EntryRow> = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE buffer_entries SET state = 'pending', attempt_count = attempt_count + 1, last_attempt = ",
            );
            qb.push_bind(now);
            qb.push(" WHERE state = 'in_flight' AND id IN (");
            push_ids(&mut qb, chunk);
            qb.push(") RETURNING ");
            qb.push(ENTRY_COLUMNS);

            rows.extend(qb.build_query_as().fetch_all(&mut *tx).await?);
        }
        let mut entries = into_entries(rows)?;
        tx.commit().await?;
        entries.sort_by_key(|e| (e.sample.timestamp(), e.id()));

        tracing::debug!(count = entries.len(), "Entries released");
        Ok(entries)
    }

    // =========================================================================
    // Events and maintenance
    // =========================================================================

    async fn insert_event(&self, e: &Event) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(&e.payload)?;
        sqlx::query(
            "INSERT INTO events (ts, source, kind, severity, message, payload)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(e.ts.timestamp_millis())
        .bind(e.source.to_string())
        .bind(e.kind.to_string())
        .bind(e.severity.to_string())
        .bind(&e.message)
        .bind(payload_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let deleted = sqlx::query(
            "DELETE FROM buffer_entries WHERE state = 'acknowledged' AND acked_at < ?",
        )
        .bind(older_than.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        tracing::info!(deleted, cutoff = %older_than, "Acknowledged entries purged");
        Ok(deleted)
    }

    async fn purge_events(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let deleted = sqlx::query("DELETE FROM events WHERE ts < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(deleted, cutoff = %older_than, "Events purged");
        Ok(deleted)
    }
}

/// InFlight never survives a restart.
async fn recover_in_flight(pool: &SqlitePool) -> Result<u64, StorageError> {
    let recovered = sqlx::query("UPDATE buffer_entries SET state = 'pending' WHERE state = 'in_flight'")
        .execute(pool)
        .await?
        .rows_affected();
    Ok(recovered)
}

fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[SampleId]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.get());
    }
}

fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<BufferEntry>, StorageError> {
    rows.into_iter().map(BufferEntry::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::db::SqlitePool as Pool;
    use crate::storage::types::EntryState;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn call<T>(
        tx: &mpsc::Sender<Command>,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StorageError> {
        let (reply, rx) = oneshot::channel();
        tx.send(make(reply)).await.unwrap();
        rx.await.unwrap()
    }

    async fn spawn(pool: &Pool, capacity: usize) -> (JoinHandle<()>, mpsc::Sender<Command>) {
        BufferActor::spawn(
            pool.inner().clone(),
            capacity,
            16,
            Arc::new(ManualClock::new(ts(0))),
        )
        .await
        .unwrap()
    }

    async fn shutdown(handle: JoinHandle<()>, tx: mpsc::Sender<Command>) {
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Shutdown { reply }).await.unwrap();
        rx.await.unwrap();
        handle.await.unwrap();
    }

    async fn state_of(pool: &Pool, id: SampleId) -> String {
        let (state,): (String,) = sqlx::query_as("SELECT state FROM buffer_entries WHERE id = ?")
            .bind(id.get())
            .fetch_one(pool.inner())
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_actor_lifecycle() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;
        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        let a = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)).with_metric("speed", 42.0),
            reply,
        })
        .await
        .unwrap();
        let b = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(2)),
            reply,
        })
        .await
        .unwrap();

        assert!(b.id > a.id);
        assert!(a.dropped.is_empty());
        assert_eq!(state_of(&pool, a.id).await, "pending");

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_ring_evicts_acknowledged_before_pending() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 2).await;

        let first = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)),
            reply,
        })
        .await
        .unwrap();
        let second = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(2)),
            reply,
        })
        .await
        .unwrap();

        // Lease and acknowledge the newer entry only.
        let leased = call(&tx, |reply| Command::Lease { max_count: 2, reply })
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        call(&tx, |reply| Command::Release {
            ids: vec![first.id],
            reply,
        })
        .await
        .unwrap();
        call(&tx, |reply| Command::Acknowledge {
            ids: vec![second.id],
            outcome: DeliveryOutcome::Delivered,
            reply,
        })
        .await
        .unwrap();

        let third = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(3)),
            reply,
        })
        .await
        .unwrap();
        assert!(third.dropped.is_empty(), "acknowledged entry should go first");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buffer_entries")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(state_of(&pool, first.id).await, "pending");

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_ring_drops_oldest_pending_when_no_acknowledged() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 2).await;

        let mut ids = Vec::new();
        for i in 0..2 {
            let appended = call(&tx, |reply| Command::Append {
                sample: NewSample::new(ts(i)),
                reply,
            })
            .await
            .unwrap();
            ids.push(appended.id);
        }

        let third = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(5)),
            reply,
        })
        .await
        .unwrap();

        assert_eq!(third.dropped.len(), 1);
        assert_eq!(third.dropped[0].id(), ids[0]);

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_append_fails_when_everything_is_in_flight() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 2).await;

        for i in 0..2 {
            call(&tx, |reply| Command::Append {
                sample: NewSample::new(ts(i)),
                reply,
            })
            .await
            .unwrap();
        }
        call(&tx, |reply| Command::Lease { max_count: 10, reply })
            .await
            .unwrap();

        let result = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(9)),
            reply,
        })
        .await;
        assert!(matches!(
            result,
            Err(StorageError::StorageFull { capacity: 2 })
        ));

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_lease_orders_by_timestamp_then_id() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        for t in [30, 10, 20, 10] {
            call(&tx, |reply| Command::Append {
                sample: NewSample::new(ts(t)),
                reply,
            })
            .await
            .unwrap();
        }

        let leased = call(&tx, |reply| Command::Lease { max_count: 3, reply })
            .await
            .unwrap();
        let order: Vec<(i64, i64)> = leased
            .iter()
            .map(|e| (e.sample.timestamp().timestamp() - 1_700_000_000, e.id().get()))
            .collect();
        assert_eq!(order, vec![(10, 2), (10, 4), (20, 3)]);
        assert!(leased.iter().all(|e| e.state == EntryState::InFlight));

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_release_only_touches_in_flight() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        let a = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)),
            reply,
        })
        .await
        .unwrap();

        // Pending entries are not released.
        let released = call(&tx, |reply| Command::Release {
            ids: vec![a.id],
            reply,
        })
        .await
        .unwrap();
        assert!(released.is_empty());

        call(&tx, |reply| Command::Lease { max_count: 1, reply })
            .await
            .unwrap();
        let released = call(&tx, |reply| Command::Release {
            ids: vec![a.id],
            reply,
        })
        .await
        .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].state, EntryState::Pending);
        assert_eq!(released[0].attempt_count, 1);
        assert_eq!(released[0].last_attempt, Some(ts(0)));

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_append_rejects_non_finite_metrics() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = call(&tx, |reply| Command::Append {
                sample: NewSample::new(ts(1))
                    .with_metric("rpm", 2000.0)
                    .with_metric("speed", bad),
                reply,
            })
            .await;
            assert!(
                matches!(result, Err(StorageError::InvalidData(ref msg)) if msg.contains("speed")),
                "unexpected result for {bad}: {result:?}"
            );
        }

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM buffer_entries")
            .fetch_one(pool.inner())
            .await
            .unwrap();
        assert_eq!(count, 0);

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_undecodable_row_rolls_back_lease() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        let good = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)).with_metric("speed", 1.0),
            reply,
        })
        .await
        .unwrap();
        // A row written before non-finite values were rejected.
        let (bad,): (i64,) = sqlx::query_as(
            "INSERT INTO buffer_entries (ts, metrics, state)
             VALUES (?, '{\"speed\":null}', 'pending') RETURNING id",
        )
        .bind(ts(2).timestamp_millis())
        .fetch_one(pool.inner())
        .await
        .unwrap();

        let result = call(&tx, |reply| Command::Lease { max_count: 10, reply }).await;
        assert!(matches!(result, Err(StorageError::Json(_))), "{result:?}");
        assert_eq!(state_of(&pool, good.id).await, "pending");
        assert_eq!(state_of(&pool, SampleId::new(bad)).await, "pending");

        // Leases that stop short of the bad row still work.
        let leased = call(&tx, |reply| Command::Lease { max_count: 1, reply })
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id(), good.id);

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_acknowledge_and_release_span_many_ids() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 5_000).await;

        let total = MAX_IDS_PER_STATEMENT * 2 + 7;
        for i in 0..total {
            call(&tx, |reply| Command::Append {
                sample: NewSample::new(ts(i as i64)),
                reply,
            })
            .await
            .unwrap();
        }
        let leased = call(&tx, |reply| Command::Lease {
            max_count: total,
            reply,
        })
        .await
        .unwrap();
        assert_eq!(leased.len(), total);

        let ids: Vec<SampleId> = leased.iter().map(|e| e.id()).collect();
        let (acked, rest) = ids.split_at(MAX_IDS_PER_STATEMENT + 3);

        let affected = call(&tx, |reply| Command::Acknowledge {
            ids: acked.to_vec(),
            outcome: DeliveryOutcome::Delivered,
            reply,
        })
        .await
        .unwrap();
        assert_eq!(affected as usize, acked.len());

        let released = call(&tx, |reply| Command::Release {
            ids: rest.to_vec(),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(released.len(), rest.len());
        assert!(released.windows(2).all(|w| w[0].id() < w[1].id()));

        let (in_flight,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM buffer_entries WHERE state = 'in_flight'")
                .fetch_one(pool.inner())
                .await
                .unwrap();
        assert_eq!(in_flight, 0);

        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_restart_reverts_in_flight() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("restart.db");

        let pool = Pool::open(&db_path).await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;
        let a = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)),
            reply,
        })
        .await
        .unwrap();
        call(&tx, |reply| Command::Lease { max_count: 1, reply })
            .await
            .unwrap();
        // Simulate a crash: the actor task is aborted without a shutdown command.
        handle.abort();
        let _ = handle.await;
        assert_eq!(state_of(&pool, a.id).await, "in_flight");
        pool.close().await;

        let pool = Pool::open(&db_path).await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;
        assert_eq!(state_of(&pool, a.id).await, "pending");
        shutdown(handle, tx).await;
    }

    #[tokio::test]
    async fn test_purge_operations() {
        let pool = Pool::connect("sqlite::memory:").await.unwrap();
        let (handle, tx) = spawn(&pool, 10).await;

        let a = call(&tx, |reply| Command::Append {
            sample: NewSample::new(ts(1)),
            reply,
        })
        .await
        .unwrap();
        call(&tx, |reply| Command::Lease { max_count: 1, reply })
            .await
            .unwrap();
        call(&tx, |reply| Command::Acknowledge {
            ids: vec![a.id],
            outcome: DeliveryOutcome::Delivered,
            reply,
        })
        .await
        .unwrap();
        tx.send(Command::RecordEvent(
            Event::system(crate::storage::types::EventSeverity::Info, "Started").at(ts(0)),
        ))
        .await
        .unwrap();

        let purged = call(&tx, |reply| Command::PurgeAcknowledged {
            older_than: ts(60),
            reply,
        })
        .await
        .unwrap();
        let events = call(&tx, |reply| Command::PurgeEvents {
            older_than: ts(60),
            reply,
        })
        .await
        .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(events, 1);

        shutdown(handle, tx).await;
    }
}
