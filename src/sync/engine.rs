//! Sync engine: drains the durable buffer to the remote API.
//!
//! Each cycle walks an explicit state machine:
//!
//! ```text
//! Idle -> Leasing -> Sending -> Acknowledging -> Idle
//!                           \-> Backoff -------> Idle
//! ```
//!
//! Delivery is at-least-once; the server de-duplicates by sample id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::sink::ErrorSink;
use crate::storage::{BufferEntry, DeliveryOutcome, DurableBuffer, Event, SampleId, StorageError};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::transport::{SyncRequest, SyncResponse, SyncTransport, TransportError};

/// Largest batch a single cycle may lease.
pub const MAX_BATCH_SIZE: usize = 1_000;

fn default_device_id() -> String {
    "activa-device".to_string()
}

fn default_sync_interval_seconds() -> u64 {
    60
}

fn default_max_batch_size() -> usize {
    50
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sent with every batch so ids are unique per device on the server.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Seconds between periodic cycles (default: 60).
    #[serde(default = "default_sync_interval_seconds")]
    pub sync_interval_seconds: u64,
    /// Maximum entries leased per cycle (default: 50).
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Retries allowed after the first failed send (default: 5).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// First backoff delay in milliseconds (default: 1000).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff growth factor (default: 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff ceiling (default: 5m).
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Deadline for one send (default: 30s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sync_interval_seconds: default_sync_interval_seconds(),
            max_batch_size: default_max_batch_size(),
            max_retry_attempts: default_max_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff: default_max_backoff(),
            timeout: default_timeout(),
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_multiplier,
            self.max_backoff,
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.max(1))
    }
}

/// Current step of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, AsRefStr, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Leasing,
    Sending,
    Acknowledging,
    Backoff,
}

/// Observable engine state, published on a `watch` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub consecutive_failures: u32,
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_retry_in_ms: Option<u64>,
    pub delivered_total: u64,
    pub rejected_total: u64,
    pub abandoned_total: u64,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending; no network activity.
    Idle,
    /// The server answered 2xx.
    Delivered {
        leased: usize,
        acknowledged: u64,
        released: usize,
        abandoned: usize,
    },
    /// The server answered 4xx; the whole batch was rejected.
    Rejected { leased: usize },
    /// Transient failure; the next cycle waits `retry_in`.
    Failed {
        released: usize,
        abandoned: usize,
        retry_in: Duration,
    },
    /// Shutdown arrived while sending; the batch was released.
    Interrupted { released: usize },
}

/// Wakes the engine when connectivity returns.
///
/// A signal raised while a cycle is running is remembered and consumed by
/// the next wait.
#[derive(Debug, Clone, Default)]
pub struct NetworkSignal(Arc<Notify>);

impl NetworkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Buffer-to-network reconciliation.
pub struct SyncEngine {
    config: SyncConfig,
    backoff: BackoffPolicy,
    buffer: DurableBuffer,
    transport: Arc<dyn SyncTransport>,
    sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn Clock>,
    consecutive_failures: u32,
    status: watch::Sender<SyncStatus>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        buffer: DurableBuffer,
        transport: Arc<dyn SyncTransport>,
        sink: Arc<dyn ErrorSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            backoff: config.backoff(),
            config,
            buffer,
            transport,
            sink,
            clock,
            consecutive_failures: 0,
            status,
        }
    }

    /// Receive status updates.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.status.borrow().phase
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    /// Run one cycle without a shutdown signal.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, StorageError> {
        self.run_cycle_until(&CancellationToken::new()).await
    }

    /// Run one cycle. If `shutdown` fires during the send, the batch is
    /// released and the cycle ends as [`CycleOutcome::Interrupted`].
    pub async fn run_cycle_until(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, StorageError> {
        let result = self.cycle(shutdown).await;
        let now = self.clock.now();

        self.status.send_modify(|s| {
            s.last_cycle = Some(now);
            s.consecutive_failures = self.consecutive_failures;
            s.phase = SyncPhase::Idle;
            s.next_retry_in_ms = None;
            match &result {
                Ok(CycleOutcome::Delivered {
                    acknowledged,
                    abandoned,
                    ..
                }) => {
                    s.last_success = Some(now);
                    s.last_error = None;
                    s.delivered_total += acknowledged;
                    s.abandoned_total += *abandoned as u64;
                }
                Ok(CycleOutcome::Rejected { leased }) => {
                    s.rejected_total += *leased as u64;
                }
                Ok(CycleOutcome::Failed {
                    abandoned,
                    retry_in,
                    ..
                }) => {
                    s.phase = SyncPhase::Backoff;
                    s.abandoned_total += *abandoned as u64;
                    s.next_retry_in_ms = Some(retry_in.as_millis() as u64);
                }
                Ok(CycleOutcome::Idle | CycleOutcome::Interrupted { .. }) => {}
                Err(e) => s.last_error = Some(e.to_string()),
            }
        });

        result
    }

    async fn cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleOutcome, StorageError> {
        self.set_phase(SyncPhase::Leasing);
        let batch = self.buffer.lease(self.config.max_batch_size).await?;
        if batch.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        match self.exchange(shutdown, &batch).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.release_after_error(&batch, &e).await;
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        shutdown: &CancellationToken,
        batch: &[BufferEntry],
    ) -> Result<CycleOutcome, StorageError> {
        let request = SyncRequest::from_batch(&self.config.device_id, batch);

        self.set_phase(SyncPhase::Sending);
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = tokio::time::timeout(self.config.timeout, self.transport.send(&request)) => {
                Some(result.unwrap_or(Err(TransportError::Timeout(self.config.timeout))))
            }
        };

        match sent {
            None => {
                let ids: Vec<SampleId> = batch.iter().map(BufferEntry::id).collect();
                let released = self.buffer.release(&ids).await?.len();
                tracing::info!(released, "Sync interrupted by shutdown, batch released");
                Ok(CycleOutcome::Interrupted { released })
            }
            Some(Ok(response)) => self.on_delivered(batch, response).await,
            Some(Err(e)) if e.is_permanent() => self.on_rejected(batch, &e).await,
            Some(Err(e)) => self.on_failure(batch, &e).await,
        }
    }

    /// Hand a half-settled batch back to Pending so the next cycle can lease
    /// it again. `release` skips entries already acknowledged.
    async fn release_after_error(&self, batch: &[BufferEntry], error: &StorageError) {
        let ids: Vec<SampleId> = batch.iter().map(BufferEntry::id).collect();
        match self.buffer.release(&ids).await {
            Ok(released) => tracing::warn!(
                error = %error,
                released = released.len(),
                "Buffer update failed mid-cycle, batch released"
            ),
            Err(e) => tracing::error!(
                error = %error,
                release_error = %e,
                "Buffer update failed mid-cycle and the batch could not be released"
            ),
        }
    }

    async fn on_delivered(
        &mut self,
        batch: &[BufferEntry],
        response: SyncResponse,
    ) -> Result<CycleOutcome, StorageError> {
        self.set_phase(SyncPhase::Acknowledging);

        let in_batch: HashSet<SampleId> = batch.iter().map(BufferEntry::id).collect();
        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for id in response.acknowledged_ids {
            if in_batch.contains(&id) {
                if !known.contains(&id) {
                    known.push(id);
                }
            } else {
                unknown.push(id);
            }
        }
        if !unknown.is_empty() {
            tracing::warn!(count = unknown.len(), ids = ?unknown, "Ignoring acknowledged ids outside the batch");
        }

        let acknowledged = self.buffer.acknowledge(&known).await?;

        let remaining: Vec<&BufferEntry> =
            batch.iter().filter(|e| !known.contains(&e.id())).collect();
        let (released, abandoned) = self
            .requeue(&remaining, "not acknowledged by server")
            .await?;

        self.consecutive_failures = 0;
        tracing::info!(acknowledged, released, abandoned, "Sync batch delivered");

        Ok(CycleOutcome::Delivered {
            leased: batch.len(),
            acknowledged,
            released,
            abandoned,
        })
    }

    async fn on_rejected(
        &mut self,
        batch: &[BufferEntry],
        error: &TransportError,
    ) -> Result<CycleOutcome, StorageError> {
        self.set_phase(SyncPhase::Acknowledging);

        let ids: Vec<SampleId> = batch.iter().map(BufferEntry::id).collect();
        self.buffer
            .acknowledge_with(&ids, DeliveryOutcome::Rejected)
            .await?;

        let (status, reason) = match error {
            TransportError::Rejected { status, message } => (*status, message.as_str()),
            _ => (0, ""),
        };
        let now = self.clock.now();
        for id in &ids {
            self.sink
                .report(Event::sample_rejected(*id, status, reason).at(now));
        }

        // The network works; only the payload is bad.
        self.consecutive_failures = 0;
        Ok(CycleOutcome::Rejected { leased: batch.len() })
    }

    async fn on_failure(
        &mut self,
        batch: &[BufferEntry],
        error: &TransportError,
    ) -> Result<CycleOutcome, StorageError> {
        let entries: Vec<&BufferEntry> = batch.iter().collect();
        let (released, abandoned) = self.requeue(&entries, &error.to_string()).await?;

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let retry_in = self
            .backoff
            .delay_for_attempt(self.consecutive_failures - 1);

        tracing::warn!(
            error = %error,
            released,
            abandoned,
            consecutive_failures = self.consecutive_failures,
            retry_in_ms = retry_in.as_millis() as u64,
            "Sync attempt failed"
        );

        Ok(CycleOutcome::Failed {
            released,
            abandoned,
            retry_in,
        })
    }

    /// Release entries for another attempt, or abandon those that just used
    /// up their last retry.
    async fn requeue(
        &self,
        entries: &[&BufferEntry],
        reason: &str,
    ) -> Result<(usize, usize), StorageError> {
        if entries.is_empty() {
            return Ok((0, 0));
        }

        let max = self.config.max_retry_attempts;
        let (exhausted, retry): (Vec<&BufferEntry>, Vec<&BufferEntry>) = entries
            .iter()
            .copied()
            .partition(|e| e.attempt_count.saturating_add(1) > max);

        if !exhausted.is_empty() {
            let ids: Vec<SampleId> = exhausted.iter().map(|e| e.id()).collect();
            self.buffer
                .acknowledge_with(&ids, DeliveryOutcome::Abandoned)
                .await?;
            let now = self.clock.now();
            for entry in &exhausted {
                self.sink.report(
                    Event::delivery_abandoned(entry.id(), entry.attempt_count + 1, reason).at(now),
                );
            }
        }

        let ids: Vec<SampleId> = retry.iter().map(|e| e.id()).collect();
        let released = self.buffer.release(&ids).await?.len();

        Ok((released, exhausted.len()))
    }

    /// Cycle on the periodic timer, on network signals, and back to back
    /// while full batches keep draining. Stops when `shutdown` fires.
    pub async fn run(mut self, network: NetworkSignal, shutdown: CancellationToken) {
        let interval = self.config.interval();
        tracing::info!(
            interval_seconds = interval.as_secs(),
            max_batch_size = self.config.max_batch_size,
            max_retry_attempts = self.config.max_retry_attempts,
            "Sync engine started"
        );

        loop {
            let delay = match self.run_cycle_until(&shutdown).await {
                Ok(CycleOutcome::Interrupted { .. }) => break,
                Ok(CycleOutcome::Failed { retry_in, .. }) => retry_in,
                Ok(
                    CycleOutcome::Delivered { leased, .. } | CycleOutcome::Rejected { leased },
                ) if leased >= self.config.max_batch_size => Duration::ZERO,
                Ok(_) => interval,
                Err(e) => {
                    tracing::error!(error = %e, "Sync cycle failed on buffer access");
                    interval
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = network.notified() => {
                    tracing::debug!("Network available, syncing now");
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Sync engine stopped");
    }
}
