//! Capture scheduler: polls a [`ReadingSource`] and appends samples to the
//! durable buffer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;

use crate::capture::traits::{MIN_INTERVAL, ReadingSource};
use crate::clock::Clock;
use crate::sink::ErrorSink;
use crate::storage::{DurableBuffer, Event, NewSample, SampleId, StorageError};

fn default_interval_seconds() -> u64 {
    10
}

fn default_low_battery_threshold() -> f64 {
    20.0
}

fn default_low_battery_multiplier() -> u32 {
    4
}

/// Capture timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Seconds between ticks (default: 10).
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Stretch the interval while the battery is low (default: false).
    #[serde(default)]
    pub adaptive_backoff_on_low_battery: bool,
    /// Battery percentage below which the interval is stretched (default: 20).
    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_threshold: f64,
    /// Interval multiplier on low battery (default: 4).
    #[serde(default = "default_low_battery_multiplier")]
    pub low_battery_multiplier: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            adaptive_backoff_on_low_battery: false,
            low_battery_threshold: default_low_battery_threshold(),
            low_battery_multiplier: default_low_battery_multiplier(),
        }
    }
}

impl CaptureConfig {
    pub fn with_interval_seconds(mut self, secs: u64) -> Self {
        self.interval_seconds = secs;
        self
    }

    pub fn with_adaptive_backoff(mut self, enabled: bool) -> Self {
        self.adaptive_backoff_on_low_battery = enabled;
        self
    }
}

/// Scheduler state. `Capturing` only lasts for the duration of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A sample was appended; `dropped` pending samples were evicted for it.
    Captured { id: SampleId, dropped: usize },
    /// The source failed; nothing was appended.
    Skipped,
    /// The reading was acquired but the buffer refused it.
    StoreFailed,
}

/// Periodic sample capture.
pub struct CaptureScheduler {
    config: CaptureConfig,
    source: Arc<dyn ReadingSource>,
    buffer: DurableBuffer,
    sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn Clock>,
    state: CaptureState,
    last_battery: Option<f64>,
}

impl std::fmt::Debug for CaptureScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureScheduler")
            .field("config", &self.config)
            .field("source", &self.source.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CaptureScheduler {
    pub fn new(
        config: CaptureConfig,
        source: Arc<dyn ReadingSource>,
        buffer: DurableBuffer,
        sink: Arc<dyn ErrorSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            source,
            buffer,
            sink,
            clock,
            state: CaptureState::Idle,
            last_battery: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Last battery level reported by the source.
    pub fn last_battery(&self) -> Option<f64> {
        self.last_battery
    }

    /// Run one capture: read, build the sample, append.
    ///
    /// Never fails; problems are logged or reported to the sink.
    pub async fn tick(&mut self) -> TickOutcome {
        self.state = CaptureState::Capturing;
        let outcome = self.capture_once().await;
        self.state = CaptureState::Idle;
        outcome
    }

    async fn capture_once(&mut self) -> TickOutcome {
        let reading = match self.source.read().await {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(source = self.source.name(), error = %e, "Acquisition failed, skipping tick");
                return TickOutcome::Skipped;
            }
        };

        if let Some(battery) = reading.battery_percent {
            self.last_battery = Some(battery);
        }

        let sample = NewSample {
            timestamp: self.clock.now(),
            location: reading.location,
            metrics: reading.metrics,
        };

        match self.buffer.append(sample).await {
            Ok(appended) => {
                let now = self.clock.now();
                for dropped in &appended.dropped {
                    self.sink.report(Event::sample_dropped(dropped).at(now));
                }
                tracing::debug!(id = %appended.id, dropped = appended.dropped.len(), "Sample captured");
                TickOutcome::Captured {
                    id: appended.id,
                    dropped: appended.dropped.len(),
                }
            }
            Err(StorageError::StorageFull { capacity }) => {
                self.sink
                    .report(Event::storage_full(capacity).at(self.clock.now()));
                TickOutcome::StoreFailed
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to append sample");
                TickOutcome::StoreFailed
            }
        }
    }

    /// Delay until the next tick, stretched while the battery is low.
    pub fn next_interval(&self) -> Duration {
        let base = Duration::from_secs(self.config.interval_seconds).max(MIN_INTERVAL);
        let low_battery = self
            .last_battery
            .is_some_and(|b| b < self.config.low_battery_threshold);

        if self.config.adaptive_backoff_on_low_battery && low_battery {
            base.saturating_mul(self.config.low_battery_multiplier.max(1))
        } else {
            base
        }
    }

    /// Tick immediately, then on every interval until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            source = self.source.name(),
            interval_seconds = self.config.interval_seconds,
            adaptive = self.config.adaptive_backoff_on_low_battery,
            "Capture scheduler started"
        );

        loop {
            self.tick().await;
            let delay = self.next_interval();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Capture scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{AcquisitionError, Reading};
    use crate::clock::ManualClock;
    use crate::sink::ChannelSink;
    use crate::storage::{EventKind, GeoPoint, StorageBuilder};
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back a fixed script of readings.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Reading, AcquisitionError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Reading, AcquisitionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ReadingSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn read(&self) -> Result<Reading, AcquisitionError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AcquisitionError::Unavailable("script exhausted".into())))
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_tick_appends_sample_with_clock_timestamp() {
        let clock = clock();
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let (sink, _rx) = ChannelSink::new();
        let source = ScriptedSource::new(vec![Ok(Reading::new()
            .with_location(GeoPoint::new(12.97, 77.59).unwrap())
            .with_metric("speed", 48.0))]);

        let mut scheduler = CaptureScheduler::new(
            CaptureConfig::default(),
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock.clone()),
        );

        let outcome = scheduler.tick().await;
        let TickOutcome::Captured { id, dropped } = outcome else {
            panic!("expected capture, got {outcome:?}");
        };
        assert_eq!(dropped, 0);
        assert_eq!(scheduler.state(), CaptureState::Idle);

        let entry = handles.buffer_reader.get(id).await.unwrap().unwrap();
        assert_eq!(entry.sample.timestamp(), clock.now());
        assert_eq!(entry.sample.metric("speed"), Some(48.0));
        assert!(entry.sample.location().is_some());

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquisition_failure_skips_tick() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let source = ScriptedSource::new(vec![
            Err(AcquisitionError::PermissionDenied("location".into())),
            Ok(Reading::new().with_metric("speed", 10.0)),
        ]);

        let mut scheduler = CaptureScheduler::new(
            CaptureConfig::default(),
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock()),
        );

        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
        assert_eq!(scheduler.state(), CaptureState::Idle);
        assert_eq!(handles.buffer_reader.stats().await.unwrap().total, 0);
        assert!(rx.try_recv().is_err(), "acquisition failures are not sink events");

        assert!(matches!(
            scheduler.tick().await,
            TickOutcome::Captured { .. }
        ));

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_reports_dropped_sample() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .capacity(2)
            .build()
            .await
            .unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let source = ScriptedSource::new(
            (0..3)
                .map(|i| Ok(Reading::new().with_metric("speed", f64::from(i))))
                .collect(),
        );
        let clock = clock();
        let mut scheduler = CaptureScheduler::new(
            CaptureConfig::default(),
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock.clone()),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            if let TickOutcome::Captured { id, .. } = scheduler.tick().await {
                ids.push(id);
            }
            clock.advance(chrono::Duration::seconds(10));
        }

        assert_eq!(ids.len(), 3);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::SampleDropped);
        assert_eq!(event.payload["sample_id"], ids[0].get());
        assert!(handles.buffer_reader.get(ids[0]).await.unwrap().is_none());

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_full_reported_when_all_in_flight() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .capacity(1)
            .build()
            .await
            .unwrap();
        let (sink, mut rx) = ChannelSink::new();
        let source = ScriptedSource::new(vec![Ok(Reading::new()), Ok(Reading::new())]);
        let mut scheduler = CaptureScheduler::new(
            CaptureConfig::default(),
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock()),
        );

        assert!(matches!(
            scheduler.tick().await,
            TickOutcome::Captured { .. }
        ));
        handles.buffer.lease(1).await.unwrap();

        assert_eq!(scheduler.tick().await, TickOutcome::StoreFailed);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::StorageFull);

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_low_battery_stretches_interval() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let (sink, _rx) = ChannelSink::new();
        let source = ScriptedSource::new(vec![
            Ok(Reading::new().with_battery(15.0)),
            Ok(Reading::new().with_battery(80.0)),
        ]);
        let config = CaptureConfig::default()
            .with_interval_seconds(30)
            .with_adaptive_backoff(true);
        let mut scheduler = CaptureScheduler::new(
            config,
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock()),
        );

        assert_eq!(scheduler.next_interval(), Duration::from_secs(30));
        scheduler.tick().await;
        assert_eq!(scheduler.next_interval(), Duration::from_secs(120));
        scheduler.tick().await;
        assert_eq!(scheduler.next_interval(), Duration::from_secs(30));

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_not_stretched_without_adaptive_flag() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let (sink, _rx) = ChannelSink::new();
        let source = ScriptedSource::new(vec![Ok(Reading::new().with_battery(5.0))]);
        let mut scheduler = CaptureScheduler::new(
            CaptureConfig::default().with_interval_seconds(0),
            source,
            handles.buffer.clone(),
            Arc::new(sink),
            Arc::new(clock()),
        );

        scheduler.tick().await;
        assert_eq!(scheduler.last_battery(), Some(5.0));
        assert_eq!(scheduler.next_interval(), MIN_INTERVAL);

        handles.shutdown().await.unwrap();
    }
}
