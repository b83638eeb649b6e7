//! Scheduled storage maintenance: retention purges and JSON backups.
//!
//! Jobs run on `tokio-cron-scheduler` from a 6-field cron expression
//! (`sec min hour day month weekday`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::sink::ErrorSink;
use crate::storage::{Event, EventKind, EventSeverity, EventSource, StorageAdmin, StorageError};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while configuring or running maintenance jobs.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("config error: {0}")]
    Config(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// =============================================================================
// Schedule
// =============================================================================

/// When a maintenance job runs: a validated 6-field cron expression,
/// e.g. `"0 0 3 * * *"` = daily at 03:00.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule(String);

impl Schedule {
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, MaintenanceError> {
        use std::str::FromStr;

        let expr = expr.as_ref();
        cron::Schedule::from_str(expr)
            .map_err(|e| MaintenanceError::Config(format!("invalid cron expression: {e}")))?;
        Ok(Self(expr.to_string()))
    }

    pub fn expr(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cron: {}", self.0)
    }
}

// =============================================================================
// Retention
// =============================================================================

fn default_schedule() -> String {
    "0 0 3 * * *".to_string()
}

fn default_max_age() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_keep_backups() -> usize {
    7
}

/// Retention and backup settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Cron expression for the maintenance job (default: daily at 03:00).
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Acknowledged entries and events older than this are purged (default: 30d).
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,
    /// Directory for JSON backups; no backups when unset.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Backups kept after each export (default: 7).
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            max_age: default_max_age(),
            backup_dir: None,
            keep_backups: default_keep_backups(),
        }
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub purged_entries: u64,
    pub purged_events: u64,
    pub backup: Option<PathBuf>,
}

/// One retention pass over the store. The backup is taken before purging so
/// it still holds the rows about to be deleted.
#[derive(Clone)]
pub struct RetentionTask {
    config: RetentionConfig,
    admin: StorageAdmin,
    sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for RetentionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionTask")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetentionTask {
    pub fn new(config: RetentionConfig, admin: StorageAdmin, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            config,
            admin,
            sink,
        }
    }

    pub async fn run_once(&self) -> Result<RetentionReport, MaintenanceError> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .map_err(|e| MaintenanceError::Config(format!("invalid max_age: {e}")))?;

        let backup = match &self.config.backup_dir {
            Some(dir) => Some(
                self.admin
                    .export_backup(dir, self.config.keep_backups)
                    .await?,
            ),
            None => None,
        };

        let purged_entries = self.admin.purge_acknowledged(max_age).await?;
        let purged_events = self.admin.purge_events(max_age).await?;

        let report = RetentionReport {
            purged_entries,
            purged_events,
            backup,
        };

        let mut event = Event::new(
            EventSource::Maintenance,
            EventKind::System,
            EventSeverity::Info,
            format!(
                "Retention purged {purged_entries} entries and {purged_events} events"
            ),
        )
        .with_payload("purged_entries", purged_entries)
        .with_payload("purged_events", purged_events);
        if let Some(path) = &report.backup {
            event = event.with_payload("backup", path.display().to_string());
        }
        self.sink.report(event);

        Ok(report)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Runs maintenance jobs on their cron schedules.
pub struct MaintenanceScheduler {
    scheduler: JobScheduler,
    sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler").finish_non_exhaustive()
    }
}

impl MaintenanceScheduler {
    pub async fn new(sink: Arc<dyn ErrorSink>) -> Result<Self, MaintenanceError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| MaintenanceError::Scheduler(e.to_string()))?;

        Ok(Self { scheduler, sink })
    }

    /// Register a retention task on `schedule`.
    pub async fn add_retention(
        &self,
        task: RetentionTask,
        schedule: Schedule,
    ) -> Result<uuid::Uuid, MaintenanceError> {
        let task = Arc::new(task);

        let make_callback = move || {
            let task = Arc::clone(&task);
            move |_: uuid::Uuid, _: JobScheduler| {
                let task = Arc::clone(&task);
                Box::pin(async move { run_retention(&task).await })
                    as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            }
        };

        let job = Job::new_cron_job_async(schedule.expr(), make_callback())
            .map_err(|e| MaintenanceError::Scheduler(e.to_string()))?;

        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| MaintenanceError::Scheduler(e.to_string()))?;

        tracing::info!(job = "retention", job_id = %job_id, schedule = %schedule, "Maintenance job registered");
        Ok(job_id)
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), MaintenanceError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| MaintenanceError::Scheduler(e.to_string()))?;
        tracing::info!("Maintenance scheduler started");
        Ok(())
    }

    /// Gracefully shutdown the scheduler with the default timeout.
    pub async fn shutdown(self) -> Result<(), MaintenanceError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), MaintenanceError> {
        let result = tokio::time::timeout(timeout, self.scheduler.shutdown()).await;

        match result {
            Ok(Ok(())) => {
                tracing::info!("Maintenance scheduler shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                let err = MaintenanceError::Scheduler(e.to_string());
                self.sink.report(
                    Event::new(
                        EventSource::Maintenance,
                        EventKind::System,
                        EventSeverity::Error,
                        "Maintenance scheduler shutdown failed",
                    )
                    .with_payload("error", err.to_string()),
                );
                Err(err)
            }
            Err(_) => {
                tracing::warn!(?timeout, "Maintenance scheduler shutdown timed out");
                Ok(())
            }
        }
    }
}

async fn run_retention(task: &RetentionTask) {
    let start = std::time::Instant::now();
    match task.run_once().await {
        Ok(report) => tracing::info!(
            purged_entries = report.purged_entries,
            purged_events = report.purged_events,
            backup = ?report.backup,
            duration_ms = start.elapsed().as_millis() as u64,
            "Retention completed"
        ),
        Err(e) => {
            task.sink.report(
                Event::new(
                    EventSource::Maintenance,
                    EventKind::System,
                    EventSeverity::Error,
                    format!("Retention failed: {e}"),
                )
                .with_payload("error", e.to_string()),
            );
        }
    }
}
