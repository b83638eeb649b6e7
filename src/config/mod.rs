//! Configuration module for the Activa sync service.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Presenter API settings (port, bind address)
//! - Durable buffer settings (path, capacity, channel capacity)
//! - Capture scheduler and dashboard controller source
//! - Sync engine and remote endpoint
//! - Retention and backups

mod app;
mod validation;

pub use app::{
    AppConfig, CaptureSection, DatabaseConfig, ServerConfig, SyncSection,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_DB_PATH, DEFAULT_SYNC_ENDPOINT,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration, validate_cron};
