//! Application configuration structures.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureConfig, HttpSourceConfig};
use crate::maintenance::RetentionConfig;
use crate::storage::DEFAULT_CAPACITY;
use crate::sync::{HttpTransportConfig, MAX_BATCH_SIZE, SyncConfig};

use super::validation::{ConfigError, expand_env_vars, validate_cron};

// =============================================================================
// Constants
// =============================================================================

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Default database file.
pub const DEFAULT_DB_PATH: &str = "data/activa.db";

/// Default remote sync endpoint.
pub const DEFAULT_SYNC_ENDPOINT: &str = "http://127.0.0.1:9000/api/sync";

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_SYNC_ENDPOINT.to_string()
}

fn default_true() -> bool {
    true
}

fn validation(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| validation(format!("{field}: invalid URL '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation(format!(
            "{field}: unsupported scheme '{}'",
            parsed.scheme()
        )));
    }
    Ok(())
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Presenter API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the presenter API (default: true).
    pub enabled: bool,

    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Durable buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Maximum buffered entries (default: 10000).
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// MPSC channel capacity for buffer commands (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            capacity: DEFAULT_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// =============================================================================
// Capture / Sync Configuration
// =============================================================================

/// Capture scheduler plus the reading source it polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSection {
    /// Run the capture scheduler (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub schedule: CaptureConfig,

    /// Dashboard controller endpoint.
    #[serde(default)]
    pub source: HttpSourceConfig,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: CaptureConfig::default(),
            source: HttpSourceConfig::default(),
        }
    }
}

/// Sync engine plus the remote API it talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Remote sync endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Extra request headers; supports `${VAR:-default}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(flatten)]
    pub engine: SyncConfig,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            headers: BTreeMap::new(),
            engine: SyncConfig::default(),
        }
    }
}

impl SyncSection {
    /// Transport settings; the engine timeout doubles as the HTTP timeout.
    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            endpoint: self.endpoint.clone(),
            timeout: self.engine.timeout,
            headers: self.headers.clone(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub capture: CaptureSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse, expand environment variables and validate.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` references in endpoints and header values.
    pub fn expand_env(&mut self) {
        self.sync.endpoint = expand_env_vars(&self.sync.endpoint);
        self.sync.engine.device_id = expand_env_vars(&self.sync.engine.device_id);
        for value in self.sync.headers.values_mut() {
            *value = expand_env_vars(value);
        }
        self.capture.source.url = expand_env_vars(&self.capture.source.url);
        for value in self.capture.source.headers.values_mut() {
            *value = expand_env_vars(value);
        }
    }

    /// Replace the sync endpoint, expanding `${VAR}` the same way as the file.
    pub fn set_sync_endpoint(&mut self, endpoint: &str) {
        self.sync.endpoint = expand_env_vars(endpoint);
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            validation(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;
        if self.server.port == 0 {
            return Err(validation("server port must be non-zero"));
        }

        if self.database.path.trim().is_empty() {
            return Err(validation("database path must not be empty"));
        }
        if self.database.capacity == 0 {
            return Err(validation("database capacity must be positive"));
        }
        if self.database.channel_capacity == 0 {
            return Err(validation("database channel_capacity must be positive"));
        }

        let capture = &self.capture.schedule;
        if capture.interval_seconds == 0 {
            return Err(validation("capture interval_seconds must be positive"));
        }
        if capture.low_battery_multiplier == 0 {
            return Err(validation("capture low_battery_multiplier must be positive"));
        }
        if !(0.0..=100.0).contains(&capture.low_battery_threshold) {
            return Err(validation(
                "capture low_battery_threshold must be between 0 and 100",
            ));
        }
        validate_url("capture.source.url", &self.capture.source.url)?;
        if self.capture.source.timeout.is_zero() {
            return Err(validation("capture.source timeout must be positive"));
        }

        validate_url("sync.endpoint", &self.sync.endpoint)?;
        let sync = &self.sync.engine;
        if sync.device_id.trim().is_empty() {
            return Err(validation("sync device_id must not be empty"));
        }
        if sync.sync_interval_seconds == 0 {
            return Err(validation("sync sync_interval_seconds must be positive"));
        }
        if sync.max_batch_size == 0 || sync.max_batch_size > MAX_BATCH_SIZE {
            return Err(validation(format!(
                "sync max_batch_size must be between 1 and {MAX_BATCH_SIZE}"
            )));
        }
        if !sync.backoff_multiplier.is_finite() || sync.backoff_multiplier < 1.0 {
            return Err(validation("sync backoff_multiplier must be at least 1.0"));
        }
        if sync.timeout.is_zero() {
            return Err(validation("sync timeout must be positive"));
        }

        validate_cron("retention.schedule", &self.retention.schedule)?;
        if self.retention.max_age.is_zero() {
            return Err(validation("retention max_age must be positive"));
        }
        if self.retention.backup_dir.is_some() && self.retention.keep_backups == 0 {
            return Err(validation(
                "retention keep_backups must be positive when backup_dir is set",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FULL: &str = r#"
server:
  bind: "127.0.0.1"
  port: 9090
database:
  path: "/var/lib/activa/buffer.db"
  capacity: 500
capture:
  interval_seconds: 5
  adaptive_backoff_on_low_battery: true
  source:
    url: "http://192.168.4.1/dashboard"
    timeout: 2s
    metrics:
      - name: speed
        jsonpath: "$.speed"
sync:
  endpoint: "https://api.example.com/sync"
  device_id: "board-7"
  max_batch_size: 25
  backoff_multiplier: 1.5
  max_backoff: 2m
  headers:
    Authorization: "Bearer ${ACTIVA_CONFIG_TEST_TOKEN:-none}"
retention:
  schedule: "0 30 2 * * *"
  max_age: 7d
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, DEFAULT_DB_PATH);
        assert_eq!(config.database.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_full_yaml() {
        let config = AppConfig::from_yaml(FULL).unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.database.capacity, 500);
        assert_eq!(config.database.channel_capacity, DEFAULT_CHANNEL_CAPACITY);

        assert_eq!(config.capture.schedule.interval_seconds, 5);
        assert!(config.capture.schedule.adaptive_backoff_on_low_battery);
        assert_eq!(config.capture.source.timeout, Duration::from_secs(2));
        assert_eq!(config.capture.source.metrics.len(), 1);

        assert_eq!(config.sync.engine.device_id, "board-7");
        assert_eq!(config.sync.engine.max_batch_size, 25);
        assert_eq!(config.sync.engine.max_backoff, Duration::from_secs(120));
        assert_eq!(config.sync.engine.sync_interval_seconds, 60);
        assert_eq!(
            config.sync.headers.get("Authorization").map(String::as_str),
            Some("Bearer none")
        );

        let transport = config.sync.transport();
        assert_eq!(transport.endpoint, "https://api.example.com/sync");
        assert_eq!(transport.timeout, config.sync.engine.timeout);

        assert_eq!(config.retention.schedule, "0 30 2 * * *");
        assert_eq!(config.retention.max_age, Duration::from_secs(7 * 86400));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, FULL).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9090);

        assert!(matches!(
            AppConfig::load(dir.path().join("missing.yaml")),
            Err(ConfigError::IoError(_))
        ));
    }

    #[test]
    fn test_sync_endpoint_override_is_expanded() {
        let mut config = AppConfig::default();
        config.set_sync_endpoint("http://${ACTIVA_UNSET_SYNC_HOST_FOR_TEST:-10.0.0.5}:9000/api/sync");
        assert_eq!(config.sync.endpoint, "http://10.0.0.5:9000/api/sync");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_bind_address() {
        let mut config = AppConfig::default();
        config.server.bind = "not-an-ip".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid server bind address"));
    }

    #[test]
    fn test_config_validation_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.database.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sync.engine.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sync.engine.max_batch_size = MAX_BATCH_SIZE + 1;
        assert!(config.validate().is_err());
        config.sync.engine.max_batch_size = MAX_BATCH_SIZE;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.capture.schedule.interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_shrinking_backoff() {
        let mut config = AppConfig::default();
        config.sync.engine.backoff_multiplier = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_multiplier"));
    }

    #[test]
    fn test_config_validation_rejects_bad_endpoint_and_cron() {
        let mut config = AppConfig::default();
        config.sync.endpoint = "ftp://example.com/sync".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("sync.endpoint"));

        let mut config = AppConfig::default();
        config.retention.schedule = "nightly".to_string();
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("retention.schedule")
        );
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(
            AppConfig::from_yaml("server: [1, 2"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
