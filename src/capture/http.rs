//! Reading source backed by the dashboard controller's JSON endpoint.
//!
//! The controller (an ESP8266 board on its own Wi-Fi network) serves the
//! current dashboard state as a flat JSON object. Location, battery and
//! metrics are picked out with JSONPath expressions.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use tokio::time::timeout;

use crate::capture::traits::{AcquisitionError, Reading, ReadingSource, SourceError};
use crate::storage::{GeoPoint, Metrics};

/// Default controller endpoint.
pub const DEFAULT_URL: &str = "http://192.168.4.1/dashboard";

/// Default request timeout (5 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn default_name() -> String {
    "dashboard".to_string()
}

fn default_url() -> String {
    DEFAULT_URL.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_latitude() -> Option<String> {
    Some("$.latitude".to_string())
}

fn default_longitude() -> Option<String> {
    Some("$.longitude".to_string())
}

fn default_battery() -> Option<String> {
    Some("$.battery".to_string())
}

/// Metric extraction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricExtraction {
    /// Name for the extracted metric.
    pub name: String,
    /// JSONPath expression to extract value.
    pub jsonpath: String,
}

/// Configuration for [`HttpReadingSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// Name used in logs (default: "dashboard").
    #[serde(default = "default_name")]
    pub name: String,
    /// Controller URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Request timeout (default: 5s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Request headers (values already env-expanded).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSONPath of the latitude (default: `$.latitude`).
    #[serde(default = "default_latitude")]
    pub latitude: Option<String>,
    /// JSONPath of the longitude (default: `$.longitude`).
    #[serde(default = "default_longitude")]
    pub longitude: Option<String>,
    /// JSONPath of the battery percentage (default: `$.battery`).
    #[serde(default = "default_battery")]
    pub battery: Option<String>,
    /// Metrics to extract. When empty every other top-level numeric field
    /// becomes a metric under its own name.
    #[serde(default)]
    pub metrics: Vec<MetricExtraction>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            url: default_url(),
            timeout: DEFAULT_TIMEOUT,
            headers: BTreeMap::new(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            battery: default_battery(),
            metrics: Vec::new(),
        }
    }
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, jsonpath: impl Into<String>) -> Self {
        self.metrics.push(MetricExtraction {
            name: name.into(),
            jsonpath: jsonpath.into(),
        });
        self
    }
}

/// Compiled JSONPath expressions.
#[derive(Debug)]
struct Extractor {
    latitude: Option<JsonPath>,
    longitude: Option<JsonPath>,
    battery: Option<JsonPath>,
    metrics: Vec<(String, JsonPath)>,
    /// Top-level keys consumed by location/battery, skipped when
    /// collecting metrics implicitly.
    reserved: Vec<String>,
}

fn compile(expr: &str) -> Result<JsonPath, SourceError> {
    JsonPath::parse(expr)
        .map_err(|e| SourceError::Config(format!("invalid JSONPath '{expr}': {e}")))
}

fn compile_opt(expr: Option<&String>) -> Result<Option<JsonPath>, SourceError> {
    expr.map(|e| compile(e)).transpose()
}

impl Extractor {
    fn new(config: &HttpSourceConfig) -> Result<Self, SourceError> {
        let metrics = config
            .metrics
            .iter()
            .map(|m| Ok((m.name.clone(), compile(&m.jsonpath)?)))
            .collect::<Result<Vec<_>, SourceError>>()?;

        let reserved = [&config.latitude, &config.longitude, &config.battery]
            .into_iter()
            .flatten()
            .filter_map(|p| p.strip_prefix("$."))
            .map(str::to_string)
            .collect();

        Ok(Self {
            latitude: compile_opt(config.latitude.as_ref())?,
            longitude: compile_opt(config.longitude.as_ref())?,
            battery: compile_opt(config.battery.as_ref())?,
            metrics,
            reserved,
        })
    }

    /// Turn a controller document into a reading.
    fn extract(&self, body: &Value) -> Result<Reading, AcquisitionError> {
        if !body.is_object() {
            return Err(AcquisitionError::Malformed(
                "expected a JSON object".to_string(),
            ));
        }

        let latitude = self.latitude.as_ref().and_then(|p| first_f64(p, body));
        let longitude = self.longitude.as_ref().and_then(|p| first_f64(p, body));
        let location = match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon).ok_or_else(|| {
                AcquisitionError::Malformed(format!("coordinate out of range: {lat}, {lon}"))
            })?),
            _ => None,
        };

        let mut metrics = Metrics::new();
        if self.metrics.is_empty() {
            if let Value::Object(map) = body {
                for (key, value) in map {
                    if self.reserved.iter().any(|r| r == key) {
                        continue;
                    }
                    if let Some(v) = value.as_f64() {
                        metrics.insert(key.clone(), v);
                    }
                }
            }
        } else {
            for (name, path) in &self.metrics {
                match first_f64(path, body) {
                    Some(v) => {
                        metrics.insert(name.clone(), v);
                    }
                    None => tracing::debug!(metric = %name, "Metric missing from reading"),
                }
            }
        }

        Ok(Reading {
            location,
            metrics,
            battery_percent: self.battery.as_ref().and_then(|p| first_f64(p, body)),
        })
    }
}

fn first_f64(path: &JsonPath, body: &Value) -> Option<f64> {
    path.query(body)
        .first()
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

/// Polls the controller over HTTP.
pub struct HttpReadingSource {
    config: HttpSourceConfig,
    extractor: Extractor,
    client: Client,
}

impl std::fmt::Debug for HttpReadingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReadingSource")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpReadingSource {
    /// Create a source, compiling every JSONPath up front.
    ///
    /// # Errors
    /// Returns `SourceError::Config` for invalid JSONPath expressions.
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceError> {
        let extractor = Extractor::new(&config)?;
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            extractor,
            client,
        })
    }
}

#[async_trait::async_trait]
impl ReadingSource for HttpReadingSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn read(&self) -> Result<Reading, AcquisitionError> {
        let mut request = self.client.get(&self.config.url);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = match timeout(self.config.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(AcquisitionError::Timeout(self.config.timeout));
            }
            Ok(Err(e)) => return Err(AcquisitionError::Unavailable(e.to_string())),
            Err(_) => return Err(AcquisitionError::Timeout(self.config.timeout)),
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AcquisitionError::PermissionDenied(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(AcquisitionError::Unavailable(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AcquisitionError::Malformed(e.to_string()))?;

        let reading = self.extractor.extract(&body)?;
        tracing::debug!(
            name = %self.config.name,
            metrics = reading.metrics.len(),
            located = reading.location.is_some(),
            "Reading acquired"
        );
        Ok(reading)
    }
}
