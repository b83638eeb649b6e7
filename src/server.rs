//! Presenter HTTP API.
//!
//! Read-only JSON endpoints over the local store: trip summaries for the
//! dashboard, buffer occupancy, the event log and the sync engine status.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::clock::Clock;
use crate::config::parse_duration;
use crate::storage::{
    Bucket, BufferReader, DashboardReader, EventQuery, EventReader, SortOrder, StorageError,
    TimeRange,
};
use crate::sync::SyncStatus;

/// Default range for `/api/summary`.
const DEFAULT_SUMMARY_RANGE: &str = "24h";

/// Default range for `/api/summary/buckets`.
const DEFAULT_BUCKETS_RANGE: &str = "7d";

/// Longest range a request may ask for.
const MAX_RANGE: std::time::Duration = std::time::Duration::from_secs(366 * 24 * 3600);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub buffer_reader: BufferReader,
    pub event_reader: EventReader,
    pub dashboard: DashboardReader,
    pub sync_status: watch::Receiver<SyncStatus>,
    pub clock: Arc<dyn Clock>,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn storage_error(e: StorageError) -> Response {
    tracing::error!(error = %e, "Storage query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Query parameters for summary APIs.
#[derive(Debug, Deserialize)]
pub struct SummaryQueryParams {
    pub range: Option<String>,
    pub bucket: Option<String>,
}

/// Query parameters for events API.
#[derive(Debug, Deserialize)]
pub struct EventsQueryParams {
    pub source: Option<String>,
    pub kind: Option<String>,
    pub severity: Option<String>,
    pub limit: Option<u32>,
    pub order: Option<String>,
    pub range: Option<String>,
}

/// Parse sort order from string.
fn parse_sort_order(s: Option<String>) -> Option<SortOrder> {
    s.and_then(|order| order.to_lowercase().parse().ok())
}

/// Parse a look-back range such as `1h`, `24h`, `7d` or `90m`.
fn parse_range(range: Option<&str>, default: &str) -> Result<chrono::Duration, String> {
    let raw = range.filter(|r| !r.trim().is_empty()).unwrap_or(default);
    let span = parse_duration(raw).map_err(|e| format!("invalid range '{raw}': {e}"))?;
    if span.is_zero() || span > MAX_RANGE {
        return Err(format!("range '{raw}' must be between 1s and 366d"));
    }
    chrono::Duration::from_std(span).map_err(|e| format!("invalid range '{raw}': {e}"))
}

/// Parse an optional enum filter, rejecting unknown values.
fn parse_filter<T: std::str::FromStr>(
    name: &str,
    value: Option<&str>,
) -> Result<Option<T>, String> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| format!("unknown {name} '{v}'")),
    }
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/summary/buckets", get(buckets_handler))
        .route("/api/buffer/stats", get(buffer_stats_handler))
        .route("/api/events", get(events_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks the database is answering.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.buffer_reader.stats().await {
        Ok(_) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

/// Aggregate of delivered samples over the range (default 24h).
async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryQueryParams>,
) -> Response {
    let span = match parse_range(params.range.as_deref(), DEFAULT_SUMMARY_RANGE) {
        Ok(span) => span,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let range = TimeRange::last(span, state.clock.now());
    match state.dashboard.aggregate(range).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => storage_error(e),
    }
}

/// Hourly or daily summaries over the range (default 7d, daily).
async fn buckets_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryQueryParams>,
) -> Response {
    let span = match parse_range(params.range.as_deref(), DEFAULT_BUCKETS_RANGE) {
        Ok(span) => span,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    let bucket = match parse_filter::<Bucket>("bucket", params.bucket.as_deref()) {
        Ok(bucket) => bucket.unwrap_or(Bucket::Daily),
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let range = TimeRange::last(span, state.clock.now());
    match state.dashboard.summaries(range, bucket).await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => storage_error(e),
    }
}

/// Buffer occupancy by state and outcome.
async fn buffer_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.buffer_reader.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => storage_error(e),
    }
}

/// Build an event query from request parameters.
fn event_query(params: EventsQueryParams, now: DateTime<Utc>) -> Result<EventQuery, String> {
    let start = match params.range.as_deref().filter(|r| !r.trim().is_empty()) {
        Some(raw) => Some(now - parse_range(Some(raw), raw)?),
        None => None,
    };

    Ok(EventQuery {
        start,
        end: None,
        source: parse_filter("source", params.source.as_deref())?,
        kind: parse_filter("kind", params.kind.as_deref())?,
        severity: parse_filter("severity", params.severity.as_deref())?,
        limit: params.limit,
        order: parse_sort_order(params.order),
    })
}

/// Event log query, newest first by default.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQueryParams>,
) -> Response {
    let query = match event_query(params, state.clock.now()) {
        Ok(query) => query,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    match state.event_reader.query(query).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => storage_error(e),
    }
}

/// Latest sync engine status.
async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Json<SyncStatus> {
    Json(state.sync_status.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EventKind;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range(Some("24h"), DEFAULT_SUMMARY_RANGE).unwrap(),
            chrono::Duration::hours(24)
        );
        assert_eq!(
            parse_range(None, DEFAULT_BUCKETS_RANGE).unwrap(),
            chrono::Duration::days(7)
        );
        assert_eq!(
            parse_range(Some(""), "1h").unwrap(),
            chrono::Duration::hours(1)
        );
        assert!(parse_range(Some("yesterday"), "1h").is_err());
        assert!(parse_range(Some("0s"), "1h").is_err());
        assert!(parse_range(Some("400d"), "1h").is_err());
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            parse_filter::<EventKind>("kind", Some("sample_dropped")).unwrap(),
            Some(EventKind::SampleDropped)
        );
        assert_eq!(parse_filter::<Bucket>("bucket", None).unwrap(), None);
        assert_eq!(
            parse_filter::<Bucket>("bucket", Some("HOURLY")).unwrap(),
            Some(Bucket::Hourly)
        );
        let err = parse_filter::<Bucket>("bucket", Some("weekly")).unwrap_err();
        assert!(err.contains("unknown bucket"));
    }

    #[test]
    fn test_parse_sort_order() {
        assert_eq!(parse_sort_order(Some("ASC".into())), Some(SortOrder::Asc));
        assert_eq!(parse_sort_order(Some("sideways".into())), None);
        assert_eq!(parse_sort_order(None), None);
    }
}
