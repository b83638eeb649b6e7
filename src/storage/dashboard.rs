//! Read-only aggregation over delivered samples for the dashboard presenter.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::StorageError;
use crate::storage::rows::{ENTRY_COLUMNS, EntryRow};
use crate::storage::types::{BufferEntry, DeliveryOutcome, GeoPoint};

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `span` leading up to and including `now`.
    ///
    /// Timestamps are stored with millisecond precision, so the exclusive end
    /// sits one millisecond past `now`.
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - span,
            end: now + Duration::milliseconds(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Bucket width for [`DashboardReader::summaries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Bucket {
    Hourly,
    Daily,
}

impl Bucket {
    pub fn width(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
        }
    }

    /// Start of the bucket containing `ts` (UTC).
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        ts.duration_trunc(self.width()).unwrap_or(ts)
    }
}

/// min / max / avg / last of one metric over a range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub last: f64,
}

/// Acknowledged entries per outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub delivered: u64,
    pub rejected: u64,
    pub abandoned: u64,
}

/// Aggregate view of a time range.
///
/// Metric and distance figures cover delivered samples only; `outcomes`
/// counts every acknowledged entry in the range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub range: TimeRange,
    pub sample_count: u64,
    pub first_sample: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
    pub distance_km: f64,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub outcomes: OutcomeCounts,
}

impl DashboardSummary {
    /// Fold acknowledged entries (ordered by timestamp) into a summary.
    pub fn from_entries(range: TimeRange, entries: &[BufferEntry]) -> Self {
        let mut summary = DashboardSummary {
            range,
            sample_count: 0,
            first_sample: None,
            last_sample: None,
            distance_km: 0.0,
            metrics: BTreeMap::new(),
            outcomes: OutcomeCounts::default(),
        };
        let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
        let mut previous: Option<GeoPoint> = None;

        for entry in entries {
            match entry.outcome {
                Some(DeliveryOutcome::Delivered) => summary.outcomes.delivered += 1,
                Some(DeliveryOutcome::Rejected) => {
                    summary.outcomes.rejected += 1;
                    continue;
                }
                Some(DeliveryOutcome::Abandoned) => {
                    summary.outcomes.abandoned += 1;
                    continue;
                }
                None => continue,
            }

            let sample = &entry.sample;
            summary.sample_count += 1;
            summary.first_sample.get_or_insert(sample.timestamp());
            summary.last_sample = Some(sample.timestamp());

            if let Some(point) = sample.location() {
                if let Some(prev) = previous {
                    summary.distance_km += prev.distance_km(&point);
                }
                previous = Some(point);
            }

            for (name, &value) in sample.metrics() {
                if !value.is_finite() {
                    continue;
                }
                *sums.entry(name.as_str()).or_default() += value;
                summary
                    .metrics
                    .entry(name.clone())
                    .and_modify(|m| {
                        m.count += 1;
                        m.min = m.min.min(value);
                        m.max = m.max.max(value);
                        m.last = value;
                    })
                    .or_insert(MetricSummary {
                        count: 1,
                        min: value,
                        max: value,
                        avg: value,
                        last: value,
                    });
            }
        }

        for (name, metric) in summary.metrics.iter_mut() {
            if let Some(sum) = sums.get(name.as_str()) {
                metric.avg = sum / metric.count as f64;
            }
        }

        summary
    }
}

/// Dashboard query facade.
#[derive(Clone)]
pub struct DashboardReader {
    pool: SqlitePool,
}

impl std::fmt::Debug for DashboardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardReader").finish_non_exhaustive()
    }
}

impl DashboardReader {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Summarize acknowledged samples captured within `range`.
    pub async fn aggregate(&self, range: TimeRange) -> Result<DashboardSummary, StorageError> {
        let entries = self.acknowledged_in(range).await?;
        Ok(DashboardSummary::from_entries(range, &entries))
    }

    /// One summary per hour or day within `range`, oldest first. Empty
    /// buckets are omitted.
    pub async fn summaries(
        &self,
        range: TimeRange,
        bucket: Bucket,
    ) -> Result<Vec<DashboardSummary>, StorageError> {
        let entries = self.acknowledged_in(range).await?;

        let mut grouped: BTreeMap<DateTime<Utc>, Vec<BufferEntry>> = BTreeMap::new();
        for entry in entries {
            grouped
                .entry(bucket.floor(entry.sample.timestamp()))
                .or_default()
                .push(entry);
        }

        Ok(grouped
            .into_iter()
            .map(|(start, entries)| {
                let bucket_range = TimeRange::new(start, start + bucket.width());
                DashboardSummary::from_entries(bucket_range, &entries)
            })
            .collect())
    }

    async fn acknowledged_in(&self, range: TimeRange) -> Result<Vec<BufferEntry>, StorageError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM buffer_entries
             WHERE state = 'acknowledged' AND ts >= ? AND ts < ?
             ORDER BY ts ASC, id ASC"
        ))
        .bind(range.start.timestamp_millis())
        .bind(range.end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BufferEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageBuilder;
    use crate::storage::types::NewSample;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_bucket_floor() {
        assert_eq!(Bucket::Hourly.floor(at(10, 45)), at(10, 0));
        assert_eq!(Bucket::Daily.floor(at(10, 45)), at(0, 0));
    }

    #[tokio::test]
    async fn test_aggregate_only_counts_delivered_samples() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let buffer = &handles.buffer;

        let points = [(12.9716, 77.5946), (12.2958, 76.6394)];
        let mut ids = Vec::new();
        for (i, (lat, lon)) in points.iter().enumerate() {
            let sample = NewSample::new(at(10, i as u32 * 10))
                .with_location(GeoPoint::new(*lat, *lon).unwrap())
                .with_metric("speed", 40.0 + i as f64 * 20.0)
                .with_metric("fuel_percentage", 80.0 - i as f64);
            ids.push(buffer.append(sample).await.unwrap().id);
        }
        let rejected = buffer
            .append(NewSample::new(at(10, 30)).with_metric("speed", 500.0))
            .await
            .unwrap()
            .id;
        // Stays pending: excluded entirely.
        buffer
            .append(NewSample::new(at(10, 40)).with_metric("speed", 1.0))
            .await
            .unwrap();

        buffer.lease(3).await.unwrap();
        buffer.acknowledge(&ids).await.unwrap();
        buffer
            .acknowledge_with(&[rejected], DeliveryOutcome::Rejected)
            .await
            .unwrap();

        let summary = handles
            .dashboard
            .aggregate(TimeRange::new(at(0, 0), at(23, 0)))
            .await
            .unwrap();

        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.first_sample, Some(at(10, 0)));
        assert_eq!(summary.last_sample, Some(at(10, 10)));
        assert_eq!(summary.outcomes.delivered, 2);
        assert_eq!(summary.outcomes.rejected, 1);
        assert!((summary.distance_km - 127.0).abs() < 3.0);

        let speed = &summary.metrics["speed"];
        assert_eq!(speed.count, 2);
        assert_eq!(speed.min, 40.0);
        assert_eq!(speed.max, 60.0);
        assert_eq!(speed.avg, 50.0);
        assert_eq!(speed.last, 60.0);

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_hourly_summaries() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let buffer = &handles.buffer;

        for ts in [at(9, 15), at(9, 45), at(11, 5)] {
            buffer
                .append(NewSample::new(ts).with_metric("speed", 30.0))
                .await
                .unwrap();
        }
        let batch = buffer.lease(10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id()).collect();
        buffer.acknowledge(&ids).await.unwrap();

        let buckets = handles
            .dashboard
            .summaries(TimeRange::new(at(0, 0), at(23, 0)), Bucket::Hourly)
            .await
            .unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].range, TimeRange::new(at(9, 0), at(10, 0)));
        assert_eq!(buckets[0].sample_count, 2);
        assert_eq!(buckets[1].range.start, at(11, 0));
        assert_eq!(buckets[1].sample_count, 1);

        handles.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_last_range_includes_sample_taken_at_now() {
        let handles = StorageBuilder::from_url("sqlite::memory:")
            .build()
            .await
            .unwrap();
        let buffer = &handles.buffer;
        let now = at(12, 0);

        for ts in [now - Duration::hours(2), now] {
            buffer
                .append(NewSample::new(ts).with_metric("speed", 10.0))
                .await
                .unwrap();
        }
        let batch = buffer.lease(10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id()).collect();
        buffer.acknowledge(&ids).await.unwrap();

        let range = TimeRange::last(Duration::hours(1), now);
        assert!(range.contains(now));
        assert!(!range.contains(now - Duration::hours(2)));

        let summary = handles.dashboard.aggregate(range).await.unwrap();
        assert_eq!(summary.sample_count, 1);
        assert_eq!(summary.last_sample, Some(now));

        handles.shutdown().await.unwrap();
    }

    #[test]
    fn test_empty_summary() {
        let range = TimeRange::new(at(0, 0), at(1, 0));
        let summary = DashboardSummary::from_entries(range, &[]);
        assert_eq!(summary.sample_count, 0);
        assert!(summary.metrics.is_empty());
        assert_eq!(summary.distance_km, 0.0);
    }
}
