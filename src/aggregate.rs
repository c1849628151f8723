//! Streaming bucket aggregation for health metric samples
//!
//! Accumulates samples into hour and day buckets keyed by
//! `(metric_name, period_start, unit)` with O(1) running state per bucket
//! (count, sum, min, max). Memory is proportional to the number of distinct
//! bucket keys touched, not to the number of raw samples, which is why
//! samples are folded in streaming fashion instead of materialized first.
//!
//! Period truncation happens in the timestamp's own offset, not normalized
//! to UTC first. Two samples with the same wall-clock hour under different
//! offsets therefore land in different-looking buckets; bucket keys compare
//! by absolute instant (`DateTime` equality), so locally-identical periods
//! that resolve to the same instant share one bucket. Callers integrating
//! across time zones must be aware of this.

use crate::types::{AggregatedMetric, MetricSample};
use chrono::{DateTime, FixedOffset, Timelike};
use std::collections::HashMap;

/// Truncate a timestamp to the start of its containing hour, in the
/// timestamp's own offset.
pub fn truncate_to_hour(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Truncate a timestamp to the start of its containing day, in the
/// timestamp's own offset.
pub fn truncate_to_day(ts: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    truncate_to_hour(ts).with_hour(0).unwrap_or(ts)
}

/// Accumulation key for one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub metric_name: String,
    pub period_start: DateTime<FixedOffset>,
    pub unit: String,
}

/// Running state for one bucket. Append-only: there is no support for
/// removing a previously added sample.
#[derive(Debug, Clone)]
struct Bucket {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Bucket {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn fold(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Streaming aggregator maintaining hourly and daily buckets side by side.
///
/// One instance per ingestion run, owned by the run and discarded at
/// completion. `finalize_*` snapshots the accumulated state; invoke after
/// ingestion is complete, further `add` calls are not reflected in rollups
/// already taken.
#[derive(Debug, Default)]
pub struct StreamingAggregator {
    hourly: HashMap<BucketKey, Bucket>,
    daily: HashMap<BucketKey, Bucket>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sample into its hour and day buckets. O(1) amortized.
    pub fn add(&mut self, sample: &MetricSample) {
        let hourly_key = BucketKey {
            metric_name: sample.metric_name.clone(),
            period_start: truncate_to_hour(sample.timestamp),
            unit: sample.unit.clone(),
        };
        self.hourly
            .entry(hourly_key)
            .or_insert_with(Bucket::new)
            .fold(sample.value);

        let daily_key = BucketKey {
            metric_name: sample.metric_name.clone(),
            period_start: truncate_to_day(sample.timestamp),
            unit: sample.unit.clone(),
        };
        self.daily
            .entry(daily_key)
            .or_insert_with(Bucket::new)
            .fold(sample.value);
    }

    /// Snapshot all hourly rollups, sorted by (metric, period, unit).
    pub fn finalize_hourly(&self) -> Vec<AggregatedMetric> {
        finalize(&self.hourly)
    }

    /// Snapshot all daily rollups, sorted by (metric, period, unit).
    pub fn finalize_daily(&self) -> Vec<AggregatedMetric> {
        finalize(&self.daily)
    }

    /// Number of distinct hourly buckets touched so far.
    pub fn hourly_bucket_count(&self) -> usize {
        self.hourly.len()
    }

    /// Number of distinct daily buckets touched so far.
    pub fn daily_bucket_count(&self) -> usize {
        self.daily.len()
    }

    /// Reset all state. Used between independent runs, not within one.
    pub fn clear(&mut self) {
        self.hourly.clear();
        self.daily.clear();
    }
}

fn finalize(buckets: &HashMap<BucketKey, Bucket>) -> Vec<AggregatedMetric> {
    let mut rollups: Vec<AggregatedMetric> = buckets
        .iter()
        .map(|(key, bucket)| AggregatedMetric {
            metric_name: key.metric_name.clone(),
            period_start: key.period_start,
            unit: key.unit.clone(),
            count: bucket.count,
            sum: bucket.sum,
            avg: bucket.sum / bucket.count as f64,
            min: bucket.min,
            max: bucket.max,
        })
        .collect();

    sort_rollups(&mut rollups);
    rollups
}

fn sort_rollups(rollups: &mut [AggregatedMetric]) {
    rollups.sort_by(|a, b| {
        a.metric_name
            .cmp(&b.metric_name)
            .then(a.period_start.cmp(&b.period_start))
            .then(a.unit.cmp(&b.unit))
    });
}

/// Re-aggregate hourly rollups into daily rollups without touching raw
/// samples.
///
/// For any partition of a sample set into hourly groups this combination is
/// equivalent to aggregating the raw samples directly: counts and sums add,
/// min/max widen. Only `avg` may differ by floating-point rounding order.
pub fn rollup_hourly_to_daily(hourly: &[AggregatedMetric]) -> Vec<AggregatedMetric> {
    let mut buckets: HashMap<BucketKey, Bucket> = HashMap::new();

    for agg in hourly {
        let key = BucketKey {
            metric_name: agg.metric_name.clone(),
            period_start: truncate_to_day(agg.period_start),
            unit: agg.unit.clone(),
        };
        let bucket = buckets.entry(key).or_insert_with(Bucket::new);
        bucket.count += agg.count;
        bucket.sum += agg.sum;
        bucket.min = bucket.min.min(agg.min);
        bucket.max = bucket.max.max(agg.max);
    }

    let mut rollups: Vec<AggregatedMetric> = buckets
        .into_iter()
        .map(|(key, bucket)| AggregatedMetric {
            metric_name: key.metric_name,
            period_start: key.period_start,
            unit: key.unit,
            count: bucket.count,
            sum: bucket.sum,
            avg: if bucket.count > 0 {
                bucket.sum / bucket.count as f64
            } else {
                0.0
            },
            min: bucket.min,
            max: bucket.max,
        })
        .collect();

    sort_rollups(&mut rollups);
    rollups
}
