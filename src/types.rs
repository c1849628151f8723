//! Core data structures for the health metric pipeline
//!
//! These mirror the shapes the store understands: raw metric points,
//! hourly/daily rollups, and workout sessions.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A single normalized health metric data point.
///
/// Ephemeral: produced by the extractor and consumed immediately by the
/// aggregator and dispatcher, never persisted as an object. The timestamp
/// keeps the UTC offset it was exported with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
    pub unit: String,
    /// Recording device/app, empty when the export does not carry one.
    pub source: String,
}

/// Rollup granularity produced by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }

    /// Measurement (table) name the store writes this granularity to.
    pub fn measurement(&self) -> &'static str {
        match self {
            Granularity::Hourly => "health_metrics_hourly",
            Granularity::Daily => "health_metrics_daily",
        }
    }
}

/// An hourly or daily rollup for one `(metric, period_start, unit)` bucket.
///
/// Invariants: `count >= 1`, `avg == sum / count`, and every contributing
/// sample value lies in `[min, max]`. Immutable once finalized; the store
/// overwrites a bucket wholesale, it never merges in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub metric_name: String,
    /// Start of the aggregation period, truncated in the timestamp's own
    /// offset (not normalized to UTC first).
    pub period_start: DateTime<FixedOffset>,
    pub unit: String,
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// One heart-rate point inside a workout's detail series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutHrSample {
    pub timestamp: DateTime<FixedOffset>,
    pub heart_rate: f64,
}

/// A discrete workout session.
///
/// Independent of the metric-sample pipeline: written as one summary point
/// plus a heart-rate detail series. The heart-rate summary statistics are
/// computed once at parse time, not by the bucket aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workout {
    pub workout_id: String,
    pub name: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub duration_seconds: f64,
    pub location: String,

    pub total_distance: Option<f64>,
    pub distance_unit: String,
    pub total_active_energy: Option<f64>,
    pub energy_unit: String,
    pub total_steps: Option<i64>,

    pub avg_heart_rate: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub min_heart_rate: Option<f64>,

    pub intensity: Option<f64>,
    pub intensity_unit: String,

    pub heart_rate_samples: Vec<WorkoutHrSample>,
}
