//! healthflow - health export ingestion and aggregation pipeline
//!
//! Takes JSON export documents from health tracking apps and turns them
//! into time-series artifacts in SQLite: raw per-sample points, hourly
//! rollups, and daily rollups, plus workout summaries with per-reading
//! heart rate detail.
//!
//! The pipeline is organized as:
//! - [`extract`]: schema-tolerant extraction of samples and workouts
//!   from the export document
//! - [`aggregate`]: streaming min/max/sum/count bucketing and the
//!   hourly-to-daily rollup combinator
//! - [`store`]: the [`store::MetricStore`] trait and its SQLite backend
//! - [`dispatch`]: capacity-bounded batched writes
//! - [`ingest`]: the run controller tying the stages together
//!
//! # Sharp edge: concurrent runs
//!
//! [`ingest::IngestController`] serializes runs it owns, but nothing
//! prevents two separate controllers (or processes) from ingesting into
//! the same store at once. That race silently corrupts the rollups near
//! the watermark boundary. Run one controller per store.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod extract;
pub mod ingest;
pub mod store;
pub mod types;

pub use config::Config;
pub use ingest::{ImportMode, IngestController, RunError, RunStage, RunSummary};
pub use store::{MetricStore, SqliteMetricStore};
pub use types::{AggregatedMetric, Granularity, MetricSample, Workout};
