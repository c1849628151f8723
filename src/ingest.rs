//! Ingestion controller - orchestrates one import run end to end
//!
//! A run walks a fixed sequence of stages:
//!
//! `Idle → Loading → Extracting → Aggregating → Reconciling → Dispatching
//! → Committed`, with `Failed` reachable from any non-terminal stage.
//!
//! Loading reads the whole document into memory before extraction begins
//! (a known scalability ceiling, kept deliberately). Extraction and
//! aggregation run as a single sequential pass: every surviving sample is
//! dispatched raw (streamed through the batcher) and folded into the
//! aggregator at the same time. Reconciling applies only to incremental
//! runs: rollup ranges overlapping the watermark are range-deleted before
//! the new rollups are written, so the boundary bucket is replaced
//! wholesale rather than double-counted. Note that the rebuilt boundary
//! bucket only sees samples strictly after the watermark and therefore
//! undercounts any portion that arrived earlier; this matches the
//! historical behavior and is asserted by tests rather than silently fixed.
//!
//! The watermark advances only after raw, hourly, and daily dispatch have
//! all completed without error. A run that fails mid-dispatch leaves the
//! watermark where it was, so an incremental retry of the same document
//! re-ingests it instead of skipping data whose rollups were never written.
//!
//! # Concurrency
//!
//! A controller holds a run lock: at most one run is in flight per
//! controller at a time, and callers sharing one store MUST share one
//! controller. Two controllers pointed at the same store can each read a
//! stale watermark, each delete overlapping rollup ranges, and race on
//! whose writes win the boundary buckets - the result is silently
//! inconsistent aggregates, not a reported error. There is no internal
//! detection for this; single-flight per store is an operational
//! requirement.

use crate::aggregate::{
    rollup_hourly_to_daily, truncate_to_day, truncate_to_hour, StreamingAggregator,
};
use crate::config::Config;
use crate::dispatch::{dispatch_aggregates, SampleBatcher};
use crate::extract;
use crate::store::MetricStore;
use crate::types::Granularity;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How a run bounds the sample stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImportMode {
    /// Ingest every parsable record in the document.
    Full,
    /// Read the watermark from the store; ingest only records strictly
    /// after it. Falls back to a full run when no watermark exists.
    Incremental,
    /// Like `Incremental` but with a caller-supplied watermark.
    Since(DateTime<FixedOffset>),
}

/// Stage a run was in, for failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Loading,
    Extracting,
    Aggregating,
    Reconciling,
    Dispatching,
    Committed,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Idle => "idle",
            RunStage::Loading => "loading",
            RunStage::Extracting => "extracting",
            RunStage::Aggregating => "aggregating",
            RunStage::Reconciling => "reconciling",
            RunStage::Dispatching => "dispatching",
            RunStage::Committed => "committed",
            RunStage::Failed => "failed",
        }
    }
}

/// Outcome counters for one run.
///
/// In dry-run mode the counters still advance, reporting what a real run
/// would have written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub raw_written: usize,
    pub hourly_written: usize,
    pub daily_written: usize,
    pub workouts_written: usize,
    pub skipped_raw: usize,
    pub skipped_workouts: usize,
    pub errors: Vec<String>,
}

/// Run-level failure: the stage reached plus partial-progress counts.
///
/// Writes committed before the failure are not rolled back (at-least-once
/// across the artifact types, not atomic).
#[derive(Debug)]
pub struct RunError {
    pub stage: RunStage,
    pub partial: RunSummary,
    pub message: String,
}

impl RunError {
    fn new(stage: RunStage, partial: &RunSummary, err: impl fmt::Display) -> Self {
        let mut partial = partial.clone();
        partial.errors.push(err.to_string());
        Self {
            stage,
            partial,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ingestion failed during {}: {}", self.stage.as_str(), self.message)
    }
}

impl std::error::Error for RunError {}

/// Drives import runs against one store.
///
/// Owns the run lock; see the module docs for the single-flight
/// requirement.
pub struct IngestController {
    store: Arc<dyn MetricStore>,
    config: Config,
    run_lock: Mutex<()>,
}

impl IngestController {
    pub fn new(store: Arc<dyn MetricStore>, config: Config) -> Self {
        Self {
            store,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Ingest one export document and return the run summary.
    ///
    /// Serializes with any other run on this controller.
    pub async fn run(&self, document: &[u8], mode: ImportMode) -> Result<RunSummary, RunError> {
        let _guard = self.run_lock.lock().await;
        let mut summary = RunSummary::default();

        // Loading: the document is read in full before extraction begins.
        log::info!("📥 Loading export document ({} bytes)", document.len());
        let doc: Value = serde_json::from_slice(document)
            .map_err(|e| RunError::new(RunStage::Loading, &summary, e))?;

        let total_records = extract::total_metric_records(&doc);
        let total_workouts = extract::total_workout_records(&doc);
        log::info!(
            "   └─ Found {} metric record(s), {} workout(s)",
            total_records,
            total_workouts
        );
        if self.config.dry_run {
            log::info!("🔎 DRY RUN - no writes will be issued");
        }

        // Watermark read. Absent watermark means full run, not an error.
        let watermark = match mode {
            ImportMode::Full => None,
            ImportMode::Since(ts) => Some(ts),
            ImportMode::Incremental => self
                .store
                .watermark(None)
                .await
                .map_err(|e| RunError::new(RunStage::Reconciling, &summary, e))?,
        };

        match watermark {
            Some(w) => log::info!("⏱️  Incremental run, watermark: {}", w.to_rfc3339()),
            None => log::info!("⏱️  Full run (no watermark)"),
        }

        // Extracting + Aggregating: one sequential pass. Each surviving
        // sample is streamed to the raw batcher and folded into the
        // aggregator.
        let aggregate = self.config.write_hourly || self.config.write_daily;
        let mut aggregator = StreamingAggregator::new();
        let raw_progress = |count: usize| log::debug!("   processed {} raw sample(s)", count);
        let mut batcher = SampleBatcher::new(self.store.as_ref(), self.config.batch_size)
            .with_progress(&raw_progress);

        let mut max_seen: Option<DateTime<FixedOffset>> = None;
        let mut samples = extract::metric_samples(&doc);
        for sample in &mut samples {
            if let Some(w) = watermark {
                if sample.timestamp <= w {
                    summary.skipped_raw += 1;
                    continue;
                }
            }

            max_seen = Some(match max_seen {
                Some(m) if m >= sample.timestamp => m,
                _ => sample.timestamp,
            });

            if aggregate {
                aggregator.add(&sample);
            }

            if self.config.write_raw {
                if self.config.dry_run {
                    summary.raw_written += 1;
                } else if let Err(e) = batcher.push(sample).await {
                    summary.raw_written = batcher.written();
                    return Err(RunError::new(RunStage::Dispatching, &summary, e));
                }
            }
        }
        summary.skipped_raw += samples.dropped();

        log::info!(
            "📊 Aggregated {} hourly / {} daily bucket(s), skipped {} record(s)",
            aggregator.hourly_bucket_count(),
            aggregator.daily_bucket_count(),
            summary.skipped_raw
        );

        let hourly = if self.config.write_hourly {
            aggregator.finalize_hourly()
        } else {
            Vec::new()
        };
        let daily = if self.config.write_daily {
            if self.config.write_hourly {
                rollup_hourly_to_daily(&hourly)
            } else {
                aggregator.finalize_daily()
            }
        } else {
            Vec::new()
        };

        // Reconciling: range-delete rollups overlapping the watermark so
        // the subsequent write is authoritative, not additive.
        if let Some(w) = watermark {
            if !self.config.dry_run {
                if self.config.write_hourly {
                    let cutoff = truncate_to_hour(w);
                    log::info!("🧹 Deleting hourly rollups from {}", cutoff.to_rfc3339());
                    self.store
                        .delete_aggregates_from(Granularity::Hourly, cutoff)
                        .await
                        .map_err(|e| RunError::new(RunStage::Reconciling, &summary, e))?;
                }
                if self.config.write_daily {
                    let cutoff = truncate_to_day(w);
                    log::info!("🧹 Deleting daily rollups from {}", cutoff.to_rfc3339());
                    self.store
                        .delete_aggregates_from(Granularity::Daily, cutoff)
                        .await
                        .map_err(|e| RunError::new(RunStage::Reconciling, &summary, e))?;
                }
            }
        }

        // Dispatching: raw remainder, then hourly, then daily, then
        // workouts.
        if self.config.write_raw && !self.config.dry_run {
            match batcher.finish().await {
                Ok(written) => {
                    summary.raw_written = written;
                    log::info!("✅ Wrote {} raw sample(s)", written);
                }
                Err(e) => {
                    // Only flushed batches count as written
                    summary.raw_written = batcher.written();
                    return Err(RunError::new(RunStage::Dispatching, &summary, e));
                }
            }
        }

        if self.config.write_hourly {
            summary.hourly_written = if self.config.dry_run {
                hourly.len()
            } else {
                let progress = |count: usize| log::debug!("   wrote {} hourly rollup(s)", count);
                dispatch_aggregates(
                    self.store.as_ref(),
                    Granularity::Hourly,
                    hourly,
                    self.config.batch_size,
                    Some(&progress),
                )
                .await
                .map_err(|e| RunError::new(RunStage::Dispatching, &summary, e))?
            };
            log::info!("✅ Wrote {} hourly rollup(s)", summary.hourly_written);
        }

        if self.config.write_daily {
            summary.daily_written = if self.config.dry_run {
                daily.len()
            } else {
                let progress = |count: usize| log::debug!("   wrote {} daily rollup(s)", count);
                dispatch_aggregates(
                    self.store.as_ref(),
                    Granularity::Daily,
                    daily,
                    self.config.batch_size,
                    Some(&progress),
                )
                .await
                .map_err(|e| RunError::new(RunStage::Dispatching, &summary, e))?
            };
            log::info!("✅ Wrote {} daily rollup(s)", summary.daily_written);
        }

        // Commit point: raw, hourly, and daily all landed, so the watermark
        // may advance. A failure above leaves it untouched and a retry
        // re-ingests this document.
        let artifacts_enabled =
            self.config.write_raw || self.config.write_hourly || self.config.write_daily;
        if artifacts_enabled && !self.config.dry_run {
            if let Some(ts) = max_seen {
                self.store
                    .advance_watermark(None, ts)
                    .await
                    .map_err(|e| RunError::new(RunStage::Dispatching, &summary, e))?;
                log::info!("⏱️  Watermark advanced to {}", ts.to_rfc3339());
            }
        }

        let mut workout_iter = extract::workouts(&doc);
        for workout in &mut workout_iter {
            if !self.config.dry_run {
                self.store
                    .write_workout(&workout)
                    .await
                    .map_err(|e| RunError::new(RunStage::Dispatching, &summary, e))?;
            }
            summary.workouts_written += 1;
        }
        summary.skipped_workouts = workout_iter.dropped();

        // Committed
        log::info!("🏁 Ingestion complete");
        log::info!("   ├─ Raw samples:   {} written, {} skipped", summary.raw_written, summary.skipped_raw);
        log::info!("   ├─ Hourly rollups: {}", summary.hourly_written);
        log::info!("   ├─ Daily rollups:  {}", summary.daily_written);
        log::info!("   └─ Workouts:      {} written, {} skipped", summary.workouts_written, summary.skipped_workouts);

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::parse_timestamp;
    use crate::store::testing::RecordingStore;
    use serde_json::json;

    fn export_doc() -> Vec<u8> {
        json!({"data": {
            "metrics": [{
                "name": "m",
                "units": "u",
                "data": [
                    {"date": "2025-01-05 10:05:00 +0000", "qty": 5.0},
                    {"date": "2025-01-05 10:50:00 +0000", "qty": 7.0},
                    {"date": "2025-01-05 11:10:00 +0000", "qty": 3.0},
                ],
            }],
            "workouts": [{
                "id": "w1",
                "name": "Walk",
                "start": "2025-01-05 09:00:00 +0000",
                "duration": 600.0,
            }],
        }})
        .to_string()
        .into_bytes()
    }

    fn controller(store: Arc<RecordingStore>) -> IngestController {
        let config = Config {
            batch_size: 10,
            ..Config::default()
        };
        IngestController::new(store, config)
    }

    #[tokio::test]
    async fn test_full_run_counts_and_artifacts() {
        let store = Arc::new(RecordingStore::new());
        let summary = controller(store.clone())
            .run(&export_doc(), ImportMode::Full)
            .await
            .unwrap();

        // Drop accounting: every record is either written or skipped
        assert_eq!(summary.raw_written + summary.skipped_raw, 3);
        assert_eq!(summary.raw_written, 3);
        assert_eq!(summary.skipped_raw, 0);
        assert_eq!(summary.hourly_written, 2);
        assert_eq!(summary.daily_written, 1);
        assert_eq!(summary.workouts_written, 1);
        assert_eq!(summary.skipped_workouts, 0);

        assert_eq!(store.raw_written(), 3);
        assert!(store.deletes.lock().unwrap().is_empty());

        let aggregates = store.aggregate_batches.lock().unwrap();
        let (granularity, daily) = aggregates
            .iter()
            .find(|(g, _)| *g == Granularity::Daily)
            .cloned()
            .unwrap();
        assert_eq!(granularity, Granularity::Daily);
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].count, 3);
        assert_eq!(daily[0].sum, 15.0);
        assert_eq!(daily[0].min, 3.0);
        assert_eq!(daily[0].max, 7.0);
    }

    #[tokio::test]
    async fn test_incremental_run_filters_and_reconciles() {
        // Watermark 10:30: (10:05, 5) is a duplicate, (10:50, 7) survives.
        let watermark = parse_timestamp("2025-01-05 10:30:00 +0000").unwrap();
        let store = Arc::new(RecordingStore::with_watermark(watermark));

        let doc = json!({"data": {"metrics": [{
            "name": "m",
            "units": "u",
            "data": [
                {"date": "2025-01-05 10:05:00 +0000", "qty": 5.0},
                {"date": "2025-01-05 10:50:00 +0000", "qty": 7.0},
            ],
        }]}})
        .to_string()
        .into_bytes();

        let summary = controller(store.clone())
            .run(&doc, ImportMode::Incremental)
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 1);
        assert_eq!(summary.skipped_raw, 1);

        // Range deletes were issued at the truncated cutoffs
        let deletes = store.deletes.lock().unwrap().clone();
        assert_eq!(
            deletes,
            vec![
                (Granularity::Hourly, parse_timestamp("2025-01-05 10:00:00 +0000").unwrap()),
                (Granularity::Daily, parse_timestamp("2025-01-05 00:00:00 +0000").unwrap()),
            ]
        );

        // ...and strictly before the rollup writes
        let ops = store.ops.lock().unwrap().clone();
        let first_delete = ops.iter().position(|op| op.starts_with("delete")).unwrap();
        let first_agg_write = ops
            .iter()
            .position(|op| op.starts_with("write_aggregates"))
            .unwrap();
        assert!(first_delete < first_agg_write);

        // The rebuilt boundary bucket sees only post-watermark samples and
        // undercounts the true 10:00 hour (1 of its 2 samples). Preserved
        // behavior, asserted so the discrepancy stays visible.
        let aggregates = store.aggregate_batches.lock().unwrap();
        let (_, hourly) = aggregates
            .iter()
            .find(|(g, _)| *g == Granularity::Hourly)
            .cloned()
            .unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].period_start, parse_timestamp("2025-01-05 10:00:00 +0000").unwrap());
        assert_eq!(hourly[0].count, 1);
        assert_eq!(hourly[0].sum, 7.0);
    }

    #[tokio::test]
    async fn test_since_mode_uses_supplied_watermark() {
        let store = Arc::new(RecordingStore::new());
        let since = parse_timestamp("2025-01-05 10:30:00 +0000").unwrap();

        let summary = controller(store.clone())
            .run(&export_doc(), ImportMode::Since(since))
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 2); // 10:50 and 11:10
        assert_eq!(summary.skipped_raw, 1);
        assert_eq!(store.deletes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_without_watermark_is_full_run() {
        let store = Arc::new(RecordingStore::new());
        let summary = controller(store.clone())
            .run(&export_doc(), ImportMode::Incremental)
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 3);
        assert_eq!(summary.skipped_raw, 0);
        assert!(store.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_fail_run() {
        let store = Arc::new(RecordingStore::new());
        let doc = json!({"data": {"metrics": [{
            "name": "m",
            "units": "u",
            "data": [
                {"date": "not-a-date", "qty": 5.0},
                {"date": "2025-01-05 10:50:00 +0000", "qty": 7.0},
            ],
        }]}})
        .to_string()
        .into_bytes();

        let summary = controller(store).run(&doc, ImportMode::Full).await.unwrap();
        assert_eq!(summary.raw_written, 1);
        assert_eq!(summary.skipped_raw, 1);
    }

    #[tokio::test]
    async fn test_invalid_document_fails_in_loading() {
        let store = Arc::new(RecordingStore::new());
        let err = controller(store)
            .run(b"not json", ImportMode::Full)
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Loading);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_stage_and_partial_counts() {
        let store = Arc::new(RecordingStore::new());
        store
            .fail_writes
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let err = controller(store)
            .run(&export_doc(), ImportMode::Full)
            .await
            .unwrap_err();

        assert_eq!(err.stage, RunStage::Dispatching);
        assert!(!err.partial.errors.is_empty());
        // Nothing was flushed, so the partial report claims nothing
        assert_eq!(err.partial.raw_written, 0);
        assert_eq!(err.partial.skipped_raw, 0);
    }

    #[tokio::test]
    async fn test_failed_rollup_dispatch_keeps_watermark_for_retry() {
        let store = Arc::new(RecordingStore::new());
        store
            .fail_aggregate_writes
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let controller = controller(store.clone());

        // Raw writes land, rollup writes fail: run errors mid-dispatch.
        let err = controller
            .run(&export_doc(), ImportMode::Full)
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Dispatching);
        assert_eq!(store.raw_written(), 3);
        assert!(store.watermark.lock().unwrap().is_none());

        // An incremental retry sees no watermark, re-ingests the document,
        // and produces the rollups the failed run never wrote.
        store
            .fail_aggregate_writes
            .store(false, std::sync::atomic::Ordering::Relaxed);
        let summary = controller
            .run(&export_doc(), ImportMode::Incremental)
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 3);
        assert_eq!(summary.skipped_raw, 0);
        assert_eq!(summary.hourly_written, 2);
        assert_eq!(summary.daily_written, 1);
        assert_eq!(
            *store.watermark.lock().unwrap(),
            Some(parse_timestamp("2025-01-05 11:10:00 +0000").unwrap())
        );
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_all_writes_but_counts() {
        let watermark = parse_timestamp("2025-01-05 10:30:00 +0000").unwrap();
        let store = Arc::new(RecordingStore::with_watermark(watermark));
        let config = Config {
            dry_run: true,
            ..Config::default()
        };

        let summary = IngestController::new(store.clone(), config)
            .run(&export_doc(), ImportMode::Incremental)
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 2);
        assert_eq!(summary.skipped_raw, 1);
        assert!(summary.hourly_written > 0);
        assert_eq!(summary.workouts_written, 1);

        // No writes, no deletes
        assert!(store.ops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_granularity_toggles() {
        let store = Arc::new(RecordingStore::new());
        let config = Config {
            write_raw: false,
            write_hourly: false,
            write_daily: true,
            ..Config::default()
        };

        let summary = IngestController::new(store.clone(), config)
            .run(&export_doc(), ImportMode::Full)
            .await
            .unwrap();

        assert_eq!(summary.raw_written, 0);
        assert_eq!(summary.hourly_written, 0);
        assert_eq!(summary.daily_written, 1);
        assert!(store.raw_batches.lock().unwrap().is_empty());

        // Daily came straight from the aggregator, not the combinator
        let aggregates = store.aggregate_batches.lock().unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].0, Granularity::Daily);
        assert_eq!(aggregates[0].1[0].count, 3);
    }
}
