//! Store boundary for the ingestion pipeline
//!
//! The time-series engine itself is an external collaborator; the pipeline
//! only needs the small contract captured by [`MetricStore`]: watermark
//! read/advance, batched idempotent writes, and an open-ended range delete
//! over rollups. Every write is idempotent-by-overwrite at `(measurement,
//! tag-set, timestamp)` granularity, so re-writing a key replaces rather
//! than accumulates.
//!
//! The watermark is an explicit, commit-gated record, not a derived
//! `MAX(ts)` over raw samples: raw batches commit progressively during a
//! run, and a watermark inferred from them would advance past data whose
//! rollups were never written if the run failed mid-dispatch. The
//! controller advances it only after every enabled artifact type has been
//! written, and `advance_watermark` is monotonic (regressions are ignored).
//!
//! `SqliteMetricStore` is the bundled reference backend: point keys use the
//! sample's epoch instant (the carried offset is kept as a display column),
//! matching time-series point-key semantics where two renderings of the same
//! instant are the same point.

use crate::types::{AggregatedMetric, Granularity, MetricSample, Workout};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Write/read contract the ingestion controller depends on.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Committed ingestion watermark, optionally restricted to one metric.
    /// `None` when no run has completed yet.
    async fn watermark(
        &self,
        metric: Option<&str>,
    ) -> Result<Option<DateTime<FixedOffset>>, StoreError>;

    /// Advance the watermark to `ts`. Monotonic: a `ts` at or before the
    /// current watermark is a no-op. Called by the controller only after
    /// all enabled artifact types have been written without error.
    async fn advance_watermark(
        &self,
        metric: Option<&str>,
        ts: DateTime<FixedOffset>,
    ) -> Result<(), StoreError>;

    /// Write a batch of raw samples. Overwrites on key collision.
    async fn write_raw(&self, samples: Vec<MetricSample>) -> Result<(), StoreError>;

    /// Write a batch of rollups for one granularity. Each bucket is replaced
    /// wholesale on key collision, never merged.
    async fn write_aggregates(
        &self,
        granularity: Granularity,
        rollups: Vec<AggregatedMetric>,
    ) -> Result<(), StoreError>;

    /// Write one workout summary point plus its heart-rate detail series.
    async fn write_workout(&self, workout: &Workout) -> Result<(), StoreError>;

    /// Delete all rollup points of one granularity with
    /// `period_start >= start` (open end).
    async fn delete_aggregates_from(
        &self,
        granularity: Granularity,
        start: DateTime<FixedOffset>,
    ) -> Result<(), StoreError>;
}

/// SQLite-backed reference implementation of [`MetricStore`].
pub struct SqliteMetricStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetricStore {
    /// Open (or create) the database at `db_path` and ensure the schema
    /// exists. Schema statements are idempotent.
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, handy for tests and dry experiments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Read back all rollups of one granularity for a metric, ordered by
    /// period start.
    pub fn query_aggregates(
        &self,
        granularity: Granularity,
        metric: &str,
    ) -> Result<Vec<AggregatedMetric>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT metric, unit, period_start, sample_count, value_sum, value_avg, value_min, value_max
             FROM {} WHERE metric = ? ORDER BY ts_epoch",
            granularity.measurement()
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt.query_map([metric], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
            ))
        })?;

        let mut rollups = Vec::new();
        for row in rows {
            let (metric_name, unit, period_start, count, sum, avg, min, max) = row?;
            rollups.push(AggregatedMetric {
                metric_name,
                period_start: DateTime::parse_from_rfc3339(&period_start)?,
                unit,
                count: count as u64,
                sum,
                avg,
                min,
                max,
            });
        }
        Ok(rollups)
    }

    /// Number of raw sample points currently stored.
    pub fn raw_sample_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM health_metrics", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Number of stored workout summary points.
    pub fn workout_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM workouts", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS health_metrics (
            metric      TEXT NOT NULL,
            source      TEXT NOT NULL,
            unit        TEXT NOT NULL,
            ts_epoch    INTEGER NOT NULL,
            ts          TEXT NOT NULL,
            value       REAL NOT NULL,
            PRIMARY KEY (metric, source, unit, ts_epoch)
        );

        CREATE TABLE IF NOT EXISTS health_metrics_hourly (
            metric          TEXT NOT NULL,
            unit            TEXT NOT NULL,
            ts_epoch        INTEGER NOT NULL,
            period_start    TEXT NOT NULL,
            sample_count    INTEGER NOT NULL,
            value_sum       REAL NOT NULL,
            value_avg       REAL NOT NULL,
            value_min       REAL NOT NULL,
            value_max       REAL NOT NULL,
            PRIMARY KEY (metric, unit, ts_epoch)
        );

        CREATE TABLE IF NOT EXISTS health_metrics_daily (
            metric          TEXT NOT NULL,
            unit            TEXT NOT NULL,
            ts_epoch        INTEGER NOT NULL,
            period_start    TEXT NOT NULL,
            sample_count    INTEGER NOT NULL,
            value_sum       REAL NOT NULL,
            value_avg       REAL NOT NULL,
            value_min       REAL NOT NULL,
            value_max       REAL NOT NULL,
            PRIMARY KEY (metric, unit, ts_epoch)
        );

        CREATE TABLE IF NOT EXISTS workouts (
            workout_id      TEXT NOT NULL,
            start_epoch     INTEGER NOT NULL,
            name            TEXT NOT NULL,
            location        TEXT NOT NULL,
            start_time      TEXT NOT NULL,
            end_time        TEXT NOT NULL,
            duration_seconds REAL NOT NULL,
            distance        REAL,
            distance_unit   TEXT,
            active_energy   REAL,
            energy_unit     TEXT,
            step_count      INTEGER,
            avg_heart_rate  REAL,
            max_heart_rate  REAL,
            min_heart_rate  REAL,
            intensity       REAL,
            intensity_unit  TEXT,
            PRIMARY KEY (workout_id, start_epoch)
        );

        CREATE TABLE IF NOT EXISTS workout_heart_rate (
            workout_id      TEXT NOT NULL,
            workout_name    TEXT NOT NULL,
            ts_epoch        INTEGER NOT NULL,
            ts              TEXT NOT NULL,
            heart_rate      REAL NOT NULL,
            PRIMARY KEY (workout_id, ts_epoch)
        );

        CREATE TABLE IF NOT EXISTS ingest_watermarks (
            metric      TEXT NOT NULL PRIMARY KEY,
            ts_epoch    INTEGER NOT NULL,
            ts          TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

// The run-level (all metrics) watermark row. Per-metric rows use the
// metric name as their key, which never collides with the empty string.
const GLOBAL_WATERMARK_KEY: &str = "";

#[async_trait]
impl MetricStore for SqliteMetricStore {
    async fn watermark(
        &self,
        metric: Option<&str>,
    ) -> Result<Option<DateTime<FixedOffset>>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let raw: Option<String> = conn
            .query_row(
                "SELECT ts FROM ingest_watermarks WHERE metric = ?",
                [metric.unwrap_or(GLOBAL_WATERMARK_KEY)],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(swallow_no_rows)?;

        match raw {
            Some(ts) => Ok(Some(DateTime::parse_from_rfc3339(&ts)?)),
            None => Ok(None),
        }
    }

    async fn advance_watermark(
        &self,
        metric: Option<&str>,
        ts: DateTime<FixedOffset>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO ingest_watermarks (metric, ts_epoch, ts)
            VALUES (?, ?, ?)
            ON CONFLICT(metric) DO UPDATE SET
                ts_epoch = excluded.ts_epoch,
                ts = excluded.ts
            WHERE excluded.ts_epoch > ingest_watermarks.ts_epoch
            "#,
            rusqlite::params![
                metric.unwrap_or(GLOBAL_WATERMARK_KEY),
                ts.timestamp(),
                ts.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn write_raw(&self, samples: Vec<MetricSample>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        for sample in &samples {
            tx.execute(
                r#"
                INSERT INTO health_metrics (metric, source, unit, ts_epoch, ts, value)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(metric, source, unit, ts_epoch) DO UPDATE SET
                    ts = excluded.ts,
                    value = excluded.value
                "#,
                rusqlite::params![
                    sample.metric_name,
                    sample.source,
                    sample.unit,
                    sample.timestamp.timestamp(),
                    sample.timestamp.to_rfc3339(),
                    sample.value,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn write_aggregates(
        &self,
        granularity: Granularity,
        rollups: Vec<AggregatedMetric>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let sql = format!(
            r#"
            INSERT INTO {} (metric, unit, ts_epoch, period_start,
                            sample_count, value_sum, value_avg, value_min, value_max)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(metric, unit, ts_epoch) DO UPDATE SET
                period_start = excluded.period_start,
                sample_count = excluded.sample_count,
                value_sum = excluded.value_sum,
                value_avg = excluded.value_avg,
                value_min = excluded.value_min,
                value_max = excluded.value_max
            "#,
            granularity.measurement()
        );

        for rollup in &rollups {
            tx.execute(
                &sql,
                rusqlite::params![
                    rollup.metric_name,
                    rollup.unit,
                    rollup.period_start.timestamp(),
                    rollup.period_start.to_rfc3339(),
                    rollup.count as i64,
                    rollup.sum,
                    rollup.avg,
                    rollup.min,
                    rollup.max,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn write_workout(&self, workout: &Workout) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO workouts (
                workout_id, start_epoch, name, location, start_time, end_time,
                duration_seconds, distance, distance_unit, active_energy, energy_unit,
                step_count, avg_heart_rate, max_heart_rate, min_heart_rate,
                intensity, intensity_unit
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(workout_id, start_epoch) DO UPDATE SET
                name = excluded.name,
                location = excluded.location,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                duration_seconds = excluded.duration_seconds,
                distance = excluded.distance,
                distance_unit = excluded.distance_unit,
                active_energy = excluded.active_energy,
                energy_unit = excluded.energy_unit,
                step_count = excluded.step_count,
                avg_heart_rate = excluded.avg_heart_rate,
                max_heart_rate = excluded.max_heart_rate,
                min_heart_rate = excluded.min_heart_rate,
                intensity = excluded.intensity,
                intensity_unit = excluded.intensity_unit
            "#,
            rusqlite::params![
                workout.workout_id,
                workout.start.timestamp(),
                workout.name,
                workout.location,
                workout.start.to_rfc3339(),
                workout.end.to_rfc3339(),
                workout.duration_seconds,
                workout.total_distance,
                workout.distance_unit,
                workout.total_active_energy,
                workout.energy_unit,
                workout.total_steps,
                workout.avg_heart_rate,
                workout.max_heart_rate,
                workout.min_heart_rate,
                workout.intensity,
                workout.intensity_unit,
            ],
        )?;

        for hr in &workout.heart_rate_samples {
            tx.execute(
                r#"
                INSERT INTO workout_heart_rate (workout_id, workout_name, ts_epoch, ts, heart_rate)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(workout_id, ts_epoch) DO UPDATE SET
                    workout_name = excluded.workout_name,
                    ts = excluded.ts,
                    heart_rate = excluded.heart_rate
                "#,
                rusqlite::params![
                    workout.workout_id,
                    workout.name,
                    hr.timestamp.timestamp(),
                    hr.timestamp.to_rfc3339(),
                    hr.heart_rate,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn delete_aggregates_from(
        &self,
        granularity: Granularity,
        start: DateTime<FixedOffset>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("DELETE FROM {} WHERE ts_epoch >= ?", granularity.measurement());
        let deleted = conn.execute(&sql, [start.timestamp()])?;

        log::debug!(
            "Deleted {} {} rollup(s) with period_start >= {}",
            deleted,
            granularity.as_str(),
            start.to_rfc3339()
        );
        Ok(())
    }
}

fn swallow_no_rows<T>(err: rusqlite::Error) -> Result<Option<T>, rusqlite::Error> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}
