//! Ingestion configuration from environment variables

use std::env;

/// Configuration surface consumed by the ingestion pipeline.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite store file
    pub db_path: String,

    /// Write batch capacity for raw samples and rollups
    pub batch_size: usize,

    /// Produce raw per-sample points
    pub write_raw: bool,

    /// Produce hourly rollups
    pub write_hourly: bool,

    /// Produce daily rollups
    pub write_daily: bool,

    /// Run extraction and aggregation but suppress all store writes
    /// (and reconcile deletes); counters still report what a real run
    /// would have written
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `HEALTHFLOW_DB_PATH` (default: healthflow.db)
    /// - `HEALTHFLOW_BATCH_SIZE` (default: 5000)
    /// - `HEALTHFLOW_WRITE_RAW` (default: true)
    /// - `HEALTHFLOW_WRITE_HOURLY` (default: true)
    /// - `HEALTHFLOW_WRITE_DAILY` (default: true)
    /// - `HEALTHFLOW_DRY_RUN` (default: false)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("HEALTHFLOW_DB_PATH")
                .unwrap_or_else(|_| "healthflow.db".to_string()),

            batch_size: env::var("HEALTHFLOW_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(crate::dispatch::DEFAULT_BATCH_SIZE),

            write_raw: env_flag("HEALTHFLOW_WRITE_RAW", true),
            write_hourly: env_flag("HEALTHFLOW_WRITE_HOURLY", true),
            write_daily: env_flag("HEALTHFLOW_WRITE_DAILY", true),
            dry_run: env_flag("HEALTHFLOW_DRY_RUN", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "healthflow.db".to_string(),
            batch_size: crate::dispatch::DEFAULT_BATCH_SIZE,
            write_raw: true,
            write_hourly: true,
            write_daily: true,
            dry_run: false,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
