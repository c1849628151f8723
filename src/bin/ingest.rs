//! Ingest - health export import runner
//!
//! Reads one JSON export document and runs it through the ingestion
//! pipeline into the SQLite store.
//!
//! Usage:
//!   cargo run --release --bin ingest -- <export.json> [flags]
//!
//! Flags:
//!   --full               Ingest every record (default)
//!   --incremental        Only records after the stored watermark
//!   --since <timestamp>  Only records after the given timestamp
//!                        ("YYYY-MM-DD HH:MM:SS +ZZZZ")
//!   --dry-run            Parse and aggregate, write nothing
//!   --no-raw             Skip raw per-sample points
//!   --no-hourly          Skip hourly rollups
//!   --no-daily           Skip daily rollups
//!
//! Environment variables:
//!   HEALTHFLOW_DB_PATH    - SQLite database path (default: healthflow.db)
//!   HEALTHFLOW_BATCH_SIZE - Write batch capacity (default: 5000)

use dotenv::dotenv;
use healthflow::extract::parse_timestamp;
use healthflow::ingest::{ImportMode, IngestController};
use healthflow::store::SqliteMetricStore;
use healthflow::Config;
use log::{error, info};
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    env_logger::init();

    let mut config = Config::from_env();
    let mut mode = ImportMode::Full;
    let mut input: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--full" => mode = ImportMode::Full,
            "--incremental" => mode = ImportMode::Incremental,
            "--since" => {
                let raw = args
                    .next()
                    .ok_or("--since requires a timestamp argument")?;
                let ts = parse_timestamp(&raw)
                    .ok_or_else(|| format!("unparsable --since timestamp: {}", raw))?;
                mode = ImportMode::Since(ts);
            }
            "--dry-run" => config.dry_run = true,
            "--no-raw" => config.write_raw = false,
            "--no-hourly" => config.write_hourly = false,
            "--no-daily" => config.write_daily = false,
            other if input.is_none() && !other.starts_with("--") => {
                input = Some(other.to_string());
            }
            other => return Err(format!("unrecognized argument: {}", other).into()),
        }
    }

    let input = input.ok_or("usage: ingest <export.json> [flags]")?;

    info!("🚀 Healthflow Ingest");
    info!("   ├─ Input: {}", input);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Batch size: {}", config.batch_size);
    info!(
        "   └─ Artifacts: raw={} hourly={} daily={}",
        config.write_raw, config.write_hourly, config.write_daily
    );

    let document = std::fs::read(&input)?;
    let store = Arc::new(SqliteMetricStore::open(&config.db_path)?);
    let controller = IngestController::new(store, config);

    match controller.run(&document, mode).await {
        Ok(summary) => {
            if !summary.errors.is_empty() {
                for e in &summary.errors {
                    error!("⚠️  {}", e);
                }
            }
            Ok(())
        }
        Err(e) => {
            error!("❌ {}", e);
            error!(
                "   └─ Partial progress: {} raw, {} hourly, {} daily, {} workout(s)",
                e.partial.raw_written,
                e.partial.hourly_written,
                e.partial.daily_written,
                e.partial.workouts_written
            );
            Err(e.into())
        }
    }
}
