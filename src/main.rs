//! PostgreSQL backup tool
//!
//! Dumps every database on a server with pg_dump, uploads each dump to
//! S3-compatible storage and removes the local copy once the upload succeeded.
//! Meant to be started by a scheduler; the exit code tells whether every
//! database made it.

// pgdrive-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use config::BackupConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Secrets such as DB_PASSWORD usually live in .env next to the binary.
    dotenv::dotenv().ok();
    utils::logging::init();

    match run_app().await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<ExitCode> {
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("BACKUP_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let backup_config = BackupConfig::load_from_json(&config_path).with_context(|| {
        format!("Failed to load backup configuration from {}", config_path.display())
    })?;
    info!(
        host = %backup_config.connection.host,
        bucket = %backup_config.storage.bucket_name,
        "Loaded configuration from {}",
        config_path.display()
    );

    let report = backup::run_backup_flow(&backup_config)
        .await
        .context("Backup process failed")?;

    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "Run report"),
        Err(e) => error!("Failed to serialize run report: {}", e),
    }
    Ok(report.exit_code())
}
