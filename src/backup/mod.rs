pub(crate) mod db_dump; // pg_dump invocation and artifact naming
pub(crate) mod logic; // per-target pipeline and run orchestration
pub(crate) mod report;
pub(crate) mod s3_upload; // resumable chunked upload to S3-compatible storage
pub(crate) mod target_list;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::config::BackupConfig;
use db_dump::PgDumpProducer;
use logic::{Pipeline, PipelineSettings};
use report::RunReport;
use s3_upload::S3Store;
use target_list::PgTargetLister;

/// Public entry point for the backup process.
/// Builds the PostgreSQL lister, the pg_dump producer and the S3 store from
/// `backup_config` and runs the pipeline once.
pub async fn run_backup_flow(backup_config: &BackupConfig) -> Result<RunReport> {
    tokio::fs::create_dir_all(&backup_config.local_backup_path)
        .await
        .with_context(|| {
            format!(
                "Failed to create local backup directory: {}",
                backup_config.local_backup_path.display()
            )
        })?;

    let lister = PgTargetLister::new(
        backup_config.connection.clone(),
        backup_config.databases_to_backup.clone(),
    );
    let dumper = PgDumpProducer::new(backup_config.connection.clone(), backup_config.dump.clone());
    let store = S3Store::from_config(&backup_config.storage).await;
    let settings = PipelineSettings {
        output_dir: backup_config.local_backup_path.clone(),
        upload: backup_config.upload.clone(),
        max_parallel_targets: backup_config.max_parallel_targets,
    };

    let report = Pipeline::new(&lister, &dumper, &store, &settings).run().await;

    if let Some(report_path) = &backup_config.report_path {
        write_report(&report, report_path).await?;
    }
    Ok(report)
}

async fn write_report(report: &RunReport, report_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    tokio::fs::write(report_path, json)
        .await
        .with_context(|| format!("Failed to write run report to {}", report_path.display()))?;
    info!("Run report written to {}", report_path.display());
    Ok(())
}
