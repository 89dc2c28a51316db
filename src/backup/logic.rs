// pgdrive-backup/src/backup/logic.rs
use chrono::Local;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backup::db_dump::DumpProducer;
use crate::backup::report::{RunReport, TargetOutcome, TargetState};
use crate::backup::s3_upload::{upload_artifact, RemoteStore};
use crate::backup::target_list::TargetLister;
use crate::config::UploadSettings;
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub upload: UploadSettings,
    pub max_parallel_targets: usize,
}

/// Lists targets once, then drives dump → upload → cleanup for each of them.
pub struct Pipeline<'a> {
    lister: &'a dyn TargetLister,
    dumper: &'a dyn DumpProducer,
    store: &'a dyn RemoteStore,
    settings: &'a PipelineSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        lister: &'a dyn TargetLister,
        dumper: &'a dyn DumpProducer,
        store: &'a dyn RemoteStore,
        settings: &'a PipelineSettings,
    ) -> Self {
        Self { lister, dumper, store, settings }
    }

    pub async fn run(&self) -> RunReport {
        let started_at = Local::now();
        info!("🚀 Starting database backup run");

        let targets = match self.lister.list_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                error!("Failed to list databases, aborting run: {}", e);
                return RunReport::aborted(started_at, e.to_string());
            }
        };

        // `buffered` yields results in listing order whatever the parallelism.
        let outcomes: Vec<TargetOutcome> = stream::iter(targets.iter())
            .map(|target| self.process_target(target))
            .buffered(self.settings.max_parallel_targets.max(1))
            .collect()
            .await;

        let report = RunReport::completed(started_at, outcomes);
        log_summary(&report);
        report
    }

    async fn process_target(&self, target: &str) -> TargetOutcome {
        info!(database = %target, "Processing [{}] database", target);
        let mut outcome = TargetOutcome::listed(target);

        advance(&mut outcome, TargetState::Dumping);
        let artifact = match self.dumper.dump(target, &self.settings.output_dir).await {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(database = %target, "Dump failed: {}", e);
                return outcome.fail(TargetState::DumpFailed, &e);
            }
        };
        if !artifact.path.is_file() {
            let e = BackupError::dump(
                target,
                format!("The database backup file {} doesn't exist", artifact.path.display()),
            );
            error!(database = %target, "{}", e);
            return outcome.fail(TargetState::DumpFailed, &e);
        }
        outcome.dumped = true;
        outcome.artifact = Some(artifact.path.clone());
        advance(&mut outcome, TargetState::Dumped);

        advance(&mut outcome, TargetState::Uploading);
        info!(
            database = %target,
            size_bytes = artifact.size_bytes,
            created_at = %artifact.created_at,
            "Uploading the backup file..."
        );
        let remote_object = match self.upload(target, &artifact.path).await {
            Ok(remote) => remote,
            Err(e) => {
                error!(database = %target, "Upload failed: {}", e);
                warn!(database = %target, "Keeping {} for a later retry", artifact.path.display());
                return outcome.fail(TargetState::UploadFailed, &e);
            }
        };
        outcome.uploaded = true;
        outcome.remote_object = Some(remote_object);
        advance(&mut outcome, TargetState::Uploaded);

        if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
            let e = BackupError::filesystem(&artifact.path, e);
            error!(database = %target, "Failed to delete uploaded backup file: {}", e);
            return outcome.fail(TargetState::CleanupFailed, &e);
        }
        outcome.cleaned = true;
        advance(&mut outcome, TargetState::Cleaned);
        info!(database = %target, "✓ Backup of {} completed", target);
        outcome
    }

    async fn upload(&self, target: &str, artifact: &std::path::Path) -> Result<String> {
        let on_progress = |percent: u8| info!(database = %target, percent, "Uploaded {}%.", percent);
        let upload = upload_artifact(self.store, target, artifact, &self.settings.upload, on_progress);

        let (session, result) = match self.settings.upload.upload_timeout {
            Some(limit) => match timeout(limit, upload).await {
                Ok(finished) => finished,
                Err(_) => {
                    return Err(BackupError::upload(
                        target,
                        format!("Upload timed out after {}s", limit.as_secs()),
                    ));
                }
            },
            None => upload.await,
        };
        debug!(
            database = %target,
            container = %session.container,
            object = %session.object_name,
            state = ?session.state,
            remote = ?session.remote_object,
            "Upload session finished"
        );
        result
    }
}

fn advance(outcome: &mut TargetOutcome, next: TargetState) {
    debug!(database = %outcome.target, from = ?outcome.state, to = ?next, "State transition");
    outcome.state = next;
}

fn log_summary(report: &RunReport) {
    let succeeded = report.outcomes.len() - report.failed_count();
    if report.is_success() {
        info!(
            targets = report.outcomes.len(),
            "🎉 Backup run completed: {} of {} databases backed up",
            succeeded,
            report.outcomes.len()
        );
    } else {
        for outcome in report.outcomes.iter().filter(|o| o.state != TargetState::Cleaned) {
            warn!(
                database = %outcome.target,
                state = ?outcome.state,
                dumped = outcome.dumped,
                uploaded = outcome.uploaded,
                "Database did not complete: {}",
                outcome.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error")
            );
        }
        error!(
            targets = report.outcomes.len(),
            failed = report.failed_count(),
            "Backup run finished with failures: {} of {} databases backed up",
            succeeded,
            report.outcomes.len()
        );
    }
}
