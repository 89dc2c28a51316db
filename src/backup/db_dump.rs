// pgdrive-backup/src/backup/db_dump.rs
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{is_valid_database_name, ConnectionParams, DumpSettings};
use crate::errors::{BackupError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A finished dump sitting in the local backup directory.
#[derive(Debug, Clone)]
pub struct DumpArtifact {
    pub path: PathBuf,
    pub target: String,
    pub created_at: DateTime<Local>,
    pub size_bytes: u64,
}

#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump(&self, target: &str, output_dir: &Path) -> Result<DumpArtifact>;
}

/// `{dir}/{target}_{YYYYmmdd_HHMMSS}_backup.{ext}`
pub fn artifact_path(output_dir: &Path, target: &str, created_at: &DateTime<Local>, ext: &str) -> PathBuf {
    output_dir.join(format!(
        "{}_{}_backup.{}",
        target,
        created_at.format(TIMESTAMP_FORMAT),
        ext
    ))
}

/// Copy of the password handed to one `pg_dump` invocation. Only this copy is
/// overwritten on drop; `ConnectionParams` keeps its own for the whole run.
struct InvocationSecret(String);

impl InvocationSecret {
    fn new(value: &str) -> Self {
        InvocationSecret(value.to_string())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for InvocationSecret {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.iter_mut().for_each(|b| *b = 0);
        std::hint::black_box(&bytes);
    }
}

pub struct PgDumpProducer {
    connection: ConnectionParams,
    settings: DumpSettings,
}

impl PgDumpProducer {
    pub fn new(connection: ConnectionParams, settings: DumpSettings) -> Self {
        Self { connection, settings }
    }

    fn build_command(&self, target: &str, output_path: &Path) -> Command {
        let mut command = Command::new(&self.settings.pg_dump_path);
        command
            .arg("-F")
            .arg(self.settings.format.flag())
            .arg("-Z")
            .arg(self.settings.compression_level.to_string())
            .arg("--no-password")
            .arg(format!("--host={}", self.connection.host))
            .arg(format!("--port={}", self.connection.port))
            .arg(format!("--username={}", self.connection.user))
            .arg(format!("--dbname={}", target))
            .arg(format!("--file={}", output_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run_pg_dump(&self, target: &str, output_path: &Path) -> Result<()> {
        let mut command = self.build_command(target, output_path);

        // PGPASSWORD is set on this child only, never on our own environment.
        let secret = self.connection.password.as_deref().map(InvocationSecret::new);
        if let Some(secret) = &secret {
            command.env("PGPASSWORD", secret.expose());
        }

        debug!(database = %target, "Running {}", self.settings.pg_dump_path.display());
        let output = match self.settings.timeout {
            Some(limit) => timeout(limit, command.output()).await.map_err(|_| {
                BackupError::dump(target, format!("pg_dump timed out after {}s", limit.as_secs()))
            })?,
            None => command.output().await,
        }
        .map_err(|e| {
            BackupError::dump(
                target,
                format!("Failed to execute {}: {}", self.settings.pg_dump_path.display(), e),
            )
        })?;

        if !output.status.success() {
            return Err(BackupError::dump(
                target,
                format!(
                    "pg_dump exited with status: {}\nStderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DumpProducer for PgDumpProducer {
    async fn dump(&self, target: &str, output_dir: &Path) -> Result<DumpArtifact> {
        if !is_valid_database_name(target) {
            return Err(BackupError::dump(target, "Refusing to dump a database with an unsafe name"));
        }
        let created_at = Local::now();
        let output_path = artifact_path(output_dir, target, &created_at, self.settings.format.extension());
        info!(database = %target, "Dumping to {}", output_path.display());

        if let Err(e) = self.run_pg_dump(target, &output_path).await {
            discard_partial(&output_path).await;
            return Err(e);
        }

        // Existence is only meaningful once the child has exited.
        let metadata = match tokio::fs::metadata(&output_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                return Err(BackupError::dump(
                    target,
                    format!("{} is not a regular file", output_path.display()),
                ));
            }
            Err(e) => {
                return Err(BackupError::dump(
                    target,
                    format!("Expected dump file {} is missing: {}", output_path.display(), e),
                ));
            }
        };

        info!(database = %target, size_bytes = metadata.len(), "✓ Dump finished");
        Ok(DumpArtifact {
            path: output_path,
            target: target.to_string(),
            created_at,
            size_bytes: metadata.len(),
        })
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!("Removed partial dump file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove partial dump file {}: {}", path.display(), e),
    }
}
