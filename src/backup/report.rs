// pgdrive-backup/src/backup/report.rs
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use crate::errors::BackupError;

/// Where a target's lifecycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetState {
    Listed,
    Dumping,
    Dumped,
    DumpFailed,
    Uploading,
    Uploaded,
    UploadFailed,
    Cleaned,
    CleanupFailed,
}

impl TargetState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TargetState::DumpFailed
                | TargetState::UploadFailed
                | TargetState::Cleaned
                | TargetState::CleanupFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    DumpError,
    UploadError,
    FilesystemError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TargetFailure {
    /// Filesystem errors are reported under the phase they happened in;
    /// only a failed cleanup surfaces as a filesystem error.
    fn for_state(state: TargetState, err: &BackupError) -> Self {
        let kind = match state {
            TargetState::UploadFailed => FailureKind::UploadError,
            TargetState::CleanupFailed => FailureKind::FilesystemError,
            _ => FailureKind::DumpError,
        };
        TargetFailure { kind, message: err.to_string() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    pub state: TargetState,
    pub dumped: bool,
    pub uploaded: bool,
    pub cleaned: bool,
    pub artifact: Option<PathBuf>,
    pub remote_object: Option<String>,
    pub error: Option<TargetFailure>,
}

impl TargetOutcome {
    pub fn listed(target: &str) -> Self {
        TargetOutcome {
            target: target.to_string(),
            state: TargetState::Listed,
            dumped: false,
            uploaded: false,
            cleaned: false,
            artifact: None,
            remote_object: None,
            error: None,
        }
    }

    pub fn fail(mut self, state: TargetState, err: &BackupError) -> Self {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.error = Some(TargetFailure::for_state(state, err));
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    /// Set when the run stopped before any target was processed.
    pub aborted: Option<String>,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunReport {
    pub fn aborted(started_at: DateTime<Local>, reason: String) -> Self {
        RunReport {
            started_at,
            finished_at: Local::now(),
            aborted: Some(reason),
            outcomes: Vec::new(),
        }
    }

    pub fn completed(started_at: DateTime<Local>, outcomes: Vec<TargetOutcome>) -> Self {
        RunReport {
            started_at,
            finished_at: Local::now(),
            aborted: None,
            outcomes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.outcomes.iter().all(|o| o.state == TargetState::Cleaned)
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state != TargetState::Cleaned).count()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}
