use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// The server could not be reached or the database list could not be read.
    /// Fatal to the whole run.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Dump failed for database {target}: {reason}")]
    Dump { target: String, reason: String },

    #[error("Upload failed for database {target}: {reason}")]
    Upload { target: String, reason: String },

    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn dump(target: &str, reason: impl Into<String>) -> Self {
        BackupError::Dump { target: target.to_string(), reason: reason.into() }
    }

    pub fn upload(target: &str, reason: impl Into<String>) -> Self {
        BackupError::Upload { target: target.to_string(), reason: reason.into() }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Filesystem { path: path.into(), source }
    }
}

impl From<sqlx::Error> for BackupError {
    fn from(err: sqlx::Error) -> Self {
        BackupError::Connectivity(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
