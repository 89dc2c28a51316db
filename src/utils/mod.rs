pub mod logging;

use anyhow::{Context, Result};
use std::path::PathBuf;
use which::which;

/// Finds the pg_dump executable in the system PATH.
pub fn find_pg_dump_executable() -> Result<PathBuf> {
    which("pg_dump").context("pg_dump executable not found in PATH. Set pg_dump_path in config.json or install the PostgreSQL client tools.")
}
