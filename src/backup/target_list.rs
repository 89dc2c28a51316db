// pgdrive-backup/src/backup/target_list.rs
use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{is_valid_database_name, ConnectionParams};
use crate::errors::{BackupError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces the snapshot of databases to back up for one run.
#[async_trait]
pub trait TargetLister: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<String>>;
}

pub struct PgTargetLister {
    connection: ConnectionParams,
    databases_to_backup: Option<Vec<String>>,
}

impl PgTargetLister {
    pub fn new(connection: ConnectionParams, databases_to_backup: Option<Vec<String>>) -> Self {
        Self { connection, databases_to_backup }
    }

    fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.connection.host)
            .port(self.connection.port)
            .username(&self.connection.user)
            .database("postgres");
        match &self.connection.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    async fn fetch_database_names(&self) -> Result<Vec<String>> {
        let options = self.connect_options();
        let mut conn = timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                BackupError::Connectivity(format!(
                    "Timed out after {}s connecting to {}:{}",
                    CONNECT_TIMEOUT.as_secs(),
                    self.connection.host,
                    self.connection.port
                ))
            })?
            .map_err(|e| {
                BackupError::Connectivity(format!(
                    "Failed to connect to 'postgres' database on {}:{}: {}",
                    self.connection.host, self.connection.port, e
                ))
            })?;

        let rows = sqlx::query(
            "SELECT datname FROM pg_database WHERE datistemplate = false AND datallowconn = true ORDER BY datname;",
        )
        .fetch_all(&mut conn)
        .await?;

        let db_names: Vec<String> = rows
            .iter()
            .map(|row| row.try_get("datname"))
            .collect::<std::result::Result<_, _>>()?;

        if let Err(e) = conn.close().await {
            debug!("Closing listing connection failed: {}", e);
        }
        Ok(db_names)
    }
}

#[async_trait]
impl TargetLister for PgTargetLister {
    async fn list_targets(&self) -> Result<Vec<String>> {
        let on_server = self.fetch_database_names().await?;
        debug!(databases = ?on_server, "Found databases on server");

        let targets = select_targets(on_server, self.databases_to_backup.as_deref());
        info!(count = targets.len(), "Databases to be backed up: {:?}", targets);
        Ok(targets)
    }
}

/// Restricts the server's list to the configured names, keeping the configured order.
/// Names that cannot safely become part of an artifact file name are skipped.
fn select_targets(on_server: Vec<String>, configured: Option<&[String]>) -> Vec<String> {
    let on_server: Vec<String> = on_server
        .into_iter()
        .filter(|name| {
            let valid = is_valid_database_name(name);
            if !valid {
                warn!(database = %name, "Skipping invalid database name");
            }
            valid
        })
        .collect();
    let Some(configured) = configured else {
        return on_server;
    };

    let mut selected = Vec::with_capacity(configured.len());
    for name in configured {
        if !on_server.contains(name) {
            warn!(database = %name, "Configured database not found on server, skipping");
        } else if !selected.contains(name) {
            selected.push(name.clone());
        }
    }
    selected
}
