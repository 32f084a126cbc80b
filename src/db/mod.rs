mod environment_ops;
mod event_ops;
mod mappers;
mod run_ops;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod run_ops_behaviors;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{EngineError, Result};

pub use run_ops::Admission;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store for runs, their events and configuration environments.
#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    /// Open (creating if needed) the database at `database_url` and apply the
    /// schema. The pool is sized for `max_concurrency` workers plus readers.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the database cannot be opened.
    pub async fn new(database_url: &str, max_concurrency: u32) -> Result<Self> {
        if let Some(parent) = database_file_path(database_url).and_then(|p| p.parent().map(PathBuf::from)) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(&parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| EngineError::Config(format!("Invalid database_url {database_url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(resolve_pool_max_connections(max_concurrency))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!(database_url, "Connected to run store");
        Ok(store)
    }

    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Database(format!("Failed to initialize schema: {e}")))
    }

    const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn database_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

fn resolve_pool_max_connections(workers: u32) -> u32 {
    resolve_pool_max_connections_from(workers, |key| std::env::var(key).ok())
}

fn resolve_pool_max_connections_from<F>(workers: u32, env_lookup: F) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup("RUNENGINE_DB_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| 8_u32.max(workers.saturating_mul(2).saturating_add(2)))
}
