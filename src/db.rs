use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

/// How a shard connection will be used.
///
/// Neither mode creates files: a shard that vanished surfaces as an error
/// rather than as a fresh empty database. Only [`create`] makes new shard
/// files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectMode {
    /// Read-only; may fan out across every shard.
    Read,
    /// Read-write; inserts only ever target the current shard.
    Write,
}

fn base_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
}

fn write_options(db_path: &Path) -> SqliteConnectOptions {
    // DELETE journaling keeps committed pages in the main file, so its
    // length is the shard size the rollover check measures.
    base_options(db_path).journal_mode(SqliteJournalMode::Delete)
}

pub async fn connect(db_path: &Path, mode: ConnectMode) -> Result<SqlitePool> {
    let (options, max_connections) = match mode {
        ConnectMode::Read => (base_options(db_path).read_only(true), 4),
        ConnectMode::Write => (write_options(db_path), 1),
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("opening {} for {:?}", db_path.display(), mode))?;

    Ok(pool)
}

/// Open a shard for writing, creating the file if it does not exist.
pub async fn create(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(write_options(db_path).create_if_missing(true))
        .await
        .with_context(|| format!("creating {}", db_path.display()))?;

    Ok(pool)
}
