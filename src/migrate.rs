//! Shard schema creation and verification.
//!
//! Every shard carries the same four tables. [`run_migrations`] is
//! idempotent and runs when a shard is created; [`verify_schema`] runs the
//! first time a shard is opened and refuses shards whose layout differs.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::error::ShardError;

/// Tables and the columns each must expose.
pub const EXPECTED_SCHEMA: &[(&str, &[&str])] = &[
    (
        "entries",
        &[
            "id",
            "page_id",
            "title",
            "revision_id",
            "timestamp",
            "content_hash",
            "action",
        ],
    ),
    (
        "training_metadata",
        &[
            "id",
            "entry_id",
            "used_in_training",
            "training_timestamp",
            "model_checkpoint",
            "average_loss",
            "relative_loss",
        ],
    ),
    ("token_impacts", &["id", "metadata_id", "total_tokens"]),
    (
        "top_tokens",
        &[
            "id",
            "token_impact_id",
            "token_id",
            "position",
            "impact",
            "context_start",
            "context_end",
        ],
    ),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    // page_id repeats: one row per observed revision of a page.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id TEXT NOT NULL,
            title TEXT NOT NULL,
            revision_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('added', 'updated', 'removed'))
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS training_metadata (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL UNIQUE,
            used_in_training INTEGER NOT NULL DEFAULT 0,
            training_timestamp INTEGER,
            model_checkpoint TEXT,
            average_loss REAL,
            relative_loss REAL,
            FOREIGN KEY (entry_id) REFERENCES entries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS token_impacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            metadata_id INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            FOREIGN KEY (metadata_id) REFERENCES training_metadata(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS top_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_impact_id INTEGER NOT NULL,
            token_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            impact REAL NOT NULL,
            context_start INTEGER NOT NULL,
            context_end INTEGER NOT NULL,
            FOREIGN KEY (token_impact_id) REFERENCES token_impacts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_page_id ON entries(page_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_token_impacts_metadata_id ON token_impacts(metadata_id)",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_top_tokens_token_impact_id ON top_tokens(token_impact_id)",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Check that every expected table and column exists in the shard.
pub async fn verify_schema(pool: &SqlitePool, shard_path: &Path) -> Result<()> {
    for (table, columns) in EXPECTED_SCHEMA {
        let rows = sqlx::query("SELECT name FROM pragma_table_info(?)")
            .bind(*table)
            .fetch_all(pool)
            .await?;
        if rows.is_empty() {
            return Err(ShardError::SchemaMismatch {
                path: shard_path.to_path_buf(),
                detail: format!("missing table {}", table),
            }
            .into());
        }
        let present: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !present.iter().any(|p| p == c))
            .collect();
        if !missing.is_empty() {
            return Err(ShardError::SchemaMismatch {
                path: shard_path.to_path_buf(),
                detail: format!("table {} lacks columns {}", table, missing.join(", ")),
            }
            .into());
        }
    }
    Ok(())
}
