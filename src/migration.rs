//! Monolithic → sharded migration.
//!
//! Copies every entry of a single-file changelog database into the shard
//! set, preserving training metadata and token impacts, in batches ordered
//! by source row id. A JSON checkpoint in the shard directory records the
//! last completed batch so an interrupted run resumes where it stopped.
//!
//! Records that cannot be decoded or fail validation are skipped and listed
//! in the [`MigrationReport`]; storage failures abort the run with the
//! checkpoint intact. The run finishes with a full index rebuild.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::changelog::{validate_entry, ChangelogDb};
use crate::db::{self, ConnectMode};
use crate::models::{NewEntry, TokenImpact, TopToken, TrainingMetadata};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::shard_index::RebuildReport;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub checkpoint_path: PathBuf,
    /// Ignore an existing checkpoint and start from the first row.
    pub force_restart: bool,
}

/// Resume state persisted after every batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_batch: u64,
    pub entries_processed: u64,
    /// Highest source row id handled so far.
    pub last_source_id: i64,
    pub current_shard: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_str(&text)
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("replacing checkpoint {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRecord {
    pub source_id: i64,
    pub page_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub total_entries: u64,
    pub migrated: u64,
    /// Entries already present from an interrupted run.
    pub already_present: u64,
    pub skipped: u64,
    pub failures: Vec<SkippedRecord>,
    pub resumed_from_batch: Option<u64>,
    pub shards_created: Vec<String>,
    #[serde(skip)]
    pub rebuild: Option<RebuildReport>,
}

/// One source row decoded into the sharded model.
struct SourceRecord {
    source_id: i64,
    entry: NewEntry,
    training: TrainingMetadata,
    impact: Option<TokenImpact>,
}

pub async fn migrate_monolithic(
    source: &Path,
    db: &mut ChangelogDb,
    options: &MigrationOptions,
    progress: &dyn ProgressReporter,
) -> Result<MigrationReport> {
    if !source.exists() {
        anyhow::bail!("source database {} does not exist", source.display());
    }
    let batch_size = options.batch_size.max(1);
    let pool = db::connect(source, ConnectMode::Read).await?;
    let result = run(&pool, db, options, batch_size, progress).await;
    pool.close().await;
    result
}

async fn run(
    source: &SqlitePool,
    db: &mut ChangelogDb,
    options: &MigrationOptions,
    batch_size: usize,
    progress: &dyn ProgressReporter,
) -> Result<MigrationReport> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
        .fetch_one(source)
        .await
        .context("counting source entries")?;
    let total = total.max(0) as u64;
    let total_batches = total.div_ceil(batch_size as u64);

    let mut report = MigrationReport {
        total_entries: total,
        ..MigrationReport::default()
    };

    let mut checkpoint = match Checkpoint::load(&options.checkpoint_path)? {
        Some(c) if !options.force_restart => {
            log::info!(
                "Resuming migration from batch {} ({} entries done)",
                c.last_batch + 1,
                c.entries_processed
            );
            report.resumed_from_batch = Some(c.last_batch + 1);
            c
        }
        _ => Checkpoint::default(),
    };
    // The batch after a checkpoint may have been partly written before the
    // interruption.
    let mut check_duplicates = report.resumed_from_batch.is_some();

    log::info!(
        "Migrating {} entries in batches of {} into {}",
        total,
        batch_size,
        db.shards().dir().display()
    );

    loop {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.page_id, e.title, e.revision_id, e.timestamp, e.content_hash, e.action,
                   tm.id AS metadata_id, tm.used_in_training, tm.training_timestamp,
                   tm.model_checkpoint, tm.average_loss, tm.relative_loss
            FROM entries e
            LEFT JOIN training_metadata tm ON tm.entry_id = e.id
            WHERE e.id > ?
            ORDER BY e.id
            LIMIT ?
            "#,
        )
        .bind(checkpoint.last_source_id)
        .bind(batch_size as i64)
        .fetch_all(source)
        .await
        .context("reading source batch")?;
        if rows.is_empty() {
            break;
        }

        for row in &rows {
            let source_id: i64 = row.try_get("id")?;
            checkpoint.last_source_id = checkpoint.last_source_id.max(source_id);
            checkpoint.entries_processed += 1;

            let record = match decode(source, row).await {
                Ok(record) => record,
                Err(e) => {
                    skip(&mut report, source_id, row.try_get("page_id").ok(), e);
                    continue;
                }
            };
            if let Err(e) = validate_entry(&record.entry) {
                skip(&mut report, source_id, Some(record.entry.page_id), e);
                continue;
            }
            if check_duplicates && already_present(db, &record.entry).await? {
                report.already_present += 1;
                continue;
            }

            let before = db.shards().current_shard();
            let entry_ref = db
                .insert_entry_with(&record.entry, &record.training, record.impact.as_ref())
                .await
                .with_context(|| {
                    format!(
                        "migrating source row {}; rerun to resume after batch {}",
                        record.source_id, checkpoint.last_batch
                    )
                })?;
            report.migrated += 1;
            if before.as_deref() != Some(db.shards().shard_path(&entry_ref.shard).as_path()) {
                progress.report(ProgressEvent::ShardCreated {
                    shard: entry_ref.shard.clone(),
                });
                report.shards_created.push(entry_ref.shard.clone());
            }
            checkpoint.current_shard = Some(entry_ref.shard);
        }

        check_duplicates = false;
        checkpoint.last_batch += 1;
        checkpoint.updated_at = Some(Utc::now());
        checkpoint.save(&options.checkpoint_path)?;

        progress.report(ProgressEvent::Migrating {
            batch: checkpoint.last_batch,
            total_batches,
            entries_done: checkpoint.entries_processed,
            total_entries: total,
        });
        log::debug!(
            "Batch {}/{} done, {} entries processed",
            checkpoint.last_batch,
            total_batches,
            checkpoint.entries_processed
        );
    }

    report.rebuild = Some(db.shards_mut().rebuild_index_with_progress(progress).await?);

    if options.checkpoint_path.exists() {
        std::fs::remove_file(&options.checkpoint_path).with_context(|| {
            format!("removing checkpoint {}", options.checkpoint_path.display())
        })?;
    }

    log::info!(
        "Migration complete: {} migrated, {} skipped, {} already present",
        report.migrated,
        report.skipped,
        report.already_present
    );
    Ok(report)
}

fn skip(report: &mut MigrationReport, source_id: i64, page_id: Option<String>, e: anyhow::Error) {
    log::warn!("Skipping source row {}: {:#}", source_id, e);
    report.skipped += 1;
    report.failures.push(SkippedRecord {
        source_id,
        page_id,
        reason: format!("{:#}", e),
    });
}

async fn already_present(db: &mut ChangelogDb, entry: &NewEntry) -> Result<bool> {
    let history = db.page_history(&entry.page_id).await?.require_complete()?;
    Ok(history.entries.iter().any(|e| {
        e.revision_id == entry.revision_id
            && e.content_hash == entry.content_hash
            && e.action == entry.action
            && e.timestamp == entry.timestamp
    }))
}

async fn decode(source: &SqlitePool, row: &SqliteRow) -> Result<SourceRecord> {
    let source_id: i64 = row.try_get("id")?;
    let action: String = row.try_get("action")?;

    let entry = NewEntry {
        page_id: row.try_get("page_id")?,
        title: row.try_get("title")?,
        revision_id: row.try_get("revision_id")?,
        timestamp: timestamp_column(row, "timestamp")?.context("entry has no timestamp")?,
        content_hash: row.try_get("content_hash")?,
        action: action.parse()?,
    };

    let used: Option<i64> = row.try_get("used_in_training")?;
    let training = TrainingMetadata {
        used_in_training: used.unwrap_or(0) != 0,
        training_timestamp: timestamp_column(row, "training_timestamp")?,
        model_checkpoint: row.try_get("model_checkpoint")?,
        average_loss: row.try_get("average_loss")?,
        relative_loss: row.try_get("relative_loss")?,
    };

    let metadata_id: Option<i64> = row.try_get("metadata_id")?;
    let impact = match metadata_id {
        Some(id) => source_token_impact(source, id).await?,
        None => None,
    };

    Ok(SourceRecord {
        source_id,
        entry,
        training,
        impact,
    })
}

async fn source_token_impact(source: &SqlitePool, metadata_id: i64) -> Result<Option<TokenImpact>> {
    let Some(row) =
        sqlx::query("SELECT id, total_tokens FROM token_impacts WHERE metadata_id = ? ORDER BY id LIMIT 1")
            .bind(metadata_id)
            .fetch_optional(source)
            .await?
    else {
        return Ok(None);
    };
    let impact_id: i64 = row.try_get("id")?;

    let tokens = sqlx::query(
        "SELECT token_id, position, impact, context_start, context_end \
         FROM top_tokens WHERE token_impact_id = ? ORDER BY id",
    )
    .bind(impact_id)
    .fetch_all(source)
    .await?;

    let top_tokens = tokens
        .iter()
        .map(|t| {
            Ok(TopToken {
                token_id: t.try_get("token_id")?,
                position: t.try_get("position")?,
                impact: t.try_get("impact")?,
                context_start: t.try_get("context_start")?,
                context_end: t.try_get("context_end")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(TokenImpact {
        total_tokens: row.try_get("total_tokens")?,
        top_tokens,
    }))
}

/// Timestamps are unix milliseconds in sharded databases and ISO-8601 text
/// in older single-file ones.
fn timestamp_column(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    if let Ok(ms) = row.try_get::<Option<i64>, _>(column) {
        return ms
            .map(|ms| {
                DateTime::from_timestamp_millis(ms)
                    .with_context(|| format!("{} {} out of range", column, ms))
            })
            .transpose();
    }
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| {
        // Stored with millisecond precision.
        let ts = parse_timestamp(&t)?;
        DateTime::from_timestamp_millis(ts.timestamp_millis())
            .with_context(|| format!("{} '{}' out of range", column, t))
    })
    .transpose()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    anyhow::bail!("unrecognised timestamp '{}'", text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hash::content_hash;
    use crate::progress::NoProgress;
    use tempfile::TempDir;

    /// Create a single-file database with the older schema: text
    /// timestamps and a unique page id.
    async fn legacy_db(path: &Path, rows: &[(&str, &str, &str)]) {
        let pool = db::create(path).await.unwrap();
        for stmt in [
            "CREATE TABLE entries (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL, \
             page_id TEXT NOT NULL UNIQUE, revision_id TEXT NOT NULL, timestamp TEXT NOT NULL, \
             content_hash TEXT NOT NULL, action TEXT NOT NULL, is_revision BOOLEAN NOT NULL DEFAULT 0)",
            "CREATE TABLE training_metadata (id INTEGER PRIMARY KEY AUTOINCREMENT, entry_id INTEGER NOT NULL, \
             used_in_training BOOLEAN NOT NULL DEFAULT 0, training_timestamp TEXT, model_checkpoint TEXT, \
             average_loss REAL, relative_loss REAL)",
            "CREATE TABLE token_impacts (id INTEGER PRIMARY KEY AUTOINCREMENT, metadata_id INTEGER NOT NULL, \
             total_tokens INTEGER NOT NULL)",
            "CREATE TABLE top_tokens (id INTEGER PRIMARY KEY AUTOINCREMENT, token_impact_id INTEGER NOT NULL, \
             token_id INTEGER NOT NULL, position INTEGER NOT NULL, impact REAL NOT NULL, \
             context_start INTEGER NOT NULL, context_end INTEGER NOT NULL)",
        ] {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        for (page_id, hash, action) in rows {
            let id = sqlx::query(
                "INSERT INTO entries (title, page_id, revision_id, timestamp, content_hash, action) \
                 VALUES (?, ?, '1', '2024-01-02T03:04:05.123456', ?, ?)",
            )
            .bind(format!("Page {}", page_id))
            .bind(page_id)
            .bind(hash)
            .bind(action)
            .execute(&pool)
            .await
            .unwrap()
            .last_insert_rowid();
            let used = i64::from(page_id.starts_with('t'));
            let metadata = sqlx::query(
                "INSERT INTO training_metadata (entry_id, used_in_training, model_checkpoint) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(used)
            .bind(if used == 1 { Some("legacy-ckpt") } else { None })
            .execute(&pool)
            .await
            .unwrap()
            .last_insert_rowid();
            if used == 1 {
                let impact = sqlx::query(
                    "INSERT INTO token_impacts (metadata_id, total_tokens) VALUES (?, 100)",
                )
                .bind(metadata)
                .execute(&pool)
                .await
                .unwrap()
                .last_insert_rowid();
                sqlx::query(
                    "INSERT INTO top_tokens (token_impact_id, token_id, position, impact, context_start, context_end) \
                     VALUES (?, 5, 1, 0.5, 0, 4)",
                )
                .bind(impact)
                .execute(&pool)
                .await
                .unwrap();
            }
        }
        pool.close().await;
    }

    fn options(dir: &Path, batch_size: usize) -> MigrationOptions {
        MigrationOptions {
            batch_size,
            checkpoint_path: dir.join("migration_checkpoint.json"),
            force_restart: false,
        }
    }

    #[test]
    fn parses_legacy_timestamps() {
        let a = parse_timestamp("2024-01-02T03:04:05.123456").unwrap();
        let b = parse_timestamp("2024-01-02 03:04:05").unwrap();
        let c = parse_timestamp("2024-01-02T03:04:05Z").unwrap();
        assert_eq!(b, c);
        assert!(a > b);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn migrates_and_reports_bad_records() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("changelog.db");
        let good = content_hash("body");
        legacy_db(
            &source,
            &[
                ("p1", &good, "added"),
                ("t2", &good, "updated"),
                ("p3", "not-a-hash", "added"),
                ("p4", &good, "renamed"),
                ("p5", &good, "added"),
            ],
        )
        .await;

        let shard_dir = tmp.path().join("shards");
        let mut db = ChangelogDb::open(&Config::for_dir(&shard_dir, 90)).unwrap();
        let opts = options(&shard_dir, 2);
        let report = migrate_monolithic(&source, &mut db, &opts, &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.total_entries, 5);
        assert_eq!(report.migrated, 3);
        assert_eq!(report.skipped, 2);
        let skipped: Vec<_> = report.failures.iter().filter_map(|f| f.page_id.clone()).collect();
        assert_eq!(skipped, vec!["p3", "p4"]);
        assert!(!opts.checkpoint_path.exists());
        assert_eq!(report.rebuild.as_ref().unwrap().pages_indexed(), 3);

        let history = db.page_history("t2").await.unwrap().entries;
        assert_eq!(history.len(), 1);
        assert!(history[0].training.used_in_training);
        assert_eq!(history[0].training.model_checkpoint.as_deref(), Some("legacy-ckpt"));
        let impact = db.token_impact(&history[0].entry_ref).await.unwrap().unwrap();
        assert_eq!(impact.total_tokens, 100);
        assert_eq!(impact.top_tokens.len(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn resumes_from_checkpoint_without_duplicates() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("changelog.db");
        let good = content_hash("body");
        legacy_db(
            &source,
            &[("a", &good, "added"), ("b", &good, "added"), ("c", &good, "added")],
        )
        .await;

        let shard_dir = tmp.path().join("shards");
        let mut db = ChangelogDb::open(&Config::for_dir(&shard_dir, 90)).unwrap();
        let opts = options(&shard_dir, 2);

        // Simulate a run interrupted after the first batch, with row "b"
        // of the second batch already written.
        let full = migrate_monolithic(&source, &mut db, &opts, &NoProgress)
            .await
            .unwrap();
        assert_eq!(full.migrated, 3);
        Checkpoint {
            last_batch: 1,
            entries_processed: 1,
            last_source_id: 1,
            current_shard: None,
            updated_at: None,
        }
        .save(&opts.checkpoint_path)
        .unwrap();

        let resumed = migrate_monolithic(&source, &mut db, &opts, &NoProgress)
            .await
            .unwrap();
        assert_eq!(resumed.resumed_from_batch, Some(2));
        assert_eq!(resumed.already_present, 2);
        assert_eq!(resumed.migrated, 0);
        assert_eq!(db.page_history("b").await.unwrap().entries.len(), 1);
        db.close().await;
    }
}
