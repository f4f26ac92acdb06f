//! The changelog facade.
//!
//! [`ChangelogDb`] exposes one logical changelog. Each call is translated
//! into per-shard work through the [`ShardManager`]: inserts go to the
//! current shard under the directory write lock, reads fan out to the
//! shards the index names (or all of them), and training-metadata updates
//! are applied shard by shard as independent, idempotent commits.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db::ConnectMode;
use crate::fanout::{aborts_fanout, scatter_gather, ShardFailure};
use crate::hash::{content_hash, is_content_hash};
use crate::models::{
    Action, Entry, EntryRef, NewEntry, PageFetch, TokenImpact, TopToken, TrainingMetadata,
};
use crate::shard_manager::ShardManager;

/// Page ids bound per UPDATE, well under SQLite's host parameter limit.
const MARK_CHUNK: usize = 500;

const ENTRY_COLUMNS: &str = r#"
    e.id, e.page_id, e.title, e.revision_id, e.timestamp, e.content_hash, e.action,
    COALESCE(tm.used_in_training, 0) AS used_in_training,
    tm.training_timestamp, tm.model_checkpoint, tm.average_loss, tm.relative_loss
"#;

/// Entries read from one or more shards, merged and sorted by timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub entries: Vec<Entry>,
    /// Shards that could not be read. When non-empty the entries may be
    /// incomplete.
    pub failures: Vec<ShardFailure>,
}

impl History {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn latest(&self) -> Option<&Entry> {
        self.entries.last()
    }

    /// Fail with the first unreachable shard if the history is incomplete.
    pub fn require_complete(self) -> Result<Self> {
        match self.failures.first() {
            Some(failure) => Err(failure.to_error().into()),
            None => Ok(self),
        }
    }
}

/// What [`ChangelogDb::log_page`] did with a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutcome {
    Added(EntryRef),
    Updated(EntryRef),
    /// Same revision and content as the latest entry; nothing written.
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct MarkOptions {
    pub average_loss: Option<f64>,
    pub relative_loss: Option<f64>,
    /// Skip shards up to and including this one; pass the `last_completed`
    /// cursor of an interrupted run.
    pub resume_after: Option<String>,
}

/// Outcome of marking pages as used in training.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MarkReport {
    /// Shards whose update committed, in the order applied.
    pub shards_completed: Vec<String>,
    /// Cursor: the last shard whose update committed.
    pub last_completed: Option<String>,
    pub rows_updated: u64,
    pub failures: Vec<ShardFailure>,
}

impl MarkReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A page ranked by the token-impact data recorded for its entries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageImpact {
    pub page_id: String,
    /// Title of the page's newest entry.
    pub title: String,
    /// Token-impact records across every entry of the page.
    pub impact_records: i64,
    pub total_tokens: i64,
    /// Highest relative loss recorded for any entry of the page.
    pub relative_loss: Option<f64>,
    /// Shards holding the page's impact data, oldest first.
    pub shards: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopPages {
    pub pages: Vec<PageImpact>,
    pub failures: Vec<ShardFailure>,
}

/// One page's impact totals within a single shard.
struct ShardImpact {
    page_id: String,
    title: String,
    records: i64,
    tokens: i64,
    relative_loss: Option<f64>,
    last_ts: i64,
}

pub struct ChangelogDb {
    shards: ShardManager,
}

impl ChangelogDb {
    pub fn new(shards: ShardManager) -> Self {
        Self { shards }
    }

    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(ShardManager::open(&config.shards)?))
    }

    pub fn shards(&self) -> &ShardManager {
        &self.shards
    }

    pub fn shards_mut(&mut self) -> &mut ShardManager {
        &mut self.shards
    }

    pub async fn close(mut self) {
        self.shards.close().await;
    }

    /// Append an entry to the current shard, rolling over first if the
    /// shard is full.
    pub async fn insert_entry(&mut self, entry: &NewEntry) -> Result<EntryRef> {
        self.insert_entry_with(entry, &TrainingMetadata::default(), None)
            .await
    }

    /// Append an entry carrying existing training metadata and optional
    /// token impact, as migration does.
    pub async fn insert_entry_with(
        &mut self,
        entry: &NewEntry,
        training: &TrainingMetadata,
        impact: Option<&TokenImpact>,
    ) -> Result<EntryRef> {
        validate_entry(entry)?;

        let lock = self.shards.lock().await?;
        let shard = self.shards.shard_for_writing_locked(&lock).await?;
        // Index first: a reader may see the page listed before its row
        // lands, never the reverse.
        self.shards
            .record_pages_locked(&lock, [entry.page_id.as_str()], &shard)?;

        let pool = self.shards.pool(&shard, ConnectMode::Write).await?;
        let id = insert_row(&pool, entry, training, impact)
            .await
            .with_context(|| {
                format!(
                    "insert_entry for page {} into shard {}",
                    entry.page_id, shard
                )
            })?;
        self.shards.note_overage(&shard);
        drop(lock);

        log::debug!("Logged {} of page {} in {}", entry.action, entry.page_id, shard);
        Ok(EntryRef { shard, id })
    }

    /// Every entry of `page_id`, oldest first, across all shards holding it.
    pub async fn page_history(&mut self, page_id: &str) -> Result<History> {
        let shards = self.shards.shards_for_reading(page_id)?;
        let page = page_id.to_string();
        let gathered = scatter_gather(&mut self.shards, &shards, "page_history", |shard, pool| {
            select_page_entries(shard, pool, page.clone())
        })
        .await
        .with_context(|| format!("reading history of page {}", page_id))?;

        let failures = gathered.failures.clone();
        let entries = gathered.merge_by(|e: &Entry| e.timestamp);
        Ok(History { entries, failures })
    }

    /// Latest entry for `page_id`. Errors if any shard that may hold the
    /// page is unreachable.
    pub async fn latest_entry(&mut self, page_id: &str) -> Result<Option<Entry>> {
        let history = self.page_history(page_id).await?.require_complete()?;
        Ok(history.entries.into_iter().last())
    }

    /// True if the page has no history or its latest revision differs.
    pub async fn check_needs_update(&mut self, page_id: &str, revision_id: &str) -> Result<bool> {
        Ok(match self.latest_entry(page_id).await? {
            Some(latest) => latest.revision_id != revision_id,
            None => true,
        })
    }

    /// Current state of a page: the action of its latest entry.
    pub async fn page_state(&mut self, page_id: &str) -> Result<Option<Action>> {
        Ok(self.latest_entry(page_id).await?.map(|e| e.action))
    }

    /// Record a fetched page: `added` for a new (or previously removed)
    /// page, `updated` when its revision or content changed.
    pub async fn log_page(&mut self, page: &PageFetch) -> Result<LogOutcome> {
        let hash = content_hash(&page.content);
        let latest = self.latest_entry(&page.page_id).await?;

        let action = match &latest {
            None => Action::Added,
            Some(e) if e.action == Action::Removed => Action::Added,
            Some(e) if e.revision_id == page.revision_id && e.content_hash == hash => {
                return Ok(LogOutcome::Unchanged)
            }
            Some(_) => Action::Updated,
        };

        let entry = NewEntry {
            page_id: page.page_id.clone(),
            title: page.title.clone(),
            revision_id: page.revision_id.clone(),
            timestamp: next_timestamp(latest.as_ref()),
            content_hash: hash,
            action,
        };
        let entry_ref = self.insert_entry(&entry).await?;
        Ok(match action {
            Action::Added => LogOutcome::Added(entry_ref),
            _ => LogOutcome::Updated(entry_ref),
        })
    }

    /// Append a `removed` entry. Returns `None` if the page is unknown or
    /// already removed.
    pub async fn remove_page(&mut self, page_id: &str) -> Result<Option<EntryRef>> {
        let latest = match self.latest_entry(page_id).await? {
            Some(e) if e.action != Action::Removed => e,
            _ => return Ok(None),
        };
        let entry = NewEntry {
            page_id: latest.page_id.clone(),
            title: latest.title.clone(),
            revision_id: latest.revision_id.clone(),
            timestamp: next_timestamp(Some(&latest)),
            content_hash: latest.content_hash.clone(),
            action: Action::Removed,
        };
        Ok(Some(self.insert_entry(&entry).await?))
    }

    pub async fn mark_used_in_training(
        &mut self,
        page_ids: &[String],
        model_checkpoint: &str,
    ) -> Result<MarkReport> {
        self.mark_used_in_training_with(page_ids, model_checkpoint, &MarkOptions::default())
            .await
    }

    /// Flag every row of the given pages as used by `model_checkpoint`.
    ///
    /// Each shard is one transaction; there is no cross-shard atomicity. A
    /// row already marked for the same checkpoint is left untouched, so a
    /// retry after a partial failure converges on the same state.
    pub async fn mark_used_in_training_with(
        &mut self,
        page_ids: &[String],
        model_checkpoint: &str,
        options: &MarkOptions,
    ) -> Result<MarkReport> {
        let lock = self.shards.lock().await?;
        self.shards.refresh()?;

        // Group pages by shard, keeping shard creation order. Indexed shards
        // missing from disk sort last and are reported as failures.
        let mut by_shard: BTreeMap<(usize, String), Vec<String>> = BTreeMap::new();
        let order = self.shards.shard_names();
        for page_id in page_ids {
            for path in self.shards.route_read(page_id) {
                let shard = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let pos = order
                    .iter()
                    .position(|s| *s == shard)
                    .unwrap_or(order.len());
                by_shard.entry((pos, shard)).or_default().push(page_id.clone());
            }
        }

        let resume_pos = match &options.resume_after {
            Some(cursor) => Some(
                order
                    .iter()
                    .position(|s| s == cursor)
                    .with_context(|| format!("resume cursor {} is not a known shard", cursor))?,
            ),
            None => None,
        };

        let now = Utc::now().timestamp_millis();
        let mut report = MarkReport::default();

        for ((pos, shard), pages) in by_shard {
            if resume_pos.is_some_and(|r| pos <= r) {
                continue;
            }
            let path = self.shards.shard_path(&shard);
            let result = if self.shards.is_blank_shard(&shard) {
                Ok(0)
            } else {
                match self.shards.pool(&shard, ConnectMode::Write).await {
                    Ok(pool) => mark_rows(&pool, &pages, model_checkpoint, now, options).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(updated) => {
                    report.rows_updated += updated;
                    report.shards_completed.push(shard.clone());
                    report.last_completed = Some(shard);
                }
                Err(e) => {
                    if aborts_fanout(&e) {
                        return Err(e.context(format!(
                            "mark_used_in_training aborted; last completed shard: {}",
                            report.last_completed.as_deref().unwrap_or("none")
                        )));
                    }
                    log::warn!("mark_used_in_training skipped {}: {:#}", path.display(), e);
                    report.failures.push(ShardFailure {
                        shard: path,
                        operation: "mark_used_in_training",
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        drop(lock);

        log::info!(
            "Marked {} rows as used by {} across {} shards",
            report.rows_updated,
            model_checkpoint,
            report.shards_completed.len()
        );
        Ok(report)
    }

    /// Entries not yet used in training, oldest first, across every shard.
    pub async fn unused_entries(&mut self, limit: usize) -> Result<History> {
        self.shards.refresh()?;
        let shards = self.shards.all_shards();
        let sql_limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let gathered = scatter_gather(&mut self.shards, &shards, "unused_entries", |shard, pool| {
            select_unused_entries(shard, pool, sql_limit)
        })
        .await?;

        let failures = gathered.failures.clone();
        let mut entries = gathered.merge_by(|e: &Entry| e.timestamp);
        entries.truncate(limit);
        Ok(History { entries, failures })
    }

    /// Attach token-impact statistics to a stored entry. Written into the
    /// shard that owns the entry.
    pub async fn record_token_impact(
        &mut self,
        entry: &EntryRef,
        impact: &TokenImpact,
    ) -> Result<()> {
        let lock = self.shards.lock().await?;
        let pool = self.shards.pool(&entry.shard, ConnectMode::Write).await?;
        let mut tx = pool.begin().await?;
        let metadata_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM training_metadata WHERE entry_id = ?")
                .bind(entry.id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(metadata_id) = metadata_id else {
            bail!("entry {} not found in shard {}", entry.id, entry.shard);
        };
        insert_token_impact(&mut tx, metadata_id, impact).await?;
        tx.commit().await?;
        drop(lock);
        Ok(())
    }

    /// Token-impact statistics of a stored entry, if any were recorded.
    pub async fn token_impact(&mut self, entry: &EntryRef) -> Result<Option<TokenImpact>> {
        let pool = self.shards.pool(&entry.shard, ConnectMode::Read).await?;
        read_token_impact(&pool, entry.id).await
    }

    /// The `n` pages with the most token-impact records across every shard.
    /// Ties go to the higher relative loss, then the lower page id. Pages
    /// without impact data are not ranked.
    pub async fn top_pages_by_impact(&mut self, n: usize) -> Result<TopPages> {
        self.shards.refresh()?;
        let shards = self.shards.all_shards();
        let gathered = scatter_gather(&mut self.shards, &shards, "top_pages_by_impact", |_, pool| {
            select_page_impacts(pool)
        })
        .await?;

        let mut by_page: BTreeMap<String, (PageImpact, i64)> = BTreeMap::new();
        for part in gathered.parts {
            for row in part.rows {
                let (page, last_ts) = by_page.entry(row.page_id.clone()).or_insert_with(|| {
                    (
                        PageImpact {
                            page_id: row.page_id.clone(),
                            title: row.title.clone(),
                            impact_records: 0,
                            total_tokens: 0,
                            relative_loss: None,
                            shards: Vec::new(),
                        },
                        row.last_ts,
                    )
                });
                if row.last_ts >= *last_ts {
                    page.title = row.title;
                    *last_ts = row.last_ts;
                }
                page.impact_records += row.records;
                page.total_tokens += row.tokens;
                page.relative_loss = match (page.relative_loss, row.relative_loss) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                page.shards.push(part.shard.clone());
            }
        }

        let mut pages: Vec<PageImpact> = by_page.into_values().map(|(page, _)| page).collect();
        pages.sort_by(|a, b| {
            b.impact_records
                .cmp(&a.impact_records)
                .then_with(|| {
                    b.relative_loss
                        .partial_cmp(&a.relative_loss)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.page_id.cmp(&b.page_id))
        });
        pages.truncate(n);
        Ok(TopPages {
            pages,
            failures: gathered.failures,
        })
    }

    /// Mark the `n` highest-impact pages as used by `model_checkpoint`.
    /// Refuses to mark anything when a shard could not be ranked.
    pub async fn mark_top_pages(
        &mut self,
        n: usize,
        model_checkpoint: &str,
        options: &MarkOptions,
    ) -> Result<(Vec<PageImpact>, MarkReport)> {
        let top = self.top_pages_by_impact(n).await?;
        if let Some(failure) = top.failures.first() {
            return Err(failure.to_error()).context("ranking pages by token impact");
        }
        if top.pages.is_empty() {
            log::info!("No pages carry token-impact data; nothing to mark");
            return Ok((top.pages, MarkReport::default()));
        }

        let page_ids: Vec<String> = top.pages.iter().map(|p| p.page_id.clone()).collect();
        let report = self
            .mark_used_in_training_with(&page_ids, model_checkpoint, options)
            .await?;
        Ok((top.pages, report))
    }
}

pub(crate) fn validate_entry(entry: &NewEntry) -> Result<()> {
    if entry.page_id.trim().is_empty() {
        bail!("entry has an empty page id");
    }
    if !is_content_hash(&entry.content_hash) {
        bail!(
            "entry for page {} has malformed content hash '{}'",
            entry.page_id,
            entry.content_hash
        );
    }
    Ok(())
}

/// Now, nudged past the previous entry so history order matches log order
/// even within one millisecond.
fn next_timestamp(previous: Option<&Entry>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev.timestamp >= now => prev.timestamp + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

async fn insert_row(
    pool: &SqlitePool,
    entry: &NewEntry,
    training: &TrainingMetadata,
    impact: Option<&TokenImpact>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let id = sqlx::query(
        r#"
        INSERT INTO entries (page_id, title, revision_id, timestamp, content_hash, action)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.page_id)
    .bind(&entry.title)
    .bind(&entry.revision_id)
    .bind(entry.timestamp.timestamp_millis())
    .bind(&entry.content_hash)
    .bind(entry.action.as_str())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let metadata_id = sqlx::query(
        r#"
        INSERT INTO training_metadata
            (entry_id, used_in_training, training_timestamp, model_checkpoint, average_loss, relative_loss)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(training.used_in_training)
    .bind(training.training_timestamp.map(|t| t.timestamp_millis()))
    .bind(&training.model_checkpoint)
    .bind(training.average_loss)
    .bind(training.relative_loss)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    if let Some(impact) = impact {
        insert_token_impact(&mut tx, metadata_id, impact).await?;
    }

    tx.commit().await?;
    Ok(id)
}

async fn insert_token_impact(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    metadata_id: i64,
    impact: &TokenImpact,
) -> Result<()> {
    let impact_id = sqlx::query("INSERT INTO token_impacts (metadata_id, total_tokens) VALUES (?, ?)")
        .bind(metadata_id)
        .bind(impact.total_tokens)
        .execute(&mut **tx)
        .await?
        .last_insert_rowid();

    for token in &impact.top_tokens {
        sqlx::query(
            r#"
            INSERT INTO top_tokens (token_impact_id, token_id, position, impact, context_start, context_end)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(impact_id)
        .bind(token.token_id)
        .bind(token.position)
        .bind(token.impact)
        .bind(token.context_start)
        .bind(token.context_end)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub(crate) async fn read_token_impact(pool: &SqlitePool, entry_id: i64) -> Result<Option<TokenImpact>> {
    let row = sqlx::query(
        r#"
        SELECT ti.id, ti.total_tokens
        FROM token_impacts ti
        JOIN training_metadata tm ON tm.id = ti.metadata_id
        WHERE tm.entry_id = ?
        ORDER BY ti.id DESC
        LIMIT 1
        "#,
    )
    .bind(entry_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let impact_id: i64 = row.get("id");

    let tokens = sqlx::query(
        r#"
        SELECT token_id, position, impact, context_start, context_end
        FROM top_tokens WHERE token_impact_id = ? ORDER BY id
        "#,
    )
    .bind(impact_id)
    .fetch_all(pool)
    .await?;

    Ok(Some(TokenImpact {
        total_tokens: row.get("total_tokens"),
        top_tokens: tokens
            .iter()
            .map(|t| TopToken {
                token_id: t.get("token_id"),
                position: t.get("position"),
                impact: t.get("impact"),
                context_start: t.get("context_start"),
                context_end: t.get("context_end"),
            })
            .collect(),
    }))
}

async fn mark_rows(
    pool: &SqlitePool,
    page_ids: &[String],
    model_checkpoint: &str,
    now_ms: i64,
    options: &MarkOptions,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let mut updated = 0;
    for chunk in page_ids.chunks(MARK_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE training_metadata
            SET used_in_training = 1,
                training_timestamp = ?,
                model_checkpoint = ?,
                average_loss = COALESCE(?, average_loss),
                relative_loss = COALESCE(?, relative_loss)
            WHERE entry_id IN (SELECT id FROM entries WHERE page_id IN ({}))
              AND NOT (used_in_training = 1 AND model_checkpoint IS ?)
            "#,
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(now_ms)
            .bind(model_checkpoint)
            .bind(options.average_loss)
            .bind(options.relative_loss);
        for page_id in chunk {
            query = query.bind(page_id);
        }
        updated += query
            .bind(model_checkpoint)
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(updated)
}

async fn select_page_entries(shard: String, pool: SqlitePool, page_id: String) -> Result<Vec<Entry>> {
    let sql = format!(
        "SELECT {} FROM entries e LEFT JOIN training_metadata tm ON tm.entry_id = e.id \
         WHERE e.page_id = ? ORDER BY e.id",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(&page_id).fetch_all(&pool).await?;
    rows.iter().map(|r| entry_from_row(&shard, r)).collect()
}

async fn select_unused_entries(shard: String, pool: SqlitePool, limit: i64) -> Result<Vec<Entry>> {
    let sql = format!(
        "SELECT {} FROM entries e LEFT JOIN training_metadata tm ON tm.entry_id = e.id \
         WHERE COALESCE(tm.used_in_training, 0) = 0 \
         ORDER BY e.timestamp, e.id LIMIT ?",
        ENTRY_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(&pool).await?;
    rows.iter().map(|r| entry_from_row(&shard, r)).collect()
}

async fn select_page_impacts(pool: SqlitePool) -> Result<Vec<ShardImpact>> {
    let rows = sqlx::query(
        r#"
        SELECT e.page_id,
               COUNT(ti.id) AS records,
               COALESCE(SUM(ti.total_tokens), 0) AS tokens,
               MAX(tm.relative_loss) AS relative_loss,
               MAX(e.timestamp) AS last_ts,
               (SELECT e2.title FROM entries e2 WHERE e2.page_id = e.page_id
                ORDER BY e2.timestamp DESC, e2.id DESC LIMIT 1) AS title
        FROM entries e
        JOIN training_metadata tm ON tm.entry_id = e.id
        JOIN token_impacts ti ON ti.metadata_id = tm.id
        GROUP BY e.page_id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(ShardImpact {
                page_id: r.try_get("page_id")?,
                title: r.try_get("title")?,
                records: r.try_get("records")?,
                tokens: r.try_get("tokens")?,
                relative_loss: r.try_get("relative_loss")?,
                last_ts: r.try_get("last_ts")?,
            })
        })
        .collect()
}

pub(crate) fn entry_from_row(shard: &str, row: &SqliteRow) -> Result<Entry> {
    let ts: i64 = row.try_get("timestamp")?;
    let training_ts: Option<i64> = row.try_get("training_timestamp")?;
    let action: String = row.try_get("action")?;
    let used: i64 = row.try_get("used_in_training")?;

    Ok(Entry {
        entry_ref: EntryRef {
            shard: shard.to_string(),
            id: row.try_get("id")?,
        },
        page_id: row.try_get("page_id")?,
        title: row.try_get("title")?,
        revision_id: row.try_get("revision_id")?,
        timestamp: millis_to_utc(ts)?,
        content_hash: row.try_get("content_hash")?,
        action: action.parse()?,
        training: TrainingMetadata {
            used_in_training: used != 0,
            training_timestamp: training_ts.map(millis_to_utc).transpose()?,
            model_checkpoint: row.try_get("model_checkpoint")?,
            average_loss: row.try_get("average_loss")?,
            relative_loss: row.try_get("relative_loss")?,
        },
    })
}

fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).with_context(|| format!("timestamp {} out of range", ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn open(dir: &std::path::Path, limit_mb: u64) -> ChangelogDb {
        ChangelogDb::open(&Config::for_dir(dir, limit_mb)).unwrap()
    }

    fn entry(page_id: &str, revision: &str, action: Action, minute: u32) -> NewEntry {
        NewEntry {
            page_id: page_id.to_string(),
            title: format!("Page {}", page_id),
            revision_id: revision.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
            content_hash: content_hash(revision),
            action,
        }
    }

    fn page(page_id: &str, revision: &str, content: &str) -> PageFetch {
        PageFetch {
            title: format!("Page {}", page_id),
            page_id: page_id.to_string(),
            revision_id: revision.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn rollover_at_size_limit() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 1).await;
        let limit = db.shards().limit_bytes();

        let mut before = Vec::new();
        let mut n = 0;
        // Large titles fill a 1MB shard in a few hundred rows.
        while db.shards().all_shards().len() < 2 {
            let mut e = entry(&format!("p{}", n), "1", Action::Added, 0);
            e.title = "x".repeat(8 * 1024);
            let r = db.insert_entry(&e).await.unwrap();
            before.push((e.page_id, r.shard));
            n += 1;
            assert!(n < 10_000, "no rollover");
        }

        let shards = db.shards().all_shards();
        let first = shards[0].clone();
        let second_name = shards[1].file_name().unwrap().to_str().unwrap().to_string();
        let frozen = std::fs::metadata(&first).unwrap().len();
        assert!(frozen >= limit);

        // The row that triggered the rollover landed in the new shard.
        let (last_page, last_shard) = before.pop().unwrap();
        assert_eq!(last_shard, second_name);

        for i in 0..5 {
            let e = entry(&format!("after{}", i), "1", Action::Added, 1);
            let r = db.insert_entry(&e).await.unwrap();
            assert_eq!(r.shard, second_name);
        }
        assert_eq!(std::fs::metadata(&first).unwrap().len(), frozen);

        let first_name = first.file_name().unwrap().to_str().unwrap().to_string();
        let index = db.shards().index();
        for (page_id, shard) in &before {
            assert_eq!(shard, &first_name);
            assert_eq!(index.shards_for_page(page_id), BTreeSet::from([first_name.clone()]));
        }
        assert_eq!(index.shards_for_page(&last_page), BTreeSet::from([second_name.clone()]));
        assert_eq!(index.shards_for_page("after0"), BTreeSet::from([second_name]));
        db.close().await;
    }

    #[tokio::test]
    async fn history_spans_shards_in_insertion_order() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;

        let added = db.insert_entry(&entry("42", "100", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        let updated = db.insert_entry(&entry("42", "101", Action::Updated, 5)).await.unwrap();
        assert_ne!(added.shard, updated.shard);

        let history = db.page_history("42").await.unwrap();
        assert!(history.is_complete());
        let refs: Vec<_> = history.entries.iter().map(|e| e.entry_ref.clone()).collect();
        assert_eq!(refs, vec![added, updated]);
        assert_eq!(history.entries[0].action, Action::Added);
        assert_eq!(history.entries[1].action, Action::Updated);
        assert!(!history.entries[1].training.used_in_training);
        db.close().await;
    }

    #[tokio::test]
    async fn rebuild_after_corrupt_index_matches_full_scan() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        for i in 0..10 {
            if i % 4 == 0 {
                db.shards_mut().create_new_shard().await.unwrap();
            }
            db.insert_entry(&entry(&format!("page-{}", i), "1", Action::Added, i))
                .await
                .unwrap();
            if i % 3 == 0 {
                db.shards_mut().create_new_shard().await.unwrap();
                db.insert_entry(&entry(&format!("page-{}", i), "2", Action::Updated, i + 20))
                    .await
                    .unwrap();
            }
        }

        let index_path = db.shards().index().path().to_path_buf();
        std::fs::write(&index_path, "{ not json").unwrap();
        db.shards_mut().refresh().unwrap();
        assert!(db.shards().index().needs_rebuild());

        let report = db.shards_mut().rebuild_index().await.unwrap();
        assert_eq!(report.shards_skipped(), 0);

        let mut truth: BTreeMap<String, BTreeSet<std::path::PathBuf>> = BTreeMap::new();
        for shard in db.shards().all_shards() {
            for page_id in crate::shard_manager::scan_page_ids(&shard).await.unwrap() {
                truth.entry(page_id).or_default().insert(shard.clone());
            }
        }
        assert_eq!(truth.len(), 10);
        for (page_id, shards) in truth {
            let routed: BTreeSet<_> = db
                .shards_mut()
                .shards_for_reading(&page_id)
                .unwrap()
                .into_iter()
                .collect();
            assert_eq!(routed, shards, "page {}", page_id);
        }

        // Idempotent under repetition.
        let again = db.shards_mut().rebuild_index().await.unwrap();
        assert_eq!(again.pages_indexed(), report.pages_indexed());
        db.close().await;
    }

    #[tokio::test]
    async fn unknown_page_reads_every_shard_and_finds_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        db.insert_entry(&entry("1", "1", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        db.insert_entry(&entry("2", "1", Action::Added, 1)).await.unwrap();

        let routed = db.shards_mut().shards_for_reading("missing").unwrap();
        assert_eq!(routed, db.shards().all_shards());

        let history = db.page_history("missing").await.unwrap();
        assert!(history.entries.is_empty());
        assert!(history.is_complete());
        assert!(db.check_needs_update("missing", "1").await.unwrap());
        db.close().await;
    }

    #[tokio::test]
    async fn mark_used_in_training_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        db.insert_entry(&entry("a", "1", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        db.insert_entry(&entry("a", "2", Action::Updated, 1)).await.unwrap();
        db.insert_entry(&entry("b", "1", Action::Added, 2)).await.unwrap();

        let pages = vec!["a".to_string()];
        let first = db.mark_used_in_training(&pages, "ckpt-1").await.unwrap();
        assert!(first.is_complete());
        assert_eq!(first.rows_updated, 2);
        assert_eq!(first.shards_completed.len(), 2);
        let state: Vec<_> = db.page_history("a").await.unwrap().entries;

        let second = db.mark_used_in_training(&pages, "ckpt-1").await.unwrap();
        assert_eq!(second.rows_updated, 0);
        assert_eq!(db.page_history("a").await.unwrap().entries, state);
        assert!(state.iter().all(|e| e.training.used_in_training
            && e.training.model_checkpoint.as_deref() == Some("ckpt-1")));

        let unused = db.unused_entries(10).await.unwrap();
        assert_eq!(unused.entries.len(), 1);
        assert_eq!(unused.entries[0].page_id, "b");
        db.close().await;
    }

    #[tokio::test]
    async fn mark_resumes_after_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        let first = db.insert_entry(&entry("a", "1", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        db.insert_entry(&entry("a", "2", Action::Updated, 1)).await.unwrap();

        let options = MarkOptions {
            average_loss: Some(1.5),
            resume_after: Some(first.shard.clone()),
            ..MarkOptions::default()
        };
        let report = db
            .mark_used_in_training_with(&["a".to_string()], "ckpt-2", &options)
            .await
            .unwrap();
        assert_eq!(report.rows_updated, 1);
        assert_ne!(report.last_completed, Some(first.shard));

        let history = db.page_history("a").await.unwrap().entries;
        assert!(!history[0].training.used_in_training);
        assert_eq!(history[1].training.average_loss, Some(1.5));
        db.close().await;
    }

    #[tokio::test]
    async fn log_page_tracks_page_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;

        assert!(matches!(
            db.log_page(&page("7", "1", "v1")).await.unwrap(),
            LogOutcome::Added(_)
        ));
        assert_eq!(
            db.log_page(&page("7", "1", "v1")).await.unwrap(),
            LogOutcome::Unchanged
        );
        assert!(matches!(
            db.log_page(&page("7", "2", "v2")).await.unwrap(),
            LogOutcome::Updated(_)
        ));
        assert!(!db.check_needs_update("7", "2").await.unwrap());
        assert!(db.check_needs_update("7", "3").await.unwrap());

        assert!(db.remove_page("7").await.unwrap().is_some());
        assert_eq!(db.page_state("7").await.unwrap(), Some(Action::Removed));
        assert!(db.remove_page("7").await.unwrap().is_none());

        assert!(matches!(
            db.log_page(&page("7", "2", "v2")).await.unwrap(),
            LogOutcome::Added(_)
        ));
        let actions: Vec<_> = db
            .page_history("7")
            .await
            .unwrap()
            .entries
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![Action::Added, Action::Updated, Action::Removed, Action::Added]
        );
        db.close().await;
    }

    #[tokio::test]
    async fn token_impact_round_trips_on_sealed_shard() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        let r = db.insert_entry(&entry("t", "1", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();

        assert!(db.token_impact(&r).await.unwrap().is_none());
        let impact = TokenImpact {
            total_tokens: 512,
            top_tokens: vec![TopToken {
                token_id: 17,
                position: 3,
                impact: 0.25,
                context_start: 0,
                context_end: 8,
            }],
        };
        db.record_token_impact(&r, &impact).await.unwrap();
        assert_eq!(db.token_impact(&r).await.unwrap(), Some(impact));

        let missing = EntryRef {
            shard: r.shard.clone(),
            id: 999,
        };
        assert!(db
            .record_token_impact(&missing, &TokenImpact { total_tokens: 0, top_tokens: vec![] })
            .await
            .is_err());
        db.close().await;
    }

    #[tokio::test]
    async fn blank_shard_is_skipped_by_reads_and_adopted_by_writes() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        db.insert_entry(&entry("a", "1", Action::Added, 0)).await.unwrap();

        // A shard file left at zero bytes, as a crash between creating the
        // file and committing its schema would leave it.
        let blank = "changelog_2999_01.db";
        std::fs::write(tmp.path().join(blank), b"").unwrap();

        let history = db.page_history("a").await.unwrap();
        assert!(history.is_complete());
        assert_eq!(history.entries.len(), 1);
        assert!(!db.check_needs_update("a", "1").await.unwrap());
        let marked = db.mark_used_in_training(&["a".to_string()], "ckpt").await.unwrap();
        assert!(marked.is_complete());
        assert_eq!(marked.rows_updated, 1);

        let r = db.insert_entry(&entry("b", "1", Action::Added, 1)).await.unwrap();
        assert_eq!(r.shard, blank);
        assert!(db.shards().index().is_covered(blank));
        let history = db.page_history("b").await.unwrap();
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].entry_ref, r);
        db.close().await;
    }

    #[tokio::test]
    async fn mark_binds_page_ids_in_chunks() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        db.insert_entry(&entry("p0", "1", Action::Added, 0)).await.unwrap();
        db.insert_entry(&entry("p39999", "1", Action::Added, 1)).await.unwrap();

        let pages: Vec<String> = (0..40_000).map(|i| format!("p{}", i)).collect();
        let report = db.mark_used_in_training(&pages, "ckpt-big").await.unwrap();
        assert!(report.is_complete(), "{:?}", report.failures);
        assert_eq!(report.rows_updated, 2);

        for page_id in ["p0", "p39999"] {
            let latest = db.latest_entry(page_id).await.unwrap().unwrap();
            assert!(latest.training.used_in_training);
        }
        db.close().await;
    }

    #[tokio::test]
    async fn unreachable_shard_leaves_partial_history() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        let kept = db.insert_entry(&entry("42", "100", Action::Added, 0)).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        let lost = db.insert_entry(&entry("42", "101", Action::Updated, 5)).await.unwrap();
        db.close().await;

        std::fs::remove_file(tmp.path().join(&lost.shard)).unwrap();
        let mut db = open(tmp.path(), 90).await;

        let history = db.page_history("42").await.unwrap();
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].entry_ref, kept);
        assert_eq!(history.failures.len(), 1);
        assert!(history.failures[0].shard.ends_with(&lost.shard));

        let err = db.check_needs_update("42", "101").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::ShardError>(),
            Some(crate::error::ShardError::ShardUnreachable { .. })
        ));
        assert!(db.latest_entry("42").await.is_err());
        db.close().await;
    }

    #[tokio::test]
    async fn top_pages_rank_by_impact_across_shards() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        let impact = |tokens| TokenImpact {
            total_tokens: tokens,
            top_tokens: vec![],
        };
        let loss = |l| TrainingMetadata {
            relative_loss: Some(l),
            ..TrainingMetadata::default()
        };

        let a1 = db.insert_entry(&entry("a", "1", Action::Added, 0)).await.unwrap();
        db.record_token_impact(&a1, &impact(10)).await.unwrap();
        db.insert_entry_with(&entry("b", "1", Action::Added, 1), &loss(0.9), Some(&impact(5)))
            .await
            .unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        db.insert_entry_with(&entry("a", "2", Action::Updated, 2), &loss(0.1), Some(&impact(20)))
            .await
            .unwrap();
        db.insert_entry_with(&entry("c", "1", Action::Added, 3), &loss(0.2), Some(&impact(7)))
            .await
            .unwrap();
        db.insert_entry(&entry("d", "1", Action::Added, 4)).await.unwrap();

        let top = db.top_pages_by_impact(10).await.unwrap();
        assert!(top.failures.is_empty());
        let ranked: Vec<_> = top.pages.iter().map(|p| p.page_id.as_str()).collect();
        assert_eq!(ranked, vec!["a", "b", "c"]);
        assert_eq!(top.pages[0].impact_records, 2);
        assert_eq!(top.pages[0].total_tokens, 30);
        assert_eq!(top.pages[0].shards.len(), 2);

        let (pages, report) = db
            .mark_top_pages(2, "ckpt-top", &MarkOptions::default())
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert!(report.is_complete());
        assert_eq!(report.rows_updated, 3);

        let unused: BTreeSet<_> = db
            .unused_entries(10)
            .await
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.page_id)
            .collect();
        assert_eq!(unused, BTreeSet::from(["c".to_string(), "d".to_string()]));
        db.close().await;
    }

    #[tokio::test]
    async fn rejects_malformed_entries() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(tmp.path(), 90).await;
        let mut e = entry("x", "1", Action::Added, 0);
        e.content_hash = "abc".into();
        assert!(db.insert_entry(&e).await.is_err());
        e = entry(" ", "1", Action::Added, 0);
        assert!(db.insert_entry(&e).await.is_err());
        assert!(db.shards().all_shards().is_empty());
        db.close().await;
    }
}
