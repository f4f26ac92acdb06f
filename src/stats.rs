//! Shard set statistics and health overview.
//!
//! Summarises every shard: file size against the rollover limit, entry
//! counts, training coverage, token-impact data (including orphaned rows),
//! and how many pages the index attributes to it. Used by `chlog stats` to confirm rollover and indexing behave as
//! expected.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::path::PathBuf;

use crate::db::ConnectMode;
use crate::shard_index::IndexStatus;
use crate::shard_manager::ShardManager;

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard: String,
    pub size_bytes: u64,
    pub entries: i64,
    pub used_in_training: i64,
    /// Token-impact records and the pages they belong to.
    pub token_impacts: i64,
    pub pages_with_impacts: i64,
    /// Impact rows whose metadata is gone plus top-token rows whose impact
    /// record is gone.
    pub orphaned_impacts: i64,
    pub indexed_pages: usize,
    pub covered: bool,
    /// Unix millis of the newest entry.
    pub last_entry_ms: Option<i64>,
    /// Set when the shard could not be queried.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub dir: PathBuf,
    pub limit_bytes: u64,
    pub current_shard: Option<String>,
    pub index_status: String,
    pub indexed_pages: usize,
    pub shards: Vec<ShardStats>,
}

impl Stats {
    pub fn total_size(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes).sum()
    }

    pub fn total_entries(&self) -> i64 {
        self.shards.iter().map(|s| s.entries).sum()
    }

    pub fn total_used(&self) -> i64 {
        self.shards.iter().map(|s| s.used_in_training).sum()
    }

    pub fn total_token_impacts(&self) -> i64 {
        self.shards.iter().map(|s| s.token_impacts).sum()
    }

    pub fn total_orphaned(&self) -> i64 {
        self.shards.iter().map(|s| s.orphaned_impacts).sum()
    }
}

pub async fn collect_stats(manager: &mut ShardManager) -> Result<Stats> {
    manager.refresh()?;
    let mut shards = Vec::new();

    for name in manager.shard_names() {
        let path = manager.shard_path(&name);
        let size_bytes = manager.shard_size(&path).unwrap_or(0);
        let indexed_pages = manager.index().pages_in_shard(&name).len();
        let covered = manager.index().is_covered(&name);

        let mut stats = ShardStats {
            shard: name.clone(),
            size_bytes,
            entries: 0,
            used_in_training: 0,
            token_impacts: 0,
            pages_with_impacts: 0,
            orphaned_impacts: 0,
            indexed_pages,
            covered,
            last_entry_ms: None,
            error: None,
        };

        if manager.is_blank_shard(&name) {
            shards.push(stats);
            continue;
        }

        let counted = async {
            let pool = manager.pool(&name, ConnectMode::Read).await?;
            let row = sqlx::query(
                r#"
                SELECT
                    COUNT(*) AS entries,
                    COALESCE(SUM(COALESCE(tm.used_in_training, 0)), 0) AS used,
                    MAX(e.timestamp) AS last_ts
                FROM entries e
                LEFT JOIN training_metadata tm ON tm.entry_id = e.id
                "#,
            )
            .fetch_one(&pool)
            .await?;
            let impacts = sqlx::query(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM token_impacts) AS impacts,
                    (SELECT COUNT(DISTINCT e.page_id) FROM entries e
                     JOIN training_metadata tm ON tm.entry_id = e.id
                     JOIN token_impacts ti ON ti.metadata_id = tm.id) AS pages,
                    (SELECT COUNT(*) FROM token_impacts ti
                     LEFT JOIN training_metadata tm ON tm.id = ti.metadata_id
                     WHERE tm.id IS NULL)
                    + (SELECT COUNT(*) FROM top_tokens tt
                       LEFT JOIN token_impacts ti ON ti.id = tt.token_impact_id
                       WHERE ti.id IS NULL) AS orphaned
                "#,
            )
            .fetch_one(&pool)
            .await?;
            Ok::<_, anyhow::Error>((row, impacts))
        }
        .await;

        match counted {
            Ok((row, impacts)) => {
                stats.entries = row.get("entries");
                stats.used_in_training = row.get("used");
                stats.last_entry_ms = row.get("last_ts");
                stats.token_impacts = impacts.get("impacts");
                stats.pages_with_impacts = impacts.get("pages");
                stats.orphaned_impacts = impacts.get("orphaned");
            }
            Err(e) => {
                log::warn!("stats could not read {}: {:#}", path.display(), e);
                stats.error = Some(format!("{:#}", e));
            }
        }
        shards.push(stats);
    }

    let index_status = match manager.index().status() {
        IndexStatus::Loaded => "loaded".to_string(),
        IndexStatus::Missing => "missing".to_string(),
        IndexStatus::Corrupt(reason) => format!("corrupt ({})", reason),
    };

    Ok(Stats {
        dir: manager.dir().to_path_buf(),
        limit_bytes: manager.limit_bytes(),
        current_shard: manager
            .current_shard()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
        index_status,
        indexed_pages: manager.index().page_count(),
        shards,
    })
}

/// Run the stats command: query every shard and print a summary.
pub async fn run_stats(manager: &mut ShardManager) -> Result<()> {
    let stats = collect_stats(manager).await?;

    println!("Changelog Shards — Stats");
    println!("========================");
    println!();
    println!("  Directory:   {}", stats.dir.display());
    println!("  Size limit:  {}", format_bytes(stats.limit_bytes));
    println!(
        "  Current:     {}",
        stats.current_shard.as_deref().unwrap_or("none")
    );
    println!("  Index:       {} ({} pages)", stats.index_status, stats.indexed_pages);
    println!();
    println!("  Shards:      {}", stats.shards.len());
    println!("  Total size:  {}", format_bytes(stats.total_size()));
    println!("  Entries:     {}", stats.total_entries());
    println!(
        "  Trained:     {} / {} ({}%)",
        stats.total_used(),
        stats.total_entries(),
        if stats.total_entries() > 0 {
            (stats.total_used() * 100) / stats.total_entries()
        } else {
            0
        }
    );

    println!(
        "  Impacts:     {} token-impact records, {} orphaned rows",
        stats.total_token_impacts(),
        stats.total_orphaned()
    );
    if stats.total_orphaned() > 0 {
        log::warn!("{} orphaned token-impact rows", stats.total_orphaned());
    }

    if !stats.shards.is_empty() {
        println!();
        println!(
            "  {:<28} {:>10} {:>5} {:>8} {:>8} {:>8} {:>7}   {}",
            "SHARD", "SIZE", "FULL", "ENTRIES", "TRAINED", "IMPACTS", "PAGES", "LAST ENTRY"
        );
        println!("  {}", "-".repeat(99));

        for s in &stats.shards {
            let full = if stats.limit_bytes > 0 {
                s.size_bytes.saturating_mul(100) / stats.limit_bytes
            } else {
                0
            };
            let last = match (&s.error, s.last_entry_ms) {
                (Some(_), _) => "unreadable".to_string(),
                (None, Some(ms)) => format_ts_relative(ms / 1000),
                (None, None) => "empty".to_string(),
            };
            let pages = if s.covered {
                s.indexed_pages.to_string()
            } else {
                format!("{}?", s.indexed_pages)
            };
            println!(
                "  {:<28} {:>10} {:>4}% {:>8} {:>8} {:>8} {:>7}   {}",
                s.shard,
                format_bytes(s.size_bytes),
                full,
                s.entries,
                s.used_in_training,
                s.token_impacts,
                pages,
                last
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangelogDb;
    use crate::config::Config;
    use crate::hash::content_hash;
    use crate::models::{Action, NewEntry, TokenImpact};
    use tempfile::TempDir;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(90 * 1024 * 1024), "90.0 MB");
    }

    #[tokio::test]
    async fn counts_per_shard() {
        let tmp = TempDir::new().unwrap();
        let mut db = ChangelogDb::open(&Config::for_dir(tmp.path(), 90)).unwrap();
        let mut refs = Vec::new();
        for page in ["a", "b"] {
            let r = db.insert_entry(&NewEntry {
                page_id: page.into(),
                title: page.into(),
                revision_id: "1".into(),
                timestamp: chrono::Utc::now(),
                content_hash: content_hash(page),
                action: Action::Added,
            })
            .await
            .unwrap();
            refs.push(r);
        }
        let impact = TokenImpact {
            total_tokens: 64,
            top_tokens: vec![],
        };
        db.record_token_impact(&refs[0], &impact).await.unwrap();
        db.record_token_impact(&refs[0], &impact).await.unwrap();
        db.mark_used_in_training(&["a".to_string()], "ckpt").await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();

        let stats = collect_stats(db.shards_mut()).await.unwrap();
        assert_eq!(stats.shards.len(), 2);
        assert_eq!(stats.shards[0].entries, 2);
        assert_eq!(stats.shards[0].used_in_training, 1);
        assert_eq!(stats.shards[0].indexed_pages, 2);
        assert_eq!(stats.shards[0].token_impacts, 2);
        assert_eq!(stats.shards[0].pages_with_impacts, 1);
        assert_eq!(stats.shards[0].orphaned_impacts, 0);
        assert_eq!(stats.shards[1].entries, 0);
        assert_eq!(stats.total_entries(), 2);
        assert_eq!(stats.indexed_pages, 2);
        assert_eq!(stats.current_shard.as_deref(), Some(stats.shards[1].shard.as_str()));
        assert_eq!(stats.total_token_impacts(), 2);
        db.close().await;
    }

    #[tokio::test]
    async fn blank_shard_counts_as_empty() {
        let tmp = TempDir::new().unwrap();
        let mut db = ChangelogDb::open(&Config::for_dir(tmp.path(), 90)).unwrap();
        std::fs::write(tmp.path().join("changelog_2999_01.db"), b"").unwrap();

        let stats = collect_stats(db.shards_mut()).await.unwrap();
        assert_eq!(stats.shards.len(), 1);
        assert_eq!(stats.shards[0].entries, 0);
        assert!(stats.shards[0].error.is_none());
        db.close().await;
    }
}
