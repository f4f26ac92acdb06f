//! Index repair and consistency checks.
//!
//! `rebuild` rescans every shard and rewrites the index. `verify` compares
//! what routing would return for each page against a brute-force scan of
//! the shard files without changing anything.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::fanout::ShardFailure;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::shard_index::RebuildReport;
use crate::shard_manager::{scan_page_ids, ShardManager};

pub async fn rebuild(
    manager: &mut ShardManager,
    progress: &dyn ProgressReporter,
) -> Result<RebuildReport> {
    manager.rebuild_index_with_progress(progress).await
}

/// A page whose routed shards differ from the shards holding its rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageMismatch {
    pub page_id: String,
    /// Shards holding rows that routing would not query. Reads of this page
    /// are incomplete until the index is rebuilt.
    pub missing: Vec<PathBuf>,
    /// Shards routing would query that hold no rows for the page. Costs a
    /// query, never correctness.
    pub extra: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub shards_scanned: usize,
    pub pages_checked: usize,
    pub mismatches: Vec<PageMismatch>,
    pub unreadable: Vec<ShardFailure>,
}

impl VerifyReport {
    /// True when no page is missing a shard and every shard was readable.
    pub fn is_consistent(&self) -> bool {
        self.unreadable.is_empty() && self.mismatches.iter().all(|m| m.missing.is_empty())
    }

    pub fn pages_with_missing_shards(&self) -> usize {
        self.mismatches.iter().filter(|m| !m.missing.is_empty()).count()
    }

    pub fn pages_with_extra_shards(&self) -> usize {
        self.mismatches.iter().filter(|m| !m.extra.is_empty()).count()
    }
}

/// Compare index routing with a full scan of every shard.
pub async fn verify(
    manager: &mut ShardManager,
    progress: &dyn ProgressReporter,
) -> Result<VerifyReport> {
    manager.refresh()?;
    let shards = manager.all_shards();
    let total = shards.len() as u64;
    let mut report = VerifyReport::default();

    let mut truth: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
    for (n, shard) in shards.iter().enumerate() {
        progress.report(ProgressEvent::Scanning {
            shard: shard.display().to_string(),
            n: n as u64 + 1,
            total,
        });
        match scan_page_ids(shard).await {
            Ok(pages) => {
                report.shards_scanned += 1;
                for page_id in pages {
                    truth.entry(page_id).or_default().insert(shard.clone());
                }
            }
            Err(e) => {
                log::warn!("verify could not scan {}: {:#}", shard.display(), e);
                report.unreadable.push(ShardFailure {
                    shard: shard.clone(),
                    operation: "verify",
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    for (page_id, holding) in truth {
        let routed: BTreeSet<PathBuf> = manager.shards_for_reading(&page_id)?.into_iter().collect();
        report.pages_checked += 1;
        let missing: Vec<_> = holding.difference(&routed).cloned().collect();
        let extra: Vec<_> = routed.difference(&holding).cloned().collect();
        if !missing.is_empty() || !extra.is_empty() {
            report.mismatches.push(PageMismatch {
                page_id,
                missing,
                extra,
            });
        }
    }

    log::info!(
        "Verified {} pages over {} shards: {} missing, {} over-broad",
        report.pages_checked,
        report.shards_scanned,
        report.pages_with_missing_shards(),
        report.pages_with_extra_shards()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangelogDb;
    use crate::config::Config;
    use crate::hash::content_hash;
    use crate::models::{Action, NewEntry};
    use crate::progress::NoProgress;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(page_id: &str) -> NewEntry {
        NewEntry {
            page_id: page_id.to_string(),
            title: page_id.to_string(),
            revision_id: "1".to_string(),
            timestamp: Utc::now(),
            content_hash: content_hash(page_id),
            action: Action::Added,
        }
    }

    #[tokio::test]
    async fn consistent_after_writes_and_after_rebuild() {
        let tmp = TempDir::new().unwrap();
        let mut db = ChangelogDb::open(&Config::for_dir(tmp.path(), 90)).unwrap();
        db.insert_entry(&entry("a")).await.unwrap();
        db.shards_mut().create_new_shard().await.unwrap();
        db.insert_entry(&entry("b")).await.unwrap();

        let report = verify(db.shards_mut(), &NoProgress).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.pages_checked, 2);
        assert!(report.mismatches.is_empty());

        // A missing index broadcasts, which is over-broad but never wrong.
        std::fs::remove_file(db.shards().index().path()).unwrap();
        let stale = verify(db.shards_mut(), &NoProgress).await.unwrap();
        assert!(stale.is_consistent());
        assert_eq!(stale.pages_with_extra_shards(), 2);

        let rebuilt = rebuild(db.shards_mut(), &NoProgress).await.unwrap();
        assert_eq!(rebuilt.shards_indexed(), 2);
        let after = verify(db.shards_mut(), &NoProgress).await.unwrap();
        assert!(after.mismatches.is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn unreadable_shard_is_inconsistent() {
        let tmp = TempDir::new().unwrap();
        let mut db = ChangelogDb::open(&Config::for_dir(tmp.path(), 90)).unwrap();
        db.insert_entry(&entry("a")).await.unwrap();
        std::fs::write(tmp.path().join("changelog_2000_01.db"), b"not a database").unwrap();

        let report = verify(db.shards_mut(), &NoProgress).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.unreadable.len(), 1);
        db.close().await;
    }
}
