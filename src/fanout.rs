//! Scatter-gather reads across shards.
//!
//! A fan-out read issues the same query to each resolved shard, keeps each
//! shard's rows tagged with where they came from, and merges centrally.
//! Unreachable shards are recorded as failures so the caller knows the
//! result may be incomplete; a schema mismatch aborts the whole read. A
//! blank shard (created, schema not yet committed) answers with no rows.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::db::ConnectMode;
use crate::error::ShardError;
use crate::shard_manager::ShardManager;

/// Rows returned by one shard.
#[derive(Debug, Clone)]
pub struct ShardRows<T> {
    pub shard: String,
    pub rows: Vec<T>,
}

/// A shard that could not answer.
#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub shard: PathBuf,
    pub operation: &'static str,
    pub reason: String,
}

impl ShardFailure {
    pub fn to_error(&self) -> ShardError {
        ShardError::ShardUnreachable {
            path: self.shard.clone(),
            operation: self.operation,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gathered<T> {
    /// Per-shard results in the order the shards were queried.
    pub parts: Vec<ShardRows<T>>,
    pub failures: Vec<ShardFailure>,
}

impl<T> Gathered<T> {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Concatenate the parts in shard order, then stable-sort by `key`, so
    /// ties keep shard creation order and then row order within a shard.
    pub fn merge_by<K: Ord>(self, key: impl Fn(&T) -> K) -> Vec<T> {
        merge_by(self.parts, key)
    }
}

pub fn merge_by<T, K: Ord>(parts: Vec<ShardRows<T>>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut rows: Vec<T> = parts.into_iter().flat_map(|p| p.rows).collect();
    rows.sort_by_key(|r| key(r));
    rows
}

fn shard_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// A schema mismatch means the shard set itself is wrong, so the whole
/// operation stops. Every other shard error only marks that shard failed.
pub(crate) fn aborts_fanout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ShardError>(),
        Some(ShardError::SchemaMismatch { .. })
    )
}

/// Run `query` against every shard in `shards` over a read-only connection.
pub async fn scatter_gather<T, F, Fut>(
    manager: &mut ShardManager,
    shards: &[PathBuf],
    operation: &'static str,
    mut query: F,
) -> Result<Gathered<T>>
where
    F: FnMut(String, SqlitePool) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut gathered = Gathered {
        parts: Vec::with_capacity(shards.len()),
        failures: Vec::new(),
    };

    for path in shards {
        let shard = shard_file_name(path);
        if manager.is_blank_shard(&shard) {
            log::debug!("{} found blank shard {}; no rows", operation, path.display());
            gathered.parts.push(ShardRows {
                shard,
                rows: Vec::new(),
            });
            continue;
        }
        let outcome = match manager.pool(&shard, ConnectMode::Read).await {
            Ok(pool) => query(shard.clone(), pool).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(rows) => gathered.parts.push(ShardRows { shard, rows }),
            Err(e) => {
                if aborts_fanout(&e) {
                    return Err(e.context(format!("{} aborted", operation)));
                }
                log::warn!("{} skipped shard {}: {:#}", operation, path.display(), e);
                gathered.failures.push(ShardFailure {
                    shard: path.clone(),
                    operation,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    Ok(gathered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sorts_by_key_and_keeps_shard_order_on_ties() {
        let parts = vec![
            ShardRows {
                shard: "changelog_2024_01.db".into(),
                rows: vec![(3, "a1"), (5, "a2")],
            },
            ShardRows {
                shard: "changelog_2024_02.db".into(),
                rows: vec![(1, "b1"), (5, "b2")],
            },
        ];
        let merged = merge_by(parts, |(ts, _)| *ts);
        assert_eq!(
            merged.iter().map(|(_, tag)| *tag).collect::<Vec<_>>(),
            vec!["b1", "a1", "a2", "b2"]
        );
    }

    #[test]
    fn completeness_tracks_failures() {
        let mut g: Gathered<u8> = Gathered {
            parts: vec![],
            failures: vec![],
        };
        assert!(g.is_complete());
        g.failures.push(ShardFailure {
            shard: "data/changelog_2024_01.db".into(),
            operation: "page_history",
            reason: "unable to open database file".into(),
        });
        assert!(!g.is_complete());
        assert!(g.failures[0]
            .to_error()
            .to_string()
            .contains("changelog_2024_01.db"));
    }
}
