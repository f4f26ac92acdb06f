//! Page-to-shard index.
//!
//! The index maps each page id to the set of shard files holding rows for
//! it, and records which shards it fully accounts for ("covered" shards).
//! It is persisted as pretty-printed JSON next to the shards so an operator
//! can read or hand-edit it:
//!
//! ```json
//! {
//!   "version": 1,
//!   "shards": ["changelog_2024_01.db", "changelog_2024_02.db"],
//!   "pages": {
//!     "42": ["changelog_2024_01.db", "changelog_2024_02.db"]
//!   }
//! }
//! ```
//!
//! Invariant: for every covered shard, every page with rows in that shard
//! lists it. Pages may list extra shards (stale but safe). A shard that is
//! not covered may hold pages the index knows nothing about, so routing
//! must broadcast while any uncovered shard exists.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::ShardError;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexFile {
    version: u32,
    #[serde(default)]
    shards: BTreeSet<String>,
    #[serde(default)]
    pages: BTreeMap<String, BTreeSet<String>>,
}

/// How the in-memory index came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    /// Read from a valid index file.
    Loaded,
    /// No index file existed yet.
    Missing,
    /// The file was unreadable or failed validation; it must be rebuilt.
    Corrupt(String),
}

/// Identity of the index file on disk, used to notice writes made by other
/// processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    // Every save renames a fresh file into place.
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: inode(&meta),
        })
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

/// Per-shard outcome of a rebuild scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardScan {
    Indexed { shard: String, pages: usize },
    Skipped { shard: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    pub scans: Vec<ShardScan>,
}

impl RebuildReport {
    pub fn shards_indexed(&self) -> usize {
        self.scans
            .iter()
            .filter(|s| matches!(s, ShardScan::Indexed { .. }))
            .count()
    }

    pub fn shards_skipped(&self) -> usize {
        self.scans.len() - self.shards_indexed()
    }

    pub fn pages_indexed(&self) -> usize {
        self.scans
            .iter()
            .map(|s| match s {
                ShardScan::Indexed { pages, .. } => *pages,
                ShardScan::Skipped { .. } => 0,
            })
            .sum()
    }
}

#[derive(Debug)]
pub struct ShardIndex {
    path: PathBuf,
    covered: BTreeSet<String>,
    pages: BTreeMap<String, BTreeSet<String>>,
    status: IndexStatus,
    stamp: Option<FileStamp>,
    corrupt_on_disk: bool,
}

impl ShardIndex {
    /// An empty index bound to `path`, not yet read from disk.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            covered: BTreeSet::new(),
            pages: BTreeMap::new(),
            status: IndexStatus::Missing,
            stamp: None,
            corrupt_on_disk: false,
        }
    }

    /// Load the index from `path`. Never fails: a missing file gives an
    /// empty index and an unreadable or malformed one gives an empty index
    /// marked [`IndexStatus::Corrupt`].
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut index = Self::empty(path);
        index.reload();
        index
    }

    /// Re-read the file, replacing the in-memory state.
    pub fn reload(&mut self) {
        self.stamp = FileStamp::of(&self.path);
        self.covered.clear();
        self.pages.clear();
        self.corrupt_on_disk = false;

        if !self.path.exists() {
            log::info!("No shard index at {}, starting empty", self.path.display());
            self.status = IndexStatus::Missing;
            return;
        }

        match read_index_file(&self.path) {
            Ok(file) => {
                self.covered = file.shards;
                self.pages = file.pages;
                self.status = IndexStatus::Loaded;
                log::debug!(
                    "Loaded shard index with {} pages over {} shards",
                    self.pages.len(),
                    self.covered.len()
                );
            }
            Err(e) => {
                let err = ShardError::IndexCorrupt {
                    path: self.path.clone(),
                    reason: format!("{:#}", e),
                };
                log::warn!("{}; routing will broadcast until rebuilt", err);
                self.status = IndexStatus::Corrupt(format!("{:#}", e));
                self.corrupt_on_disk = true;
            }
        }
    }

    /// Reload only if another writer changed the file since we last read or
    /// wrote it. Returns true when a reload happened.
    pub fn refresh_if_changed(&mut self) -> bool {
        if FileStamp::of(&self.path) != self.stamp {
            self.reload();
            true
        } else {
            false
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> &IndexStatus {
        &self.status
    }

    pub fn needs_rebuild(&self) -> bool {
        matches!(self.status, IndexStatus::Corrupt(_))
    }

    /// Record that `page_id` has rows in `shard`. Returns true if the
    /// mapping changed.
    pub fn add_page(&mut self, page_id: &str, shard: &str) -> bool {
        self.pages
            .entry(page_id.to_string())
            .or_default()
            .insert(shard.to_string())
    }

    /// Declare `shard` fully accounted for. Only valid for a shard that is
    /// brand new (empty) or has just been scanned.
    pub fn mark_covered(&mut self, shard: &str) -> bool {
        self.covered.insert(shard.to_string())
    }

    pub fn is_covered(&self, shard: &str) -> bool {
        self.covered.contains(shard)
    }

    /// True when every shard in `shards` is covered and the file was valid.
    pub fn covers_all<'a>(&self, shards: impl IntoIterator<Item = &'a str>) -> bool {
        !self.needs_rebuild() && shards.into_iter().all(|s| self.covered.contains(s))
    }

    pub fn shards_for_page(&self, page_id: &str) -> BTreeSet<String> {
        self.pages.get(page_id).cloned().unwrap_or_default()
    }

    pub fn pages_in_shard(&self, shard: &str) -> BTreeSet<String> {
        self.pages
            .iter()
            .filter(|(_, shards)| shards.contains(shard))
            .map(|(page, _)| page.clone())
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Write the index atomically: temp file, fsync, rename.
    ///
    /// A corrupt file is moved aside to `<name>.corrupt` before being
    /// replaced so it can still be inspected.
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.corrupt_on_disk && self.path.exists() {
            let aside = self.path.with_extension("json.corrupt");
            if let Err(e) = std::fs::rename(&self.path, &aside) {
                log::warn!("could not move corrupt index aside: {}", e);
            }
        }

        let file = IndexFile {
            version: INDEX_VERSION,
            shards: self.covered.clone(),
            pages: self.pages.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut f = std::fs::File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            f.write_all(json.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;

        self.stamp = FileStamp::of(&self.path);
        self.corrupt_on_disk = false;
        // Whatever was corrupt is gone; coverage excludes every shard this
        // index cannot vouch for.
        self.status = IndexStatus::Loaded;
        log::debug!("Saved shard index with {} pages", self.pages.len());
        Ok(())
    }

    /// Replace the whole mapping by scanning every shard from scratch.
    ///
    /// `scan` returns the page ids physically present in a shard. Shards
    /// whose scan fails are skipped and stay uncovered, which keeps reads
    /// broadcasting to them. The caller persists the result with
    /// [`ShardIndex::save`].
    pub async fn rebuild_from_shards<F, Fut>(
        &mut self,
        shards: &[String],
        mut scan: F,
    ) -> RebuildReport
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<BTreeSet<String>>>,
    {
        let mut covered = BTreeSet::new();
        let mut pages: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut report = RebuildReport::default();

        for shard in shards {
            match scan(shard.clone()).await {
                Ok(ids) => {
                    let count = ids.len();
                    for id in ids {
                        pages.entry(id).or_default().insert(shard.clone());
                    }
                    covered.insert(shard.clone());
                    report.scans.push(ShardScan::Indexed {
                        shard: shard.clone(),
                        pages: count,
                    });
                }
                Err(e) => {
                    log::error!("Error scanning shard {}: {:#}", shard, e);
                    report.scans.push(ShardScan::Skipped {
                        shard: shard.clone(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        self.covered = covered;
        self.pages = pages;
        self.status = IndexStatus::Loaded;
        report
    }
}

fn read_index_file(path: &Path) -> Result<IndexFile> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: IndexFile = serde_json::from_str(&content).context("parsing index JSON")?;
    validate(&file)?;
    Ok(file)
}

fn validate(file: &IndexFile) -> Result<()> {
    if file.version != INDEX_VERSION {
        anyhow::bail!("unsupported index version {}", file.version);
    }
    for shard in &file.shards {
        validate_shard_name(shard)?;
    }
    for (page, shards) in &file.pages {
        if page.trim().is_empty() {
            anyhow::bail!("empty page id");
        }
        if shards.is_empty() {
            anyhow::bail!("page {} maps to no shards", page);
        }
        for shard in shards {
            validate_shard_name(shard)?;
        }
    }
    Ok(())
}

fn validate_shard_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || !name.ends_with(".db") {
        anyhow::bail!("invalid shard file name '{}'", name);
    }
    Ok(())
}
