//! Shard set ownership, rollover, and routing.
//!
//! A shard directory looks like:
//!
//! ```text
//! data/
//!   changelog_2024_01.db       # sealed
//!   changelog_2024_01_001.db   # sealed, second shard of the same month
//!   changelog_2024_02.db       # current
//!   shard_index.json           # page id -> shard names
//!   .shards.lock               # cross-process write lock
//! ```
//!
//! Shards are ordered by their name key `(year, month, seq)`, which follows
//! creation order. The newest shard is current unless overridden. Names are
//! advisory: routing goes through the [`ShardIndex`].

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ShardsConfig;
use crate::db::{self, ConnectMode};
use crate::error::ShardError;
use crate::lock::WriteLock;
use crate::migrate;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::shard_index::{RebuildReport, ShardIndex};

const SHARD_PREFIX: &str = "changelog_";
const SHARD_EXT: &str = ".db";
/// Suffix of a shard whose schema is still being built. Discovery ignores it.
const STAGING_SUFFIX: &str = ".init";

/// Parsed shard file name: `changelog_YYYY_MM.db` or
/// `changelog_YYYY_MM_NNN.db` when the month already had a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardName {
    pub year: i32,
    pub month: u32,
    pub seq: u32,
}

impl ShardName {
    pub fn for_time(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
            seq: 0,
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name
            .strip_prefix(SHARD_PREFIX)?
            .strip_suffix(SHARD_EXT)?;
        let mut parts = stem.split('_');
        let year = parts.next()?;
        let month = parts.next()?;
        let seq = parts.next();
        if parts.next().is_some() || year.len() != 4 || month.len() != 2 {
            return None;
        }
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        let seq = match seq {
            // Three digits, more once a month passes 999 shards. One
            // spelling per number: no padding beyond three digits.
            Some(s) if s.len() == 3 || (s.len() > 3 && !s.starts_with('0')) => {
                if !s.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                s.parse::<u32>().ok().filter(|n| *n > 0)?
            }
            Some(_) => return None,
            None => 0,
        };
        Some(Self { year, month, seq })
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{}{:04}_{:02}{}", SHARD_PREFIX, self.year, self.month, SHARD_EXT)
        } else {
            write!(
                f,
                "{}{:04}_{:02}_{:03}{}",
                SHARD_PREFIX, self.year, self.month, self.seq, SHARD_EXT
            )
        }
    }
}

/// Pick a name for a shard created at `now` that sorts after, and differs
/// from, every existing shard. A clock that runs behind the newest shard
/// reuses that shard's bucket so creation order and name order agree.
pub fn next_shard_name(now: DateTime<Utc>, existing: &[ShardName]) -> ShardName {
    let mut candidate = ShardName::for_time(now);
    if let Some(latest) = existing.iter().max() {
        if *latest >= candidate {
            candidate = ShardName {
                seq: latest.seq + 1,
                ..*latest
            };
        }
    }
    while existing.contains(&candidate) {
        candidate.seq += 1;
    }
    candidate
}

/// Owns the shard files of one directory and the index routing into them.
///
/// Construct one per process and pass it to
/// [`ChangelogDb`](crate::changelog::ChangelogDb).
pub struct ShardManager {
    dir: PathBuf,
    limit_bytes: u64,
    lock_timeout: Duration,
    index: ShardIndex,
    shards: Vec<ShardName>,
    current_override: Option<ShardName>,
    pools: HashMap<(ShardName, ConnectMode), SqlitePool>,
}

impl ShardManager {
    /// Open the shard directory, load the index, and discover shard files.
    /// No shard is created until the first write.
    pub fn open(config: &ShardsConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("creating shard directory {}", config.dir.display()))?;

        let mut manager = Self {
            dir: config.dir.clone(),
            limit_bytes: config.size_limit_bytes(),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            index: ShardIndex::load(config.index_path()),
            shards: Vec::new(),
            current_override: None,
            pools: HashMap::new(),
        };
        manager.discover()?;

        log::info!(
            "Opened shard set at {} with {} shards, limit {:.2}MB",
            manager.dir.display(),
            manager.shards.len(),
            manager.limit_bytes as f64 / (1024.0 * 1024.0)
        );
        if let Some(current) = manager.current_shard() {
            log::info!("Current shard: {}", current.display());
        }
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn index(&self) -> &ShardIndex {
        &self.index
    }

    pub fn shard_path(&self, shard: &str) -> PathBuf {
        self.dir.join(shard)
    }

    /// Re-read the directory listing. Picks up shards created by other
    /// processes.
    fn discover(&mut self) -> Result<()> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(ShardName::parse) {
                found.push(name);
            }
        }
        found.sort();
        self.shards = found;
        Ok(())
    }

    /// Pick up shards and index changes made by other processes.
    pub fn refresh(&mut self) -> Result<()> {
        self.discover()?;
        self.index.refresh_if_changed();
        Ok(())
    }

    /// All known shards, oldest first.
    pub fn all_shards(&self) -> Vec<PathBuf> {
        self.shards
            .iter()
            .map(|s| self.dir.join(s.to_string()))
            .collect()
    }

    /// All known shard file names, oldest first.
    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(ToString::to_string).collect()
    }

    fn current_name(&self) -> Option<ShardName> {
        match self.current_override {
            Some(name) if self.shards.contains(&name) => Some(name),
            _ => self.shards.last().copied(),
        }
    }

    pub fn current_shard(&self) -> Option<PathBuf> {
        self.current_name().map(|s| self.dir.join(s.to_string()))
    }

    /// Route writes to `shard` instead of the newest shard until the next
    /// shard is created.
    pub fn set_current_shard(&mut self, shard: &str) -> Result<()> {
        self.discover()?;
        let name = ShardName::parse(shard)
            .filter(|n| self.shards.contains(n))
            .with_context(|| format!("no shard named {} in {}", shard, self.dir.display()))?;
        self.current_override = Some(name);
        Ok(())
    }

    /// On-disk size of a shard file.
    pub fn shard_size(&self, shard: &Path) -> Result<u64> {
        let meta = std::fs::metadata(shard)
            .with_context(|| format!("measuring {}", shard.display()))?;
        Ok(meta.len())
    }

    /// True when the current shard has reached the size limit, when there is
    /// no current shard, or when its size cannot be measured.
    pub fn should_create_new_shard(&self) -> bool {
        let Some(current) = self.current_shard() else {
            return true;
        };
        match self.shard_size(&current) {
            Ok(size) if size >= self.limit_bytes => {
                log::info!(
                    "Shard {} reached size limit ({:.2}MB/{:.2}MB)",
                    current.display(),
                    size as f64 / (1024.0 * 1024.0),
                    self.limit_bytes as f64 / (1024.0 * 1024.0)
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                log::warn!("{:#}; treating shard as full", e);
                true
            }
        }
    }

    /// Acquire the cross-process write lock for this directory.
    pub async fn lock(&self) -> Result<WriteLock> {
        WriteLock::acquire(&self.dir, self.lock_timeout).await
    }

    /// Create a new shard and make it current.
    pub async fn create_new_shard(&mut self) -> Result<PathBuf> {
        let lock = self.lock().await?;
        self.refresh()?;
        let name = self.create_new_shard_locked(&lock).await?;
        Ok(self.shard_path(&name))
    }

    pub(crate) async fn create_new_shard_locked(&mut self, _lock: &WriteLock) -> Result<String> {
        let name = next_shard_name(Utc::now(), &self.shards);
        let file_name = name.to_string();
        let path = self.shard_path(&file_name);
        log::info!("Creating new shard: {}", path.display());

        // Build the schema under a name discovery ignores, then move the
        // finished file into place. Readers never see a half-made shard.
        let staging = self.dir.join(format!("{}{}", file_name, STAGING_SUFFIX));
        if staging.exists() {
            log::warn!("Removing leftover {}", staging.display());
            std::fs::remove_file(&staging)
                .with_context(|| format!("removing {}", staging.display()))?;
        }
        let pool = db::create(&staging).await?;
        let migrated = migrate::run_migrations(&pool).await;
        pool.close().await;
        migrated.with_context(|| format!("initialising schema of {}", staging.display()))?;
        std::fs::File::open(&staging)
            .and_then(|f| f.sync_all())
            .with_context(|| format!("syncing {}", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("moving {} into place", path.display()))?;

        let pool = db::connect(&path, ConnectMode::Write).await?;

        // An empty shard is fully described by the index from the start.
        self.index.refresh_if_changed();
        self.index.mark_covered(&file_name);
        self.index.save()?;

        self.shards.push(name);
        self.shards.sort();
        self.current_override = None;
        self.pools.insert((name, ConnectMode::Write), pool);
        Ok(file_name)
    }

    /// Give a zero-length shard file its schema. Such a file holds no rows,
    /// so the index covers it from here on.
    async fn adopt_blank_shard_locked(&mut self, _lock: &WriteLock, name: ShardName) -> Result<()> {
        let file_name = name.to_string();
        let path = self.shard_path(&file_name);
        log::warn!("Shard {} is empty; initialising its schema", path.display());

        let pool = db::connect(&path, ConnectMode::Write).await?;
        if let Err(e) = migrate::run_migrations(&pool).await {
            pool.close().await;
            return Err(e.context(format!("initialising schema of {}", path.display())));
        }

        self.index.refresh_if_changed();
        self.index.mark_covered(&file_name);
        self.index.save()?;
        self.pools.insert((name, ConnectMode::Write), pool);
        Ok(())
    }

    /// True when `shard` exists but is zero bytes long: created, but its
    /// schema was never committed. It holds no rows.
    pub fn is_blank_shard(&self, shard: &str) -> bool {
        is_blank(&self.shard_path(shard))
    }

    /// The shard new entries go to, created or rolled over first if needed.
    pub async fn shard_for_writing(&mut self) -> Result<PathBuf> {
        let lock = self.lock().await?;
        let name = self.shard_for_writing_locked(&lock).await?;
        Ok(self.shard_path(&name))
    }

    pub(crate) async fn shard_for_writing_locked(&mut self, lock: &WriteLock) -> Result<String> {
        self.refresh()?;
        if self.should_create_new_shard() {
            return self.create_new_shard_locked(lock).await;
        }
        match self.current_name() {
            Some(name) => {
                if is_blank(&self.shard_path(&name.to_string())) {
                    self.adopt_blank_shard_locked(lock, name).await?;
                }
                Ok(name.to_string())
            }
            None => self.create_new_shard_locked(lock).await,
        }
    }

    /// Record `page_id` as present in `shard` and persist the index. Called
    /// before the row is written so the index is never missing a shard that
    /// holds committed data.
    pub(crate) fn record_pages_locked<'a>(
        &mut self,
        _lock: &WriteLock,
        page_ids: impl IntoIterator<Item = &'a str>,
        shard: &str,
    ) -> Result<()> {
        self.index.refresh_if_changed();
        let mut changed = false;
        for page_id in page_ids {
            changed |= self.index.add_page(page_id, shard);
        }
        if changed {
            self.index.save()?;
        }
        Ok(())
    }

    /// Report, without failing, a shard that a committed write left over
    /// its limit. The next write rolls over.
    pub(crate) fn note_overage(&self, shard: &str) {
        let path = self.shard_path(shard);
        if let Ok(size) = self.shard_size(&path) {
            if size >= self.limit_bytes {
                let overage = ShardError::WriteLimitExceeded {
                    path,
                    size,
                    limit: self.limit_bytes,
                };
                log::info!("{}; next write rolls over", overage);
            }
        }
    }

    /// Shards to query for `page_id`.
    ///
    /// Returns exactly the indexed shards when the index vouches for every
    /// shard on disk. Otherwise (unknown page, corrupt index, or a shard
    /// the index has not covered yet) returns every shard.
    pub fn shards_for_reading(&mut self, page_id: &str) -> Result<Vec<PathBuf>> {
        self.refresh()?;
        Ok(self.route_read(page_id))
    }

    /// [`shards_for_reading`](Self::shards_for_reading) against the shard
    /// listing and index as last refreshed.
    pub(crate) fn route_read(&self, page_id: &str) -> Vec<PathBuf> {
        let names = self.shard_names();

        if !self.index.covers_all(names.iter().map(String::as_str)) {
            log::debug!("index does not cover every shard; broadcasting read of page {}", page_id);
            return self.all_shards();
        }

        let indexed = self.index.shards_for_page(page_id);
        if indexed.is_empty() {
            return self.all_shards();
        }

        let mut ordered: Vec<PathBuf> = names
            .iter()
            .filter(|n| indexed.contains(*n))
            .map(|n| self.dir.join(n))
            .collect();
        // Indexed shards that vanished from disk are still returned so the
        // read reports them as unreachable.
        for name in indexed.iter().filter(|n| !names.contains(*n)) {
            ordered.push(self.dir.join(name));
        }
        ordered
    }

    /// A pooled connection to `shard`. The schema is verified on first open.
    pub async fn pool(&mut self, shard: &str, mode: ConnectMode) -> Result<SqlitePool> {
        let path = self.shard_path(shard);
        let name = ShardName::parse(shard)
            .with_context(|| format!("{} is not a shard file name", shard))?;
        if let Some(pool) = self.pools.get(&(name, mode)) {
            return Ok(pool.clone());
        }

        let pool = db::connect(&path, mode)
            .await
            .map_err(|e| ShardError::ShardUnreachable {
                path: path.clone(),
                operation: "connect",
                reason: format!("{:#}", e),
            })?;
        if let Err(e) = migrate::verify_schema(&pool, &path).await {
            pool.close().await;
            return Err(e);
        }
        self.pools.insert((name, mode), pool.clone());
        Ok(pool)
    }

    /// Rebuild the index from a full scan of every shard and save it.
    pub async fn rebuild_index(&mut self) -> Result<RebuildReport> {
        self.rebuild_index_with_progress(&NoProgress).await
    }

    pub async fn rebuild_index_with_progress(
        &mut self,
        progress: &dyn ProgressReporter,
    ) -> Result<RebuildReport> {
        let _lock = self.lock().await?;
        self.discover()?;
        log::info!("Rebuilding shard index over {} shards...", self.shards.len());

        let names = self.shard_names();
        let total = names.len() as u64;
        let dir = self.dir.clone();
        let mut n = 0u64;
        let report = self
            .index
            .rebuild_from_shards(&names, |shard| {
                n += 1;
                progress.report(ProgressEvent::Scanning {
                    shard: shard.clone(),
                    n,
                    total,
                });
                let path = dir.join(&shard);
                async move { scan_page_ids(&path).await }
            })
            .await;
        self.index.save()?;

        log::info!(
            "Shard index rebuilt with {} pages ({} shards indexed, {} skipped)",
            self.index.page_count(),
            report.shards_indexed(),
            report.shards_skipped()
        );
        Ok(report)
    }

    /// Close every pooled connection.
    pub async fn close(&mut self) {
        for (_, pool) in self.pools.drain() {
            pool.close().await;
        }
    }
}

fn is_blank(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

/// Page ids physically present in a shard. A blank shard has none.
pub async fn scan_page_ids(path: &Path) -> Result<BTreeSet<String>> {
    if is_blank(path) {
        return Ok(BTreeSet::new());
    }
    let pool = db::connect(path, ConnectMode::Read).await?;
    let result = async {
        migrate::verify_schema(&pool, path).await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT DISTINCT page_id FROM entries")
            .fetch_all(&pool)
            .await?;
        Ok::<_, anyhow::Error>(ids.into_iter().collect())
    }
    .await;
    pool.close().await;
    result
}
