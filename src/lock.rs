//! Cross-process write lock for a shard directory.
//!
//! Structural mutations (row inserts, shard creation, index saves) hold an
//! exclusive advisory lock on `<dir>/.shards.lock`. The lock is released
//! when the [`WriteLock`] guard drops, including on early `?` returns.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::ShardError;

pub const LOCK_FILE_NAME: &str = ".shards.lock";

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

impl WriteLock {
    /// Acquire the directory lock, retrying with exponential backoff until
    /// `timeout` elapses.
    pub async fn acquire(dir: &Path, timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating shard directory {}", dir.display()))?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file, path }),
                Err(_) if start.elapsed() < timeout => {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(_) => {
                    return Err(ShardError::LockTimeout {
                        path,
                        waited_ms: start.elapsed().as_millis(),
                    }
                    .into())
                }
            }
        }
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("failed to release {}: {}", self.path.display(), e);
        }
    }
}
