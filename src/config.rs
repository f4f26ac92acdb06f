use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub shards: ShardsConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShardsConfig {
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_size_limit_mb")]
    pub size_limit_mb: u64,
    #[serde(default = "default_index_file")]
    pub index_file: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            size_limit_mb: default_size_limit_mb(),
            index_file: default_index_file(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl ShardsConfig {
    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(&self.index_file)
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_size_limit_mb() -> u64 {
    90
}
fn default_index_file() -> String {
    "shard_index.json".to_string()
}
fn default_lock_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MigrationConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_checkpoint_file")]
    pub checkpoint_file: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_file: default_checkpoint_file(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_checkpoint_file() -> String {
    "migration_checkpoint.json".to_string()
}

impl Config {
    /// Defaults for every section, used when no config file exists.
    pub fn minimal() -> Self {
        Self {
            shards: ShardsConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    /// Defaults rooted at `dir` with the given rollover threshold.
    pub fn for_dir(dir: impl Into<PathBuf>, size_limit_mb: u64) -> Self {
        let mut cfg = Self::minimal();
        cfg.shards.dir = dir.into();
        cfg.shards.size_limit_mb = size_limit_mb;
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards.size_limit_mb == 0 {
            anyhow::bail!("shards.size_limit_mb must be > 0");
        }
        if self.shards.index_file.trim().is_empty() {
            anyhow::bail!("shards.index_file must not be empty");
        }
        if self.shards.index_file.ends_with(".db") {
            anyhow::bail!(
                "shards.index_file '{}' must not use the shard extension .db",
                self.shards.index_file
            );
        }
        if self.migration.batch_size == 0 {
            anyhow::bail!("migration.batch_size must be > 0");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
