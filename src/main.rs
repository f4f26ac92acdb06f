//! # Changelog Shards CLI (`chlog`)
//!
//! The `chlog` binary operates on a directory of changelog shards: logging
//! fetched pages, reading page history, recording training use, and
//! maintaining the shard index.
//!
//! ## Usage
//!
//! ```bash
//! chlog --config ./config/chlog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chlog init` | Create the shard directory and the first shard |
//! | `chlog log <pages.jsonl>` | Log fetched pages as added/updated entries |
//! | `chlog history <page_id>` | Print a page's merged history |
//! | `chlog needs-update <page_id> <rev>` | Print whether a page needs refetching |
//! | `chlog mark <checkpoint> <page_id>...` | Mark pages as used in training |
//! | `chlog mark-top <checkpoint>` | Mark the highest token-impact pages as used |
//! | `chlog unused` | List entries not yet used in training |
//! | `chlog rebuild` | Rebuild the shard index from the shard files |
//! | `chlog verify` | Compare the index with a full scan |
//! | `chlog migrate <changelog.db>` | Move a single-file changelog into shards |
//! | `chlog stats` | Per-shard sizes and counts |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use changelog_shards::changelog::{ChangelogDb, LogOutcome, MarkOptions};
use changelog_shards::config::{self, Config};
use changelog_shards::migration::{migrate_monolithic, MigrationOptions};
use changelog_shards::models::PageFetch;
use changelog_shards::progress::ProgressMode;
use changelog_shards::{repair, stats};

/// Changelog Shards CLI: a size-bounded, sharded changelog of fetched
/// pages and their training provenance.
#[derive(Parser)]
#[command(
    name = "chlog",
    about = "Changelog Shards — a sharded SQLite changelog of fetched pages",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/chlog.toml`. Built-in defaults are used when
    /// the file does not exist.
    #[arg(long, global = true, default_value = "./config/chlog.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to human when stderr is a TTY.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shard directory, the first shard, and the index.
    ///
    /// Idempotent: an existing shard set is left as it is.
    Init,

    /// Log fetched pages from a JSON Lines file.
    ///
    /// Each line is `{"title", "page_id", "revision_id", "content"}`. New
    /// pages are logged as added, changed ones as updated, and identical
    /// revisions are skipped.
    Log {
        /// Path to the `.jsonl` file.
        file: PathBuf,
    },

    /// Print every entry of a page, oldest first, across all shards.
    History {
        page_id: String,

        /// Print entries as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print `true` if the page is unknown or its latest revision differs.
    NeedsUpdate { page_id: String, revision_id: String },

    /// Mark every entry of the given pages as used by a model checkpoint.
    Mark {
        checkpoint: String,

        #[arg(required = true)]
        page_ids: Vec<String>,

        #[arg(long)]
        average_loss: Option<f64>,

        #[arg(long)]
        relative_loss: Option<f64>,

        /// Skip shards up to and including this one (resume cursor).
        #[arg(long)]
        resume_after: Option<String>,
    },

    /// Rank pages by recorded token impact and mark the top ones as used
    /// by a model checkpoint.
    MarkTop {
        checkpoint: String,

        /// Number of pages to mark.
        #[arg(long, default_value = "10")]
        top: usize,

        #[arg(long)]
        average_loss: Option<f64>,

        #[arg(long)]
        relative_loss: Option<f64>,
    },

    /// List entries not yet used in training, oldest first.
    Unused {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Rebuild the shard index from a full scan of every shard.
    Rebuild,

    /// Compare index routing with a full scan. Exits non-zero if any page
    /// would miss a shard holding its rows.
    Verify,

    /// Migrate a single-file changelog database into shards.
    Migrate {
        source: PathBuf,

        /// Entries per batch; overrides `migration.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Ignore an existing checkpoint and start over.
        #[arg(long)]
        force_restart: bool,
    },

    /// Show per-shard sizes, entry counts, and index coverage.
    Stats,
}

fn setup_logger() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "changelog_shards=info,chlog=info");
    }
    env_logger::init();
}

fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        log::debug!("No config at {}, using defaults", path.display());
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    let mut db = ChangelogDb::open(&cfg)?;
    let result = run(cli.command, &cfg, &mut db, &*progress).await;
    db.close().await;
    result
}

async fn run(
    command: Commands,
    cfg: &Config,
    db: &mut ChangelogDb,
    progress: &dyn changelog_shards::progress::ProgressReporter,
) -> Result<()> {
    match command {
        Commands::Init => {
            let shard = match db.shards().current_shard() {
                Some(shard) => shard,
                None => db.shards_mut().create_new_shard().await?,
            };
            println!("Shard set ready at {}", db.shards().dir().display());
            println!("Current shard: {}", shard.display());
        }
        Commands::Log { file } => {
            run_log(db, &file).await?;
        }
        Commands::History { page_id, json } => {
            let history = db.page_history(&page_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                for e in &history.entries {
                    println!(
                        "{}  {:<8} rev {:<12} {}  {}{}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        e.action,
                        e.revision_id,
                        e.entry_ref.shard,
                        e.title,
                        match &e.training.model_checkpoint {
                            Some(ckpt) if e.training.used_in_training => format!("  [trained: {}]", ckpt),
                            _ => String::new(),
                        }
                    );
                }
                if history.entries.is_empty() {
                    println!("No entries for page {}.", page_id);
                }
            }
            for failure in &history.failures {
                eprintln!("warning: {}", failure.to_error());
            }
        }
        Commands::NeedsUpdate {
            page_id,
            revision_id,
        } => {
            println!("{}", db.check_needs_update(&page_id, &revision_id).await?);
        }
        Commands::Mark {
            checkpoint,
            page_ids,
            average_loss,
            relative_loss,
            resume_after,
        } => {
            let options = MarkOptions {
                average_loss,
                relative_loss,
                resume_after,
            };
            let report = db
                .mark_used_in_training_with(&page_ids, &checkpoint, &options)
                .await?;
            println!(
                "Marked {} entries across {} shards.",
                report.rows_updated,
                report.shards_completed.len()
            );
            if !report.is_complete() {
                for failure in &report.failures {
                    eprintln!("warning: {}", failure.to_error());
                }
                anyhow::bail!(
                    "{} shards failed; retry with --resume-after {}",
                    report.failures.len(),
                    report.last_completed.as_deref().unwrap_or("<none>")
                );
            }
        }
        Commands::MarkTop {
            checkpoint,
            top,
            average_loss,
            relative_loss,
        } => {
            let options = MarkOptions {
                average_loss,
                relative_loss,
                resume_after: None,
            };
            let (pages, report) = db.mark_top_pages(top, &checkpoint, &options).await?;
            if pages.is_empty() {
                println!("No pages carry token-impact data.");
            }
            for (rank, p) in pages.iter().enumerate() {
                println!(
                    "{:>3}. {:<12} {:>6} impacts {:>8} tokens  loss {:<8} {}",
                    rank + 1,
                    p.page_id,
                    p.impact_records,
                    p.total_tokens,
                    p.relative_loss
                        .map(|l| format!("{:.4}", l))
                        .unwrap_or_else(|| "-".to_string()),
                    p.title
                );
            }
            println!(
                "Marked {} entries across {} shards.",
                report.rows_updated,
                report.shards_completed.len()
            );
            if !report.is_complete() {
                for failure in &report.failures {
                    eprintln!("warning: {}", failure.to_error());
                }
                anyhow::bail!("{} shards failed; rerun to retry", report.failures.len());
            }
        }
        Commands::Unused { limit } => {
            let unused = db.unused_entries(limit).await?;
            for e in &unused.entries {
                println!(
                    "{}  {:<12} rev {:<12} {}",
                    e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    e.page_id,
                    e.revision_id,
                    e.title
                );
            }
            for failure in &unused.failures {
                eprintln!("warning: {}", failure.to_error());
            }
        }
        Commands::Rebuild => {
            let report = repair::rebuild(db.shards_mut(), progress).await?;
            println!(
                "Index rebuilt: {} pages from {} shards ({} skipped).",
                report.pages_indexed(),
                report.shards_indexed(),
                report.shards_skipped()
            );
        }
        Commands::Verify => {
            let report = repair::verify(db.shards_mut(), progress).await?;
            println!(
                "Checked {} pages over {} shards: {} missing a shard, {} over-broad, {} unreadable shards.",
                report.pages_checked,
                report.shards_scanned,
                report.pages_with_missing_shards(),
                report.pages_with_extra_shards(),
                report.unreadable.len()
            );
            for m in report.mismatches.iter().filter(|m| !m.missing.is_empty()) {
                eprintln!(
                    "missing: page {} has rows in {:?}",
                    m.page_id, m.missing
                );
            }
            if !report.is_consistent() {
                anyhow::bail!("index is inconsistent; run `chlog rebuild`");
            }
        }
        Commands::Migrate {
            source,
            batch_size,
            force_restart,
        } => {
            let options = MigrationOptions {
                batch_size: batch_size.unwrap_or(cfg.migration.batch_size),
                checkpoint_path: cfg.shards.dir.join(&cfg.migration.checkpoint_file),
                force_restart,
            };
            let report = migrate_monolithic(&source, db, &options, progress).await?;
            println!(
                "Migrated {} of {} entries ({} skipped, {} already present) into {} new shards.",
                report.migrated,
                report.total_entries,
                report.skipped,
                report.already_present,
                report.shards_created.len()
            );
            for failure in &report.failures {
                println!(
                    "  skipped row {} (page {}): {}",
                    failure.source_id,
                    failure.page_id.as_deref().unwrap_or("?"),
                    failure.reason
                );
            }
        }
        Commands::Stats => {
            stats::run_stats(db.shards_mut()).await?;
        }
    }
    Ok(())
}

async fn run_log(db: &mut ChangelogDb, file: &Path) -> Result<()> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?,
    );

    let (mut added, mut updated, mut unchanged, mut invalid) = (0u64, 0u64, 0u64, 0u64);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let page: PageFetch = match serde_json::from_str(&line) {
            Ok(page) => page,
            Err(e) => {
                log::warn!("{}:{}: {}", file.display(), n + 1, e);
                invalid += 1;
                continue;
            }
        };
        match db.log_page(&page).await? {
            LogOutcome::Added(_) => added += 1,
            LogOutcome::Updated(_) => updated += 1,
            LogOutcome::Unchanged => unchanged += 1,
        }
    }

    println!(
        "Logged {} added, {} updated, {} unchanged, {} invalid lines.",
        added, updated, unchanged, invalid
    );
    Ok(())
}
