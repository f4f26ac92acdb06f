//! Progress reporting for long-running maintenance tools.
//!
//! Index rebuilds and migrations report what they are doing so operators see
//! which shard is being scanned and how much of a migration is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Rebuild is scanning shard `n` of `total`.
    Scanning { shard: String, n: u64, total: u64 },
    /// Migration finished a batch.
    Migrating {
        batch: u64,
        total_batches: u64,
        entries_done: u64,
        total_entries: u64,
    },
    /// Migration rolled over to a new shard.
    ShardCreated { shard: String },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the rebuild and migration loops.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "migrate  batch 3 / 20  150 / 1,000 entries".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { shard, n, total } => {
                format!("rebuild  scanning {} ({} / {})\n", shard, n, total)
            }
            ProgressEvent::Migrating {
                batch,
                total_batches,
                entries_done,
                total_entries,
            } => format!(
                "migrate  batch {} / {}  {} / {} entries\n",
                format_number(*batch),
                format_number(*total_batches),
                format_number(*entries_done),
                format_number(*total_entries)
            ),
            ProgressEvent::ShardCreated { shard } => format!("migrate  new shard {}\n", shard),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning { shard, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "shard": shard,
                "n": n,
                "total": total
            }),
            ProgressEvent::Migrating {
                batch,
                total_batches,
                entries_done,
                total_entries,
            } => serde_json::json!({
                "event": "progress",
                "phase": "migrating",
                "batch": batch,
                "total_batches": total_batches,
                "n": entries_done,
                "total": total_entries
            }),
            ProgressEvent::ShardCreated { shard } => serde_json::json!({
                "event": "shard_created",
                "shard": shard
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
