//! Error taxonomy for the sharded storage layer.
//!
//! Most functions in this crate return [`anyhow::Result`]. When a failure
//! belongs to one of the categories below it is raised as a [`ShardError`]
//! so callers can tell routing problems (recoverable by a rebuild) apart
//! from storage problems (surfaced for the shard in question) with
//! `err.downcast_ref::<ShardError>()`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The side index file exists but could not be read or failed
    /// validation. Routing falls back to broadcast until `rebuild`.
    #[error("shard index {path} is corrupt: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// A shard file expected to exist could not be opened or queried.
    #[error("shard {path} is unreachable during {operation}: {reason}")]
    ShardUnreachable {
        path: PathBuf,
        operation: &'static str,
        reason: String,
    },

    /// A committed write left the shard over its size limit. Reported for
    /// visibility only; the write itself stands.
    #[error("shard {path} is {size} bytes, over its {limit} byte limit")]
    WriteLimitExceeded { path: PathBuf, size: u64, limit: u64 },

    /// The shard's tables do not match the expected schema.
    #[error("shard {path} schema mismatch: {detail}")]
    SchemaMismatch { path: PathBuf, detail: String },

    /// The cross-process write lock stayed busy past the configured timeout.
    #[error("timed out after {waited_ms}ms waiting for write lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u128 },
}
