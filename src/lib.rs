//! # Changelog Shards
//!
//! A size-bounded, sharded changelog of fetched pages and the training runs
//! that used them.
//!
//! Entries are appended to monthly SQLite shard files. When the current
//! shard reaches its size limit a new one is created and becomes current;
//! older shards are never written again except for training metadata. A
//! JSON side index maps each page id to the shards holding its rows, so
//! per-page reads touch only those shards. When the index cannot vouch for
//! every shard, reads fall back to querying all of them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌────────────────────┐
//! │ ChangelogDb  │──▶│ ShardManager  │──▶│ changelog_YYYY_MM  │
//! │ (facade)     │   │ rollover+lock │   │ .db shards (SQLite) │
//! └──────┬───────┘   └──────┬────────┘   └────────────────────┘
//!        │ fan-out           │
//!        ▼                   ▼
//!   ┌──────────┐      ┌──────────────────┐
//!   │ fanout   │      │ shard_index.json │
//!   └──────────┘      └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! chlog init                        # create the first shard
//! chlog log fetched.jsonl           # log fetched pages
//! chlog history 42                  # merged history of page 42
//! chlog mark ckpt-7 42 43           # record training use
//! chlog verify                      # index vs. full scan
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Shard error taxonomy |
//! | [`hash`] | Content hashing |
//! | [`db`] | Shard connections |
//! | [`migrate`] | Shard schema |
//! | [`lock`] | Cross-process write lock |
//! | [`shard_index`] | Page → shard side index |
//! | [`shard_manager`] | Shard naming, rollover, and routing |
//! | [`fanout`] | Scatter-gather reads |
//! | [`changelog`] | The changelog facade |
//! | [`migration`] | Single-file → sharded migration |
//! | [`repair`] | Index rebuild and verification |
//! | [`stats`] | Shard statistics |
//! | [`progress`] | Progress reporting |

pub mod changelog;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod hash;
pub mod lock;
pub mod migrate;
pub mod migration;
pub mod models;
pub mod progress;
pub mod repair;
pub mod shard_index;
pub mod shard_manager;
pub mod stats;
