//! Core data models for the changelog.
//!
//! These types describe the entries stored in every shard and the records
//! exchanged with the ingestion and training collaborators.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What happened to a page at the time an entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Added,
    Updated,
    Removed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Added => "added",
            Action::Updated => "updated",
            Action::Removed => "removed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "added" => Ok(Action::Added),
            "updated" => Ok(Action::Updated),
            "removed" => Ok(Action::Removed),
            other => bail!("unknown action '{}'", other),
        }
    }
}

/// An entry to be appended. Training metadata starts out unused.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub page_id: String,
    pub title: String,
    pub revision_id: String,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub action: Action,
}

/// Training provenance attached to every entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingMetadata {
    pub used_in_training: bool,
    pub training_timestamp: Option<DateTime<Utc>>,
    pub model_checkpoint: Option<String>,
    pub average_loss: Option<f64>,
    pub relative_loss: Option<f64>,
}

/// Location of a stored entry: shard file name plus the row id inside it.
/// Row ids are only unique within one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryRef {
    pub shard: String,
    pub id: i64,
}

/// A stored changelog entry as read back from a shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub entry_ref: EntryRef,
    pub page_id: String,
    pub title: String,
    pub revision_id: String,
    pub timestamp: DateTime<Utc>,
    pub content_hash: String,
    pub action: Action,
    pub training: TrainingMetadata,
}

/// One page as delivered by the fetch collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct PageFetch {
    pub title: String,
    pub page_id: String,
    pub revision_id: String,
    pub content: String,
}

/// Per-token statistics written back by the training collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenImpact {
    pub total_tokens: i64,
    pub top_tokens: Vec<TopToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopToken {
    pub token_id: i64,
    pub position: i64,
    pub impact: f64,
    pub context_start: i64,
    pub context_end: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_text() {
        for action in [Action::Added, Action::Updated, Action::Removed] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("deleted".parse::<Action>().is_err());
    }

    #[test]
    fn page_fetch_from_json() {
        let page: PageFetch = serde_json::from_str(
            r#"{"title":"Rust","page_id":"42","revision_id":"1001","content":"text"}"#,
        )
        .unwrap();
        assert_eq!(page.page_id, "42");
    }
}
