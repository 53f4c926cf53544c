use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::{GAME_PROGRESS, QUIZ_RESULTS, SYNC_QUEUE};
use crate::error::{OfflineError, OfflineResult};

/// Quiz difficulty as set by the quiz author
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Difficulty {
    type Err = OfflineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(OfflineError::InvalidRecord(format!(
                "unknown difficulty '{}'",
                other
            ))),
        }
    }
}

/// Bookkeeping fields shared by every locally buffered record.
///
/// The store owns these: `id` and `created_at` are assigned on insert, and
/// only the synchronizer flips `synced`/`synced_at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    /// Insertion marker in milliseconds since the UNIX epoch
    #[serde(default)]
    pub created_at: i64,
}

/// A record type stored in one of the synced collections
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Column family holding this record type
    const COLLECTION: &'static str;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Owner of the record, indexed under `idx:user:`
    fn user_id(&self) -> Option<&str> {
        None
    }

    /// Collection-specific secondary index as `(index name, value)`
    fn secondary_index(&self) -> Option<(&'static str, &str)> {
        None
    }

    fn validate(&self) -> OfflineResult<()> {
        Ok(())
    }
}

/// One user's completed quiz attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub user_id: String,
    pub quiz_id: String,
    /// Percentage, 0..=100
    pub score: u8,
    pub total_items: u32,
    pub correct_answers: u32,
    /// Seconds
    pub time_spent: u64,
    pub difficulty: Difficulty,
    pub subject: String,
    #[serde(default)]
    pub answers: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Record for QuizResult {
    const COLLECTION: &'static str = QUIZ_RESULTS;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn user_id(&self) -> Option<&str> {
        Some(&self.user_id)
    }

    fn secondary_index(&self) -> Option<(&'static str, &str)> {
        Some(("quiz", &self.quiz_id))
    }

    fn validate(&self) -> OfflineResult<()> {
        if self.score > 100 {
            return Err(OfflineError::InvalidRecord(format!(
                "score {} is not a percentage",
                self.score
            )));
        }
        if self.correct_answers > self.total_items {
            return Err(OfflineError::InvalidRecord(format!(
                "correctAnswers {} exceeds totalItems {}",
                self.correct_answers, self.total_items
            )));
        }
        Ok(())
    }
}

/// A finished session of one of the educational games
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameProgress {
    #[serde(flatten)]
    pub meta: RecordMeta,
    pub user_id: String,
    pub game_id: String,
    pub score: u32,
    pub level: u32,
    /// Game-specific state, passed through to the server untouched
    #[serde(default)]
    pub progress: Value,
    pub timestamp: DateTime<Utc>,
}

impl Record for GameProgress {
    const COLLECTION: &'static str = GAME_PROGRESS;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn user_id(&self) -> Option<&str> {
        Some(&self.user_id)
    }

    fn secondary_index(&self) -> Option<(&'static str, &str)> {
        Some(("game", &self.game_id))
    }
}

/// Generic queued payload, kept for kinds of work that have no dedicated collection yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(rename = "type")]
    pub item_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl SyncQueueItem {
    pub fn new(item_type: impl Into<String>, data: Value) -> Self {
        Self {
            meta: RecordMeta::default(),
            item_type: item_type.into(),
            data,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }
}

impl Record for SyncQueueItem {
    const COLLECTION: &'static str = SYNC_QUEUE;

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn secondary_index(&self) -> Option<(&'static str, &str)> {
        Some(("type", &self.item_type))
    }

    fn validate(&self) -> OfflineResult<()> {
        if self.item_type.is_empty() {
            return Err(OfflineError::InvalidRecord(
                "queue item type must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
