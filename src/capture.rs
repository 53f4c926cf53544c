//! Capture of finished quizzes and games.
//!
//! A completion is submitted directly when the device is online and a token
//! is available; otherwise, or when that fails, it is written to the local
//! store for the synchronizer to deliver later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::OfflineResult;
use crate::storage::schema::{GAME_PROGRESS, QUIZ_RESULTS};
use crate::storage::{Difficulty, GameProgress, QuizResult, RecordMeta};
use crate::sync::{ProgressApi, ProgressPayload, SyncEvent, Synchronizer};

/// User id recorded when neither the caller nor the token provides one
pub const ANONYMOUS_USER: &str = "anonymous";

pub const DEFAULT_SUBJECT: &str = "general";

/// A finished quiz as reported by the UI. Missing fields get defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizCompletion {
    pub user_id: Option<String>,
    pub quiz_id: String,
    /// Percentage; derived from the answer counts when absent
    pub score: Option<u8>,
    pub total_items: u32,
    pub correct_answers: u32,
    pub time_spent: Option<u64>,
    pub difficulty: Option<Difficulty>,
    pub subject: Option<String>,
    pub answers: Vec<Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameCompletion {
    pub user_id: Option<String>,
    pub game_id: String,
    pub score: u32,
    pub level: Option<u32>,
    pub progress: Value,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Completion {
    Quiz(QuizCompletion),
    Game(GameCompletion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The server has the result; nothing was stored locally
    Submitted,
    StoredOffline { collection: &'static str, id: u64 },
}

fn resolve_user(explicit: Option<String>, fallback: &str) -> String {
    explicit
        .filter(|user| !user.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn percentage(correct: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((f64::from(correct) * 100.0) / f64::from(total)).round() as u8
}

impl QuizCompletion {
    /// Best-effort normalisation into a storable record
    pub fn into_record(self, fallback_user: &str) -> QuizResult {
        let correct_answers = self.correct_answers.min(self.total_items);
        let score = self
            .score
            .map(|score| score.min(100))
            .unwrap_or_else(|| percentage(correct_answers, self.total_items));

        QuizResult {
            meta: RecordMeta::default(),
            user_id: resolve_user(self.user_id, fallback_user),
            quiz_id: self.quiz_id,
            score,
            total_items: self.total_items,
            correct_answers,
            time_spent: self.time_spent.unwrap_or(0),
            difficulty: self.difficulty.unwrap_or_default(),
            subject: self
                .subject
                .filter(|subject| !subject.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            answers: self.answers,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

impl GameCompletion {
    pub fn into_record(self, fallback_user: &str) -> GameProgress {
        GameProgress {
            meta: RecordMeta::default(),
            user_id: resolve_user(self.user_id, fallback_user),
            game_id: self.game_id,
            score: self.score,
            level: self.level.unwrap_or(1),
            progress: self.progress,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

enum Captured {
    Quiz(QuizResult),
    Game(GameProgress),
}

impl Captured {
    fn payload(&self) -> ProgressPayload {
        match self {
            Captured::Quiz(quiz) => ProgressPayload::from(quiz),
            Captured::Game(game) => ProgressPayload::from(game),
        }
    }
}

/// Entry point for pages finishing a quiz or game
pub struct OfflineCapture {
    sync: Arc<Synchronizer>,
}

impl OfflineCapture {
    pub fn new(sync: Arc<Synchronizer>) -> Self {
        Self { sync }
    }

    /// Deliver or durably buffer `completion`.
    ///
    /// Only a local storage failure is returned as an error.
    pub async fn record_completion(&self, completion: Completion) -> OfflineResult<CaptureOutcome> {
        let store = self.sync.store();
        let token = match store.get_auth_token().await {
            Ok(token) => token,
            Err(e) if e.is_storage_unavailable() => return Err(e),
            Err(e) => {
                tracing::warn!("Could not read auth token, capturing as signed out: {}", e);
                None
            }
        };
        let fallback_user = token
            .as_ref()
            .map(|token| token.user_id.as_str())
            .unwrap_or(ANONYMOUS_USER);

        let captured = match completion {
            Completion::Quiz(quiz) => Captured::Quiz(quiz.into_record(fallback_user)),
            Completion::Game(game) => Captured::Game(game.into_record(fallback_user)),
        };

        if let Some(token) = token.as_ref().filter(|_| self.sync.network().is_online()) {
            match self.submit_direct(&token.token, &captured).await {
                Ok(()) => return Ok(CaptureOutcome::Submitted),
                Err(e) => tracing::warn!("Direct submission failed, storing result offline: {}", e),
            }
        }

        let (collection, id) = match captured {
            Captured::Quiz(quiz) => (QUIZ_RESULTS, store.save_quiz_result(quiz).await?.meta.id),
            Captured::Game(game) => (GAME_PROGRESS, store.save_game_progress(game).await?.meta.id),
        };
        tracing::info!("Stored result offline in {} (id {})", collection, id);

        self.sync.events().notify(&SyncEvent::ResultCapturedOffline {
            collection: collection.to_string(),
            id,
        });
        self.sync.request_sync_soon();

        Ok(CaptureOutcome::StoredOffline { collection, id })
    }

    async fn submit_direct(&self, token: &str, captured: &Captured) -> OfflineResult<()> {
        let outcome = self
            .sync
            .api()
            .submit(token, &captured.payload())
            .await?
            .classify();
        outcome.into_result().map(|_| ())
    }
}
