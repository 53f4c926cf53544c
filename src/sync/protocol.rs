//! Wire format of progress submissions and interpretation of server replies.
//!
//! The server accepts one JSON object per finished quiz or game and answers
//! with success, a duplicate signal, an auth failure or some other error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OfflineError, OfflineResult};
use crate::storage::{Difficulty, GameProgress, QuizResult};

/// Body of `POST <progress path>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    /// Quiz percentage (local `score` on a quiz result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_score: Option<u8>,
    /// Raw game score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// "quiz" or "game"
    pub game_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<&QuizResult> for ProgressPayload {
    fn from(quiz: &QuizResult) -> Self {
        Self {
            user_id: quiz.user_id.clone(),
            quiz_id: Some(quiz.quiz_id.clone()),
            game_id: None,
            quiz_score: Some(quiz.score),
            score: None,
            total_questions: Some(quiz.total_items),
            correct_answers: Some(quiz.correct_answers),
            time_spent: Some(quiz.time_spent),
            difficulty: Some(quiz.difficulty),
            subject: Some(quiz.subject.clone()),
            game_type: "quiz".to_string(),
            level: None,
            progress: None,
            answers: quiz.answers.clone(),
            timestamp: quiz.timestamp,
        }
    }
}

impl From<&GameProgress> for ProgressPayload {
    fn from(game: &GameProgress) -> Self {
        Self {
            user_id: game.user_id.clone(),
            quiz_id: None,
            game_id: Some(game.game_id.clone()),
            quiz_score: None,
            score: Some(game.score),
            total_questions: None,
            correct_answers: None,
            time_spent: None,
            difficulty: None,
            subject: None,
            game_type: "game".to_string(),
            level: Some(game.level),
            progress: Some(game.progress.clone()),
            answers: Vec::new(),
            timestamp: game.timestamp,
        }
    }
}

/// Raw reply to a submission: HTTP status plus the JSON body (or `Null`)
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// How a reply is to be treated by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Already applied on the server; converges to success
    Duplicate,
    /// 401/403, the stored token is no longer usable
    AuthRejected(u16),
    Rejected { status: u16, message: String },
}

impl SubmitOutcome {
    /// Whether the record can be marked synced
    pub fn is_delivered(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted | SubmitOutcome::Duplicate)
    }

    /// Map undelivered outcomes onto the error taxonomy
    pub fn into_result(self) -> OfflineResult<SubmitOutcome> {
        match self {
            SubmitOutcome::AuthRejected(status) => Err(OfflineError::AuthExpired(status)),
            SubmitOutcome::Rejected { status, message } => {
                Err(OfflineError::ServerRejected { status, message })
            }
            delivered => Ok(delivered),
        }
    }
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Auth and server failures win over anything in the body; duplicate
    /// signals only count on 2xx/409 and other 4xx replies.
    pub fn classify(&self) -> SubmitOutcome {
        if self.status == 401 || self.status == 403 {
            return SubmitOutcome::AuthRejected(self.status);
        }
        if self.status == 409 {
            return SubmitOutcome::Duplicate;
        }
        if self.is_success() {
            if is_duplicate_signal(&self.body) {
                return SubmitOutcome::Duplicate;
            }
            return SubmitOutcome::Accepted;
        }
        if (400..500).contains(&self.status) && is_duplicate_signal(&self.body) {
            return SubmitOutcome::Duplicate;
        }
        SubmitOutcome::Rejected {
            status: self.status,
            message: error_message(&self.body)
                .unwrap_or_else(|| format!("server answered with status {}", self.status)),
        }
    }
}

/// Phrases in an error/message text that mean the result is already stored
const DUPLICATE_PHRASES: &[&str] = &[
    "duplicate",
    "already recorded",
    "already submitted",
    "already exists",
    "already synced",
];

/// `"duplicate": true`, `"status": "duplicate"`, or an error/message text
/// containing one of [`DUPLICATE_PHRASES`]
pub fn is_duplicate_signal(body: &Value) -> bool {
    if body.get("duplicate").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    if let Some(status) = body.get("status").and_then(Value::as_str) {
        if status.eq_ignore_ascii_case("duplicate") {
            return true;
        }
    }
    ["error", "message"].iter().any(|field| {
        body.get(*field)
            .and_then(Value::as_str)
            .map(|text| {
                let text = text.to_ascii_lowercase();
                DUPLICATE_PHRASES.iter().any(|phrase| text.contains(phrase))
            })
            .unwrap_or(false)
    })
}

fn error_message(body: &Value) -> Option<String> {
    ["error", "message"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Remote endpoint accepting progress submissions
#[async_trait::async_trait]
pub trait ProgressApi: Send + Sync {
    /// Send one payload with the bearer `token`.
    ///
    /// Any HTTP reply is `Ok`; only transport problems are errors.
    async fn submit(&self, token: &str, payload: &ProgressPayload) -> OfflineResult<ApiResponse>;
}
