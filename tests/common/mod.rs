//! Common test utilities
//!
//! Provides shared helpers for:
//! - Creating stores in temporary directories
//! - Building sample records and tokens
//! - A scripted `ProgressApi` double that records every submission

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use classroom_sync::storage::{schema, RecordMeta};
use classroom_sync::sync::{ApiResponse, ProgressApi, ProgressPayload};
use classroom_sync::{
    AuthToken, ClassroomSync, Difficulty, GameProgress, LocalStore, NetworkMonitor, OfflineError,
    OfflineResult, QuizResult,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn create_test_store() -> (Arc<LocalStore>, TempDir) {
    let tmp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(LocalStore::new(tmp_dir.path()));
    (store, tmp_dir)
}

pub fn sample_quiz(user_id: &str, quiz_id: &str) -> QuizResult {
    QuizResult {
        meta: RecordMeta::default(),
        user_id: user_id.to_string(),
        quiz_id: quiz_id.to_string(),
        score: 80,
        total_items: 10,
        correct_answers: 8,
        time_spent: 64,
        difficulty: Difficulty::Easy,
        subject: "math".to_string(),
        answers: vec![json!({"questionId": 1, "answer": "12", "correct": true})],
        timestamp: Utc::now(),
    }
}

pub fn sample_game(user_id: &str, game_id: &str) -> GameProgress {
    GameProgress {
        meta: RecordMeta::default(),
        user_id: user_id.to_string(),
        game_id: game_id.to_string(),
        score: 420,
        level: 2,
        progress: json!({"stars": 3}),
        timestamp: Utc::now(),
    }
}

pub fn valid_token(user_id: &str) -> AuthToken {
    AuthToken::new(
        format!("token-{}", user_id),
        user_id,
        json!({"name": "Test Student"}),
        Some(Utc::now() + ChronoDuration::hours(1)),
    )
}

pub fn expired_token(user_id: &str) -> AuthToken {
    AuthToken::new(
        "stale-token",
        user_id,
        json!({}),
        Some(Utc::now() - ChronoDuration::minutes(5)),
    )
}

/// Write `bytes` as the token record of the database under `data_dir`,
/// bypassing `LocalStore`. Call before the store is opened.
pub fn write_raw_token(data_dir: &std::path::Path, bytes: &[u8]) {
    let path = data_dir.join(schema::DATABASE_NAME);
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let db = rocksdb::DB::open_cf(&opts, &path, [schema::AUTH_TOKENS]).unwrap();
    let cf = db.cf_handle(schema::AUTH_TOKENS).unwrap();
    db.put_cf(cf, b"current", bytes).unwrap();
}

/// One scripted reaction of the double
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(u16, Value),
    /// Wait, then reply
    Slow(Duration, u16, Value),
    TransportError,
}

/// A submission as seen by the double
#[derive(Debug, Clone)]
pub struct Submission {
    pub token: String,
    pub payload: ProgressPayload,
}

/// `ProgressApi` double: pops scripted reactions in order, answering 200 once
/// the script runs out. Keeps a trace of `start:<n>` / `end:<n>` markers.
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<VecDeque<Scripted>>,
    submissions: Mutex<Vec<Submission>>,
    trace: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Vec<Scripted>) -> Arc<Self> {
        let api = Self::default();
        *api.script.lock().unwrap() = script.into();
        Arc::new(api)
    }

    pub fn push(&self, scripted: Scripted) {
        self.script.lock().unwrap().push_back(scripted);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ProgressApi for ScriptedApi {
    async fn submit(&self, token: &str, payload: &ProgressPayload) -> OfflineResult<ApiResponse> {
        let n = {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(Submission {
                token: token.to_string(),
                payload: payload.clone(),
            });
            submissions.len()
        };
        self.trace.lock().unwrap().push(format!("start:{}", n));

        let next = self.script.lock().unwrap().pop_front();
        let result = match next {
            None => Ok(ApiResponse::new(200, json!({"ok": true}))),
            Some(Scripted::Reply(status, body)) => Ok(ApiResponse::new(status, body)),
            Some(Scripted::Slow(delay, status, body)) => {
                tokio::time::sleep(delay).await;
                Ok(ApiResponse::new(status, body))
            }
            Some(Scripted::TransportError) => Err(OfflineError::TransportFailure(
                "connection reset".to_string(),
            )),
        };

        self.trace.lock().unwrap().push(format!("end:{}", n));
        result
    }
}

pub fn build_service(store: Arc<LocalStore>, api: Arc<ScriptedApi>, online: bool) -> ClassroomSync {
    ClassroomSync::new(store, api, NetworkMonitor::new(online))
}
