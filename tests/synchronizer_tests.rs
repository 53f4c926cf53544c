//! Synchronizer Tests
//!
//! Covers sync cycles against a scripted server:
//! - Single-flight guard and skip reasons
//! - Sequential per-record submission
//! - Duplicate convergence, auth failure and transport errors
//! - Retention during a cycle
//! - Worker triggers (connectivity restored, debounced requests)

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use classroom_sync::sync::{SkipReason, SyncWorker};
use classroom_sync::{
    Completion, CycleOutcome, QuizCompletion, SyncEvent, WorkerConfig,
};
use common::*;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collect_events(service: &classroom_sync::ClassroomSync) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    service.add_sync_listener(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

// ============================================================================
// Cycle Basics
// ============================================================================

#[tokio::test]
async fn test_cycle_pushes_quizzes_then_games() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::new();
    let service = build_service(store.clone(), api.clone(), true);
    let events = collect_events(&service);

    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_game_progress(sample_game("u1", "memory")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();

    let outcome = service.manual_sync().await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            quiz_count: 1,
            game_count: 1
        }
    );

    let submissions = api.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].payload.game_type, "quiz");
    assert_eq!(submissions[1].payload.game_type, "game");
    assert!(submissions.iter().all(|s| s.token == "token-u1"));

    assert_eq!(service.get_sync_status().await.unwrap().unsynced_quizzes, 0);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            SyncEvent::SyncStarted,
            SyncEvent::SyncCompleted {
                quiz_count: 1,
                game_count: 1
            }
        ]
    );
}

#[tokio::test]
async fn test_offline_cycle_emits_nothing() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::new();
    let service = build_service(store.clone(), api.clone(), false);
    let events = collect_events(&service);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();

    assert_eq!(
        service.manual_sync().await,
        CycleOutcome::Skipped(SkipReason::Offline)
    );
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(api.submission_count(), 0);
}

#[tokio::test]
async fn test_missing_token_aborts_without_error() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::new();
    let service = build_service(store.clone(), api.clone(), true);
    let events = collect_events(&service);
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();

    assert_eq!(
        service.manual_sync().await,
        CycleOutcome::Skipped(SkipReason::NotAuthenticated)
    );
    assert_eq!(*events.lock().unwrap(), vec![SyncEvent::SyncStarted]);
    assert_eq!(api.submission_count(), 0);
    assert!(!service.get_sync_status().await.unwrap().is_syncing);
}

// ============================================================================
// Single-flight and Ordering
// ============================================================================

#[tokio::test]
async fn test_overlapping_triggers_run_one_cycle() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![Scripted::Slow(
        Duration::from_millis(200),
        200,
        json!({}),
    )]);
    let service = Arc::new(build_service(store.clone(), api.clone(), true));
    let events = collect_events(&service);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.manual_sync().await })
    };
    // Let the first cycle reach the slow submission
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.get_sync_status().await.unwrap().is_syncing);

    let second = service.manual_sync().await;
    assert_eq!(second, CycleOutcome::Skipped(SkipReason::AlreadySyncing));

    let first = first.await.unwrap();
    assert!(matches!(first, CycleOutcome::Completed { quiz_count: 1, .. }));

    let started = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == SyncEvent::SyncStarted)
        .count();
    assert_eq!(started, 1);
    assert_eq!(api.submission_count(), 1);
    assert!(!service.get_sync_status().await.unwrap().is_syncing);
}

#[tokio::test]
async fn test_records_are_submitted_sequentially() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![
        Scripted::Slow(Duration::from_millis(30), 200, json!({})),
        Scripted::TransportError,
        Scripted::Slow(Duration::from_millis(10), 500, json!({"error": "db down"})),
        Scripted::Reply(200, json!({})),
    ]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    for i in 0..4 {
        store
            .save_quiz_result(sample_quiz("u1", &format!("q{}", i)))
            .await
            .unwrap();
    }

    service.manual_sync().await;

    let expected: Vec<String> = (1..=4)
        .flat_map(|n| vec![format!("start:{}", n), format!("end:{}", n)])
        .collect();
    assert_eq!(api.trace(), expected);

    let quiz_ids: Vec<String> = api
        .submissions()
        .iter()
        .map(|s| s.payload.quiz_id.clone().unwrap())
        .collect();
    assert_eq!(quiz_ids, vec!["q0", "q1", "q2", "q3"]);
}

// ============================================================================
// Response Handling
// ============================================================================

#[tokio::test]
async fn test_failures_leave_records_for_next_cycle() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![
        Scripted::TransportError,
        Scripted::Reply(200, json!({})),
        Scripted::Reply(503, json!({"message": "maintenance"})),
    ]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    let a = store.save_quiz_result(sample_quiz("u1", "a")).await.unwrap();
    let b = store.save_quiz_result(sample_quiz("u1", "b")).await.unwrap();
    let c = store.save_quiz_result(sample_quiz("u1", "c")).await.unwrap();

    // Partial failure still completes the cycle with attempted counts
    assert_eq!(
        service.manual_sync().await,
        CycleOutcome::Completed {
            quiz_count: 3,
            game_count: 0
        }
    );
    let pending: Vec<u64> = store
        .get_unsynced_quiz_results()
        .await
        .unwrap()
        .iter()
        .map(|q| q.meta.id)
        .collect();
    assert_eq!(pending, vec![a.meta.id, c.meta.id]);
    assert!(store.get_quiz_result(b.meta.id).await.unwrap().unwrap().meta.synced);

    // Script exhausted: everything is accepted now
    service.manual_sync().await;
    assert!(store.get_unsynced_quiz_results().await.unwrap().is_empty());
    assert_eq!(api.submission_count(), 5);
}

#[tokio::test]
async fn test_duplicates_converge_to_synced() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![
        Scripted::Reply(409, json!({})),
        Scripted::Reply(400, json!({"error": "Result already submitted"})),
        Scripted::Reply(200, json!({"duplicate": true})),
    ]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();
    store.save_game_progress(sample_game("u1", "g1")).await.unwrap();

    service.manual_sync().await;

    let stats = service.get_sync_status().await.unwrap();
    assert_eq!(stats.unsynced_quizzes, 0);
    assert_eq!(stats.unsynced_games, 0);
    for quiz in store.quiz_results_by_user("u1").await.unwrap() {
        assert!(quiz.meta.synced);
        assert!(quiz.meta.synced_at.is_some());
    }
}

#[tokio::test]
async fn test_auth_failure_deletes_token_but_not_records() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![Scripted::Reply(401, json!({"error": "expired"}))]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();
    store.save_quiz_result(sample_quiz("u1", "q2")).await.unwrap();
    store.save_game_progress(sample_game("u1", "g1")).await.unwrap();
    store.enqueue("quiz", json!({})).await.unwrap();

    let outcome = service.manual_sync().await;
    assert!(matches!(outcome, CycleOutcome::Completed { quiz_count: 2, game_count: 1 }));

    assert!(store.peek_auth_token().await.unwrap().is_none());

    let status = service.get_sync_status().await.unwrap();
    assert_eq!(status.unsynced_quizzes, 1);
    assert_eq!(status.unsynced_games, 0);
    assert_eq!(status.unsynced_queue, 1);

    // Without a token the next cycle has nothing to do
    assert_eq!(
        service.manual_sync().await,
        CycleOutcome::Skipped(SkipReason::NotAuthenticated)
    );
}

#[tokio::test]
async fn test_forbidden_is_an_auth_failure() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![Scripted::Reply(403, serde_json::Value::Null)]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    store.save_game_progress(sample_game("u1", "g1")).await.unwrap();

    service.manual_sync().await;
    assert!(store.peek_auth_token().await.unwrap().is_none());
    assert_eq!(store.get_unsynced_game_progress().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_auth_rejection_wording_is_not_mistaken_for_duplicate() {
    for (status, body) in [
        (401, json!({"error": "Session already expired"})),
        (403, json!({"message": "User already logged out"})),
    ] {
        let (store, _tmp) = create_test_store();
        let api = ScriptedApi::with_script(vec![Scripted::Reply(status, body)]);
        let service = build_service(store.clone(), api.clone(), true);
        store.save_auth_token(valid_token("u1")).await.unwrap();
        let quiz = store.save_quiz_result(sample_quiz("u1", "q1")).await.unwrap();

        service.manual_sync().await;

        assert!(store.peek_auth_token().await.unwrap().is_none(), "status {}", status);
        let stored = store.get_quiz_result(quiz.meta.id).await.unwrap().unwrap();
        assert!(!stored.meta.synced, "status {}", status);
    }
}

#[tokio::test]
async fn test_server_error_mentioning_already_keeps_record_pending() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::with_script(vec![Scripted::Reply(
        500,
        json!({"error": "Connection already closed"}),
    )]);
    let service = build_service(store.clone(), api.clone(), true);
    store.save_auth_token(valid_token("u1")).await.unwrap();
    let game = store.save_game_progress(sample_game("u1", "g1")).await.unwrap();

    service.manual_sync().await;

    assert!(store.peek_auth_token().await.unwrap().is_some());
    let stored = store.get_game_progress(game.meta.id).await.unwrap().unwrap();
    assert!(!stored.meta.synced);

    // Retried and accepted on the next cycle
    service.manual_sync().await;
    assert!(store.get_unsynced_game_progress().await.unwrap().is_empty());
    assert_eq!(api.submission_count(), 2);
}

#[tokio::test]
async fn test_cycle_runs_retention_sweep() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::new();
    let service = build_service(store.clone(), api, true);
    store.save_auth_token(valid_token("u1")).await.unwrap();

    let old = store.save_quiz_result(sample_quiz("u1", "old")).await.unwrap();
    let fresh = store.save_quiz_result(sample_quiz("u1", "fresh")).await.unwrap();
    store
        .mark_quiz_result_synced_at(old.meta.id, Utc::now() - ChronoDuration::days(8))
        .await
        .unwrap();
    store
        .mark_quiz_result_synced_at(fresh.meta.id, Utc::now() - ChronoDuration::days(1))
        .await
        .unwrap();

    service.manual_sync().await;

    assert!(store.get_quiz_result(old.meta.id).await.unwrap().is_none());
    assert!(store.get_quiz_result(fresh.meta.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_storage_failure_emits_sync_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let blocker = tmp.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let store = Arc::new(classroom_sync::LocalStore::new(&blocker));
    let service = build_service(store, ScriptedApi::new(), true);
    let events = collect_events(&service);

    let outcome = service.manual_sync().await;
    assert!(matches!(outcome, CycleOutcome::Failed(_)));

    let events = events.lock().unwrap();
    assert_eq!(events[0], SyncEvent::SyncStarted);
    assert!(matches!(events[1], SyncEvent::SyncError { .. }));
}

// ============================================================================
// End-to-end
// ============================================================================

#[tokio::test]
async fn test_offline_quiz_syncs_after_reconnect() {
    let (store, _tmp) = create_test_store();
    let api = ScriptedApi::new();
    let service = build_service(store.clone(), api.clone(), false);
    service.login(valid_token("u1")).await.unwrap();
    let mut rx = service.subscribe();

    let outcome = service
        .record_completion(Completion::Quiz(QuizCompletion {
            quiz_id: "multiplication".to_string(),
            total_items: 10,
            correct_answers: 8,
            ..Default::default()
        }))
        .await
        .unwrap();
    let id = match outcome {
        classroom_sync::CaptureOutcome::StoredOffline { id, .. } => id,
        other => panic!("expected offline capture, got {:?}", other),
    };

    let stored = store.get_quiz_result(id).await.unwrap().unwrap();
    assert_eq!(stored.score, 80);
    assert_eq!(stored.total_items, 10);
    assert_eq!(stored.correct_answers, 8);
    assert!(!stored.meta.synced);
    assert_eq!(api.submission_count(), 0);

    let handle = SyncWorker::spawn(
        service.synchronizer().clone(),
        WorkerConfig {
            settle_delay: Duration::from_secs(3600),
            sync_interval: Duration::from_secs(3600),
            debounce: Duration::from_millis(10),
        },
    );
    service.network().set_online(true);

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.unwrap() {
                event @ SyncEvent::SyncCompleted { .. } => break event,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        completed,
        SyncEvent::SyncCompleted {
            quiz_count: 1,
            game_count: 0
        }
    );

    let synced = store.get_quiz_result(id).await.unwrap().unwrap();
    assert!(synced.meta.synced);
    assert!(synced.meta.synced_at.is_some());
    assert_eq!(api.submissions()[0].payload.quiz_score, Some(80));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_service_start_and_stop() {
    let (store, _tmp) = create_test_store();
    let service = build_service(store, ScriptedApi::new(), true);

    service.start().await.unwrap();
    assert!(service.is_running().await);
    // Second start is a no-op
    service.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), service.stop())
        .await
        .unwrap()
        .unwrap();
    assert!(!service.is_running().await);
    service.stop().await.unwrap();
}
