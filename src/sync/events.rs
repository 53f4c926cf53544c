//! In-process status and event bus for sync lifecycle feedback.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Lifecycle notifications delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    /// Counts are attempted records, whatever their individual outcome
    SyncCompleted {
        #[serde(rename = "quizCount")]
        quiz_count: usize,
        #[serde(rename = "gameCount")]
        game_count: usize,
    },
    SyncError {
        message: String,
    },
    ResultCapturedOffline {
        collection: String,
        id: u64,
    },
}

/// Point-in-time status for UI indicators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub is_online: bool,
    pub unsynced_quizzes: usize,
    pub unsynced_games: usize,
    pub unsynced_queue: usize,
}

/// Handle returned by `add_listener`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

pub struct SyncEventBus {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<SyncEvent>,
}

impl std::fmt::Debug for SyncEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Async stream of events for consumers that prefer a channel
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to every listener. A panicking listener is logged and
    /// does not stop delivery to the rest.
    pub fn notify(&self, event: &SyncEvent) {
        // Snapshot so listeners may (un)register from inside a callback
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("Sync listener panicked while handling {:?}", event);
            }
        }

        // No receivers is fine
        let _ = self.sender.send(event.clone());
    }
}
