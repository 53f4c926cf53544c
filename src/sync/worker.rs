//! Background synchronizer
//!
//! Handles:
//! - Single-flight sync cycles draining unsynced quiz results and game progress
//! - Per-record submission with duplicate convergence and token invalidation
//! - Retention sweep after every cycle
//! - Worker loop reacting to timers, connectivity changes and commands

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::events::{SyncEvent, SyncEventBus, SyncStatus};
use super::network::NetworkMonitor;
use super::protocol::{ProgressApi, ProgressPayload, SubmitOutcome};
use crate::error::{OfflineError, OfflineResult};
use crate::retention::RetentionPolicy;
use crate::storage::{LocalStore, Record};

/// Timing of the background worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay before the first cycle after start
    pub settle_delay: Duration,
    /// Periodic cycle interval
    pub sync_interval: Duration,
    /// Delay applied to `SyncSoon` requests; repeated requests restart it
    pub debounce: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            sync_interval: Duration::from_secs(30),
            debounce: Duration::from_secs(1),
        }
    }
}

/// Command to send to the sync worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a cycle right away
    SyncNow,
    /// Run a cycle once the debounce delay has passed
    SyncSoon,
    /// Shutdown the worker
    Shutdown,
}

/// Why a cycle did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    /// No valid token; `SyncStarted` has already been emitted
    NotAuthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Counts are attempted records
    Completed { quiz_count: usize, game_count: usize },
    Failed(String),
}

/// Resets the in-flight flag however the cycle ends
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Reconciles locally buffered records with the server
pub struct Synchronizer {
    store: Arc<LocalStore>,
    api: Arc<dyn ProgressApi>,
    network: NetworkMonitor,
    events: Arc<SyncEventBus>,
    retention: RetentionPolicy,
    cycle_lock: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    /// Command channel of the running worker, if any
    commands: RwLock<Option<mpsc::Sender<SyncCommand>>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<LocalStore>,
        api: Arc<dyn ProgressApi>,
        network: NetworkMonitor,
        events: Arc<SyncEventBus>,
    ) -> Self {
        Self {
            store,
            api,
            network,
            events,
            retention: RetentionPolicy::default(),
            cycle_lock: tokio::sync::Mutex::new(()),
            syncing: AtomicBool::new(false),
            commands: RwLock::new(None),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn events(&self) -> &Arc<SyncEventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn api(&self) -> &Arc<dyn ProgressApi> {
        &self.api
    }

    /// Snapshot of pending work plus the in-flight and connectivity flags
    pub async fn status(&self) -> OfflineResult<SyncStatus> {
        let stats = self.store.get_storage_stats().await?;
        Ok(SyncStatus {
            is_syncing: self.is_syncing(),
            is_online: self.network.is_online(),
            unsynced_quizzes: stats.unsynced_quiz_results,
            unsynced_games: stats.unsynced_game_progress,
            unsynced_queue: stats.unsynced_queue_items,
        })
    }

    /// Run one sync cycle unless one is already in flight or the device is offline
    pub async fn run_cycle(&self) -> CycleOutcome {
        let _lock = match self.cycle_lock.try_lock() {
            Ok(lock) => lock,
            Err(_) => {
                debug!("Sync already in progress, ignoring trigger");
                return CycleOutcome::Skipped(SkipReason::AlreadySyncing);
            }
        };
        if !self.network.is_online() {
            debug!("Device offline, skipping sync");
            return CycleOutcome::Skipped(SkipReason::Offline);
        }

        self.syncing.store(true, Ordering::SeqCst);
        let _guard = SyncingGuard(&self.syncing);
        self.events.notify(&SyncEvent::SyncStarted);

        match self.drain().await {
            Ok(Some((quiz_count, game_count))) => {
                info!(
                    "Sync completed: {} quiz results, {} game sessions attempted",
                    quiz_count, game_count
                );
                self.events.notify(&SyncEvent::SyncCompleted {
                    quiz_count,
                    game_count,
                });
                CycleOutcome::Completed {
                    quiz_count,
                    game_count,
                }
            }
            Ok(None) => {
                debug!("No valid auth token, nothing to sync");
                CycleOutcome::Skipped(SkipReason::NotAuthenticated)
            }
            Err(e) => {
                error!("Sync cycle failed: {}", e);
                let message = e.to_string();
                self.events.notify(&SyncEvent::SyncError {
                    message: message.clone(),
                });
                CycleOutcome::Failed(message)
            }
        }
    }

    /// Push every unsynced record. `None` when there is no usable token.
    async fn drain(&self) -> OfflineResult<Option<(usize, usize)>> {
        self.store.init().await?;
        let token = match self.store.get_auth_token().await? {
            Some(token) => token.token,
            None => return Ok(None),
        };

        let quizzes = self.store.get_unsynced_quiz_results().await?;
        for quiz in &quizzes {
            let payload = ProgressPayload::from(quiz);
            if let Err(e) = self.submit_record(&token, quiz, &payload).await {
                warn!("Quiz result {} not synced: {}", quiz.meta.id, e);
            }
        }

        let games = self.store.get_unsynced_game_progress().await?;
        for game in &games {
            let payload = ProgressPayload::from(game);
            if let Err(e) = self.submit_record(&token, game, &payload).await {
                warn!("Game progress {} not synced: {}", game.meta.id, e);
            }
        }

        self.retention.sweep(&self.store).await;

        Ok(Some((quizzes.len(), games.len())))
    }

    /// Submit one record and mark it synced if the server has it
    async fn submit_record<T: Record>(
        &self,
        token: &str,
        record: &T,
        payload: &ProgressPayload,
    ) -> OfflineResult<SubmitOutcome> {
        let id = record.meta().id;
        let outcome = self.api.submit(token, payload).await?.classify();

        if let SubmitOutcome::AuthRejected(status) = outcome {
            warn!("Server rejected auth token (HTTP {}), removing it", status);
            if let Err(e) = self.store.delete_auth_token().await {
                error!("Failed to remove rejected auth token: {}", e);
            }
        }

        let outcome = outcome.into_result()?;
        if outcome == SubmitOutcome::Duplicate {
            debug!("{} {} already on server", T::COLLECTION, id);
        }
        self.store.collection::<T>().await?.mark_synced(id)?;
        debug!("Synced {} {}", T::COLLECTION, id);
        Ok(outcome)
    }

    /// Ask the running worker for a debounced cycle.
    ///
    /// Returns `false` when offline, already syncing, or no worker is running.
    pub fn request_sync_soon(&self) -> bool {
        if self.is_syncing() || !self.network.is_online() {
            return false;
        }
        let commands = self
            .commands
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match commands.as_ref() {
            Some(tx) => tx.try_send(SyncCommand::SyncSoon).is_ok(),
            None => {
                debug!("No sync worker running, deferring to next trigger");
                false
            }
        }
    }

    fn attach_worker(&self, tx: mpsc::Sender<SyncCommand>) {
        *self
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
    }

    fn detach_worker(&self) {
        *self
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// Background loop driving `Synchronizer::run_cycle`
pub struct SyncWorker {
    sync: Arc<Synchronizer>,
    config: WorkerConfig,
    command_rx: mpsc::Receiver<SyncCommand>,
    online_rx: watch::Receiver<bool>,
}

/// Owner's side of a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    tx: mpsc::Sender<SyncCommand>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn sender(&self) -> mpsc::Sender<SyncCommand> {
        self.tx.clone()
    }

    /// Send `Shutdown` and wait for the loop to exit
    pub async fn shutdown(self) -> OfflineResult<()> {
        // Already gone if the loop ended on its own
        let _ = self.tx.send(SyncCommand::Shutdown).await;
        self.task
            .await
            .map_err(|e| OfflineError::InternalError(format!("Sync worker task failed: {}", e)))
    }
}

impl SyncWorker {
    pub fn new(
        sync: Arc<Synchronizer>,
        config: WorkerConfig,
        command_rx: mpsc::Receiver<SyncCommand>,
    ) -> Self {
        let online_rx = sync.network.subscribe();
        Self {
            sync,
            config,
            command_rx,
            online_rx,
        }
    }

    /// Spawn a worker for `sync` and register its command channel
    pub fn spawn(sync: Arc<Synchronizer>, config: WorkerConfig) -> WorkerHandle {
        let (tx, rx) = create_command_channel();
        sync.attach_worker(tx.clone());
        let worker = SyncWorker::new(sync, config, rx);
        WorkerHandle {
            tx,
            task: tokio::spawn(worker.run()),
        }
    }

    pub async fn run(mut self) {
        info!(
            "Starting sync worker (interval: {}s)",
            self.config.sync_interval.as_secs()
        );

        let settle = tokio::time::sleep(self.config.settle_delay);
        tokio::pin!(settle);
        let mut settled = false;

        let debounce = tokio::time::sleep(self.config.debounce);
        tokio::pin!(debounce);
        let mut debounce_armed = false;

        let mut sync_interval = tokio::time::interval_at(
            Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut watching_network = true;

        loop {
            tokio::select! {
                // Handle commands
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::Shutdown) | None => {
                            info!("Sync worker shutting down");
                            break;
                        }
                        Some(SyncCommand::SyncNow) => {
                            self.sync.run_cycle().await;
                        }
                        Some(SyncCommand::SyncSoon) => {
                            debounce.as_mut().reset(Instant::now() + self.config.debounce);
                            debounce_armed = true;
                        }
                    }
                }

                // Initial cycle once the app has settled
                _ = &mut settle, if !settled => {
                    settled = true;
                    self.sync.run_cycle().await;
                }

                // Debounced request
                _ = &mut debounce, if debounce_armed => {
                    debounce_armed = false;
                    self.sync.run_cycle().await;
                }

                // Periodic sync
                _ = sync_interval.tick() => {
                    self.sync.run_cycle().await;
                }

                // Connectivity restored
                changed = self.online_rx.changed(), if watching_network => {
                    match changed {
                        Ok(()) => {
                            let online = *self.online_rx.borrow_and_update();
                            if online {
                                info!("Back online, starting sync");
                                self.sync.run_cycle().await;
                            }
                        }
                        Err(_) => watching_network = false,
                    }
                }
            }
        }

        self.sync.detach_worker();
    }
}

/// Create a command channel for the sync worker
pub fn create_command_channel() -> (mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncCommand>) {
    mpsc::channel(100)
}
