pub mod capture;
pub mod config;
pub mod error;
pub mod retention;
pub mod storage;
pub mod sync;

pub use capture::{CaptureOutcome, Completion, GameCompletion, OfflineCapture, QuizCompletion};
pub use config::SyncConfig;
pub use error::{OfflineError, OfflineResult};
pub use retention::RetentionPolicy;
pub use storage::{
    AuthToken, DeviceId, Difficulty, GameProgress, LocalStore, QuizResult, StorageStats,
    SyncQueueItem,
};
pub use sync::{
    CycleOutcome, HttpProgressApi, ListenerId, NetworkMonitor, ProgressApi, SyncEvent,
    SyncEventBus, SyncStatus, Synchronizer, WorkerConfig,
};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use sync::{SyncWorker, WorkerHandle};

/// The offline-first service as seen by the application: capture, status,
/// listeners, manual sync and the background worker lifecycle.
pub struct ClassroomSync {
    sync: Arc<Synchronizer>,
    capture: OfflineCapture,
    worker_config: WorkerConfig,
    probe: Option<(String, Duration)>,
    worker: Mutex<Option<WorkerHandle>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClassroomSync {
    pub fn new(store: Arc<LocalStore>, api: Arc<dyn ProgressApi>, network: NetworkMonitor) -> Self {
        let sync = Synchronizer::new(store, api, network, Arc::new(SyncEventBus::new()));
        Self::from_synchronizer(Arc::new(sync), WorkerConfig::default())
    }

    pub fn from_synchronizer(sync: Arc<Synchronizer>, worker_config: WorkerConfig) -> Self {
        Self {
            capture: OfflineCapture::new(sync.clone()),
            sync,
            worker_config,
            probe: None,
            worker: Mutex::new(None),
            probe_task: Mutex::new(None),
        }
    }

    /// Wire up store, HTTP transport and connectivity from a loaded config
    pub fn from_config(config: &SyncConfig) -> OfflineResult<Self> {
        let store = Arc::new(LocalStore::new(&config.data_dir));
        let api = HttpProgressApi::new(
            &config.base_url,
            &config.progress_path,
            config.request_timeout(),
        )?;
        let sync = Synchronizer::new(
            store,
            Arc::new(api),
            NetworkMonitor::new(true),
            Arc::new(SyncEventBus::new()),
        )
        .with_retention(config.retention_policy());

        let mut service = Self::from_synchronizer(Arc::new(sync), config.worker_config());
        service.probe = config
            .probe_url
            .clone()
            .map(|url| (url, config.probe_interval()));
        Ok(service)
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        self.sync.store()
    }

    pub fn network(&self) -> &NetworkMonitor {
        self.sync.network()
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub async fn init(&self) -> OfflineResult<()> {
        self.store().init().await
    }

    pub async fn record_completion(&self, completion: Completion) -> OfflineResult<CaptureOutcome> {
        self.capture.record_completion(completion).await
    }

    pub async fn get_sync_status(&self) -> OfflineResult<SyncStatus> {
        self.sync.status().await
    }

    pub fn add_sync_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.sync.events().add_listener(listener)
    }

    pub fn remove_sync_listener(&self, id: ListenerId) -> bool {
        self.sync.events().remove_listener(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.events().subscribe()
    }

    /// Run a cycle now, subject to the single-flight guard
    pub async fn manual_sync(&self) -> CycleOutcome {
        self.sync.run_cycle().await
    }

    /// Store the token returned by a login
    pub async fn login(&self, token: AuthToken) -> OfflineResult<AuthToken> {
        self.store().save_auth_token(token).await
    }

    /// Drop the session and every locally buffered record
    pub async fn logout(&self) -> OfflineResult<()> {
        self.store().clear_all_data().await
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Start the background worker (and the connectivity probe, if configured).
    /// Calling it again while running does nothing.
    pub async fn start(&self) -> OfflineResult<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }
        self.init().await?;

        if let Some((url, interval)) = &self.probe {
            let handle = self.network().spawn_probe(url.clone(), *interval);
            *self.probe_task.lock().await = Some(handle);
        }
        *worker = Some(SyncWorker::spawn(self.sync.clone(), self.worker_config));
        tracing::info!("Classroom sync service started");
        Ok(())
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(&self) -> OfflineResult<()> {
        if let Some(probe) = self.probe_task.lock().await.take() {
            probe.abort();
        }
        let handle = self.worker.lock().await.take();
        match handle {
            Some(handle) => {
                handle.shutdown().await?;
                tracing::info!("Classroom sync service stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
