use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use super::auth::{AuthToken, DeviceId, CURRENT_TOKEN_KEY};
use super::collection::{clear_collection_into, Collection};
use super::record::{GameProgress, QuizResult, Record, SyncQueueItem};
use super::schema::{
    self, AUTH_TOKENS, DATABASE_NAME, META_CF, SCHEMA_VERSION, SCHEMA_VERSION_KEY,
};
use crate::error::{OfflineError, OfflineResult};

/// Counts of records still waiting for the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub unsynced_quiz_results: usize,
    pub unsynced_game_progress: usize,
    pub unsynced_queue_items: usize,
}

impl StorageStats {
    pub fn total(&self) -> usize {
        self.unsynced_quiz_results + self.unsynced_game_progress + self.unsynced_queue_items
    }
}

/// An opened database plus the per-collection writer locks / id sequences
struct OpenStore {
    db: Arc<DB>,
    writers: HashMap<&'static str, Arc<Mutex<u64>>>,
}

/// Durable on-device store for quiz results, game progress, the auth token
/// and the generic sync queue, backed by RocksDB.
///
/// Nothing is opened until the first operation (or an explicit `init`);
/// concurrent callers share the same in-flight open.
pub struct LocalStore {
    /// Data directory; the database lives in `DATABASE_NAME` below it
    data_dir: PathBuf,
    inner: OnceCell<Arc<OpenStore>>,
    device_id: OnceCell<DeviceId>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("data_dir", &self.data_dir)
            .field("open", &self.inner.initialized())
            .finish()
    }
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            inner: OnceCell::new(),
            device_id: OnceCell::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_NAME)
    }

    pub fn is_open(&self) -> bool {
        self.inner.initialized()
    }

    /// Open the database, creating and upgrading it as needed. Idempotent.
    pub async fn init(&self) -> OfflineResult<()> {
        self.open().await.map(|_| ())
    }

    async fn open(&self) -> OfflineResult<&Arc<OpenStore>> {
        self.inner
            .get_or_try_init(|| async {
                let path = self.database_path();
                let store = tokio::task::spawn_blocking(move || open_store(&path))
                    .await
                    .map_err(|e| {
                        OfflineError::StorageUnavailable(format!("open task failed: {}", e))
                    })??;
                Ok::<_, OfflineError>(Arc::new(store))
            })
            .await
    }

    /// Typed handle on the collection holding `T`
    pub async fn collection<T: Record>(&self) -> OfflineResult<Collection<T>> {
        let store = self.open().await?;
        let writer = store
            .writers
            .get(T::COLLECTION)
            .cloned()
            .ok_or_else(|| OfflineError::CollectionNotFound(T::COLLECTION.to_string()))?;
        Ok(Collection::new(store.db.clone(), writer))
    }

    /// Stable identifier of this device
    pub async fn device_id(&self) -> OfflineResult<&DeviceId> {
        self.device_id
            .get_or_try_init(|| async {
                let dir = self.data_dir.clone();
                tokio::task::spawn_blocking(move || DeviceId::load_or_create(&dir))
                    .await
                    .map_err(|e| OfflineError::InternalError(format!("device id task failed: {}", e)))?
            })
            .await
    }

    // ==================== Quiz Results ====================

    pub async fn save_quiz_result(&self, result: QuizResult) -> OfflineResult<QuizResult> {
        self.collection::<QuizResult>().await?.insert(result)
    }

    pub async fn get_quiz_result(&self, id: u64) -> OfflineResult<Option<QuizResult>> {
        self.collection::<QuizResult>().await?.get(id)
    }

    pub async fn get_unsynced_quiz_results(&self) -> OfflineResult<Vec<QuizResult>> {
        self.collection::<QuizResult>().await?.unsynced()
    }

    pub async fn mark_quiz_result_synced(&self, id: u64) -> OfflineResult<Option<QuizResult>> {
        self.collection::<QuizResult>().await?.mark_synced(id)
    }

    pub async fn mark_quiz_result_synced_at(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> OfflineResult<Option<QuizResult>> {
        self.collection::<QuizResult>().await?.mark_synced_at(id, at)
    }

    pub async fn quiz_results_by_user(&self, user_id: &str) -> OfflineResult<Vec<QuizResult>> {
        self.collection::<QuizResult>().await?.by_user(user_id)
    }

    // ==================== Game Progress ====================

    pub async fn save_game_progress(&self, progress: GameProgress) -> OfflineResult<GameProgress> {
        self.collection::<GameProgress>().await?.insert(progress)
    }

    pub async fn get_game_progress(&self, id: u64) -> OfflineResult<Option<GameProgress>> {
        self.collection::<GameProgress>().await?.get(id)
    }

    pub async fn get_unsynced_game_progress(&self) -> OfflineResult<Vec<GameProgress>> {
        self.collection::<GameProgress>().await?.unsynced()
    }

    pub async fn mark_game_progress_synced(&self, id: u64) -> OfflineResult<Option<GameProgress>> {
        self.collection::<GameProgress>().await?.mark_synced(id)
    }

    pub async fn mark_game_progress_synced_at(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> OfflineResult<Option<GameProgress>> {
        self.collection::<GameProgress>().await?.mark_synced_at(id, at)
    }

    pub async fn game_progress_by_user(&self, user_id: &str) -> OfflineResult<Vec<GameProgress>> {
        self.collection::<GameProgress>().await?.by_user(user_id)
    }

    // ==================== Sync Queue ====================

    pub async fn enqueue(
        &self,
        item_type: impl Into<String>,
        data: serde_json::Value,
    ) -> OfflineResult<SyncQueueItem> {
        self.collection::<SyncQueueItem>()
            .await?
            .insert(SyncQueueItem::new(item_type, data))
    }

    pub async fn get_unsynced_queue_items(&self) -> OfflineResult<Vec<SyncQueueItem>> {
        self.collection::<SyncQueueItem>().await?.unsynced()
    }

    pub async fn mark_queue_item_synced(&self, id: u64) -> OfflineResult<Option<SyncQueueItem>> {
        self.collection::<SyncQueueItem>().await?.mark_synced(id)
    }

    pub async fn mark_queue_item_synced_at(
        &self,
        id: u64,
        at: DateTime<Utc>,
    ) -> OfflineResult<Option<SyncQueueItem>> {
        self.collection::<SyncQueueItem>().await?.mark_synced_at(id, at)
    }

    /// Bump the retry counter of an unsynced queue item
    pub async fn increment_queue_retry(&self, id: u64) -> OfflineResult<Option<SyncQueueItem>> {
        self.collection::<SyncQueueItem>()
            .await?
            .update(id, |item| item.retry_count += 1)
    }

    // ==================== Retention ====================

    /// Delete synced records of `T` whose `syncedAt` is before `cutoff`
    pub async fn purge_synced_before<T: Record>(&self, cutoff: DateTime<Utc>) -> OfflineResult<usize> {
        self.collection::<T>().await?.purge_synced_before(cutoff)
    }

    // ==================== Auth Token ====================

    /// Replace the stored token. `created_at` and `device_id` are stamped here.
    pub async fn save_auth_token(&self, mut token: AuthToken) -> OfflineResult<AuthToken> {
        token.created_at = Utc::now();
        token.device_id = self.device_id().await?.to_string();

        let store = self.open().await?;
        let cf = auth_cf(&store.db)?;
        store
            .db
            .put_cf(cf, CURRENT_TOKEN_KEY.as_bytes(), serde_json::to_vec(&token)?)
            .map_err(|e| OfflineError::InternalError(format!("Failed to save auth token: {}", e)))?;

        tracing::info!("Stored auth token for user {}", token.user_id);
        Ok(token)
    }

    /// The current token, or `None` if absent, expired or unreadable.
    ///
    /// An expired or undecodable token record is deleted as a side effect.
    pub async fn get_auth_token(&self) -> OfflineResult<Option<AuthToken>> {
        let bytes = match self.read_token_bytes().await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let token: AuthToken = match serde_json::from_slice(&bytes) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Stored auth token is unreadable, removing it: {}", e);
                self.delete_auth_token().await?;
                return Ok(None);
            }
        };

        if token.is_expired() {
            tracing::info!("Auth token for user {} expired, removing it", token.user_id);
            self.delete_auth_token().await?;
            return Ok(None);
        }

        Ok(Some(token))
    }

    /// Raw read of the token record without expiry handling
    pub async fn peek_auth_token(&self) -> OfflineResult<Option<AuthToken>> {
        match self.read_token_bytes().await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read_token_bytes(&self) -> OfflineResult<Option<Vec<u8>>> {
        let store = self.open().await?;
        let cf = auth_cf(&store.db)?;
        Ok(store.db.get_cf(cf, CURRENT_TOKEN_KEY.as_bytes())?)
    }

    pub async fn delete_auth_token(&self) -> OfflineResult<()> {
        let store = self.open().await?;
        let cf = auth_cf(&store.db)?;
        store
            .db
            .delete_cf(cf, CURRENT_TOKEN_KEY.as_bytes())
            .map_err(|e| OfflineError::InternalError(format!("Failed to delete auth token: {}", e)))?;
        Ok(())
    }

    pub async fn is_token_valid(&self) -> OfflineResult<bool> {
        Ok(self.get_auth_token().await?.is_some())
    }

    // ==================== Whole Store ====================

    /// Wipe every collection in one atomic batch.
    ///
    /// Id sequences and the schema version in `_meta` survive.
    pub async fn clear_all_data(&self) -> OfflineResult<()> {
        let store = self.open().await?;
        let mut batch = WriteBatch::default();
        for name in schema::collections_for(SCHEMA_VERSION) {
            clear_collection_into(&store.db, name, &mut batch)?;
        }
        store
            .db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Failed to clear local data: {}", e)))?;

        tracing::info!("Cleared all local data");
        Ok(())
    }

    /// Unsynced counts per collection
    pub async fn get_storage_stats(&self) -> OfflineResult<StorageStats> {
        Ok(StorageStats {
            unsynced_quiz_results: self.collection::<QuizResult>().await?.count_unsynced()?,
            unsynced_game_progress: self.collection::<GameProgress>().await?.count_unsynced()?,
            unsynced_queue_items: self.collection::<SyncQueueItem>().await?.count_unsynced()?,
        })
    }

    /// Schema version recorded in the open database
    pub async fn schema_version(&self) -> OfflineResult<u32> {
        let store = self.open().await?;
        let meta = meta_cf(&store.db)?;
        Ok(store
            .db
            .get_cf(meta, SCHEMA_VERSION_KEY.as_bytes())?
            .map(|bytes| schema::decode_version(&bytes))
            .unwrap_or(0))
    }

    /// Flush memtables to disk
    pub async fn flush(&self) -> OfflineResult<()> {
        let store = self.open().await?;
        store
            .db
            .flush()
            .map_err(|e| OfflineError::InternalError(format!("Failed to flush: {}", e)))
    }
}

fn auth_cf(db: &DB) -> OfflineResult<&rocksdb::ColumnFamily> {
    db.cf_handle(AUTH_TOKENS)
        .ok_or_else(|| OfflineError::CollectionNotFound(AUTH_TOKENS.to_string()))
}

fn meta_cf(db: &DB) -> OfflineResult<&rocksdb::ColumnFamily> {
    db.cf_handle(META_CF)
        .ok_or_else(|| OfflineError::CollectionNotFound(META_CF.to_string()))
}

/// Open (or create) the database at `path` and bring its schema up to date
fn open_store(path: &Path) -> OfflineResult<OpenStore> {
    std::fs::create_dir_all(path).map_err(|e| {
        OfflineError::StorageUnavailable(format!("cannot create {}: {}", path.display(), e))
    })?;

    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    // Local buffers stay small; keep the WAL and info logs bounded
    opts.set_max_total_wal_size(8 * 1024 * 1024);
    opts.set_keep_log_file_num(3);

    // Existing column families (a newer schema may have added some we keep open)
    let mut cf_names = match DB::list_cf(&opts, path) {
        Ok(cfs) => cfs,
        Err(_) => vec!["default".to_string()],
    };
    for name in std::iter::once(META_CF).chain(schema::collections_for(SCHEMA_VERSION)) {
        if !cf_names.iter().any(|existing| existing == name) {
            cf_names.push(name.to_string());
        }
    }

    let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect();

    let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
        .map_err(|e| OfflineError::StorageUnavailable(format!("Failed to open RocksDB: {}", e)))?;

    let meta = meta_cf(&db)?;
    let stored_version = db
        .get_cf(meta, SCHEMA_VERSION_KEY.as_bytes())?
        .map(|bytes| schema::decode_version(&bytes))
        .unwrap_or(0);

    if stored_version > SCHEMA_VERSION {
        return Err(OfflineError::SchemaTooNew {
            found: stored_version,
            supported: SCHEMA_VERSION,
        });
    }
    if stored_version < SCHEMA_VERSION {
        let added = schema::collections_added_between(stored_version, SCHEMA_VERSION);
        tracing::info!(
            "Upgraded local schema from v{} to v{} (added: {})",
            stored_version,
            SCHEMA_VERSION,
            added.join(", ")
        );
        db.put_cf(meta, SCHEMA_VERSION_KEY.as_bytes(), SCHEMA_VERSION.to_string().as_bytes())?;
    }

    let mut writers = HashMap::new();
    for name in schema::record_collections() {
        let last_id = db
            .get_cf(meta, Collection::<QuizResult>::seq_key(name))?
            .and_then(|bytes| String::from_utf8_lossy(&bytes).parse::<u64>().ok())
            .unwrap_or(0);
        writers.insert(name, Arc::new(Mutex::new(last_id)));
    }

    tracing::debug!("Opened local store at {}", path.display());
    Ok(OpenStore {
        db: Arc::new(db),
        writers,
    })
}
