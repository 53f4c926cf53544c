use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, WriteBatch, DB};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use super::record::Record;
use super::schema::META_CF;
use crate::error::{OfflineError, OfflineResult};

/// Key prefixes for different data types
const DOC_PREFIX: &str = "doc:";
const UNSYNCED_PREFIX: &str = "idx:synced:0:"; // (createdAt, id) -> id
const SYNCED_PREFIX: &str = "idx:synced:1:"; // (syncedAt, id) -> id
const USER_INDEX: &str = "user";
const SEQ_PREFIX: &str = "seq:"; // per-collection id sequence, in META_CF

/// Typed handle on one record collection (column family).
///
/// Writes within a collection are serialized through `writer`, which also
/// holds the last id handed out. Every mutation touching more than one key is
/// a single `WriteBatch`.
pub struct Collection<T: Record> {
    pub name: &'static str,
    db: Arc<DB>,
    writer: Arc<Mutex<u64>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            db: self.db.clone(),
            writer: self.writer.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: Record> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish()
    }
}

impl<T: Record> Collection<T> {
    pub(crate) fn new(db: Arc<DB>, writer: Arc<Mutex<u64>>) -> Self {
        Self {
            name: T::COLLECTION,
            db,
            writer,
            _record: PhantomData,
        }
    }

    /// Key under which the collection's id sequence is persisted
    pub(crate) fn seq_key(name: &str) -> Vec<u8> {
        format!("{}{}", SEQ_PREFIX, name).into_bytes()
    }

    fn doc_key(id: u64) -> Vec<u8> {
        format!("{}{:020}", DOC_PREFIX, id).into_bytes()
    }

    fn unsynced_key(created_at: i64, id: u64) -> Vec<u8> {
        format!("{}{:020}:{:020}", UNSYNCED_PREFIX, created_at.max(0), id).into_bytes()
    }

    fn synced_key(synced_at: &DateTime<Utc>, id: u64) -> Vec<u8> {
        format!(
            "{}{:020}:{:020}",
            SYNCED_PREFIX,
            synced_at.timestamp_millis().max(0),
            id
        )
        .into_bytes()
    }

    /// Index prefix for all records with `value` in index `index_name`
    fn index_prefix(index_name: &str, value: &str) -> String {
        format!("idx:{}:{}:", index_name, hex::encode(value.as_bytes()))
    }

    fn index_key(index_name: &str, value: &str, id: u64) -> Vec<u8> {
        format!("{}{:020}", Self::index_prefix(index_name, value), id).into_bytes()
    }

    /// Every index entry pointing at this record, in its current state
    fn index_keys(record: &T) -> Vec<Vec<u8>> {
        let meta = record.meta();
        let mut keys = Vec::with_capacity(4);
        match (&meta.synced, &meta.synced_at) {
            (true, Some(at)) => keys.push(Self::synced_key(at, meta.id)),
            (true, None) => keys.push(Self::synced_key(&DateTime::<Utc>::default(), meta.id)),
            (false, _) => keys.push(Self::unsynced_key(meta.created_at, meta.id)),
        }
        if let Some(user_id) = record.user_id() {
            keys.push(Self::index_key(USER_INDEX, user_id, meta.id));
        }
        if let Some((name, value)) = record.secondary_index() {
            keys.push(Self::index_key(name, value, meta.id));
        }
        keys
    }

    fn cf(&self) -> OfflineResult<&ColumnFamily> {
        self.db
            .cf_handle(self.name)
            .ok_or_else(|| OfflineError::CollectionNotFound(self.name.to_string()))
    }

    fn meta_cf(&self) -> OfflineResult<&ColumnFamily> {
        self.db
            .cf_handle(META_CF)
            .ok_or_else(|| OfflineError::CollectionNotFound(META_CF.to_string()))
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, u64> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Collect the ids referenced by every index entry under `prefix`
    fn ids_with_prefix(&self, prefix: &[u8]) -> OfflineResult<Vec<u64>> {
        let cf = self.cf()?;
        let mut ids = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&value)
                .parse::<u64>()
                .map_err(|e| OfflineError::InternalError(format!("Corrupted index entry: {}", e)))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn load_many(&self, ids: &[u64]) -> OfflineResult<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cf = self.cf()?;
        let keys: Vec<Vec<u8>> = ids.iter().map(|id| Self::doc_key(*id)).collect();
        let results = self.db.multi_get_cf(keys.iter().map(|k| (cf, k.as_slice())));

        let mut records = Vec::with_capacity(ids.len());
        for result in results {
            if let Some(bytes) = result? {
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }

    fn write_record(&self, batch: &mut WriteBatch, record: &T) -> OfflineResult<()> {
        let cf = self.cf()?;
        let id = record.meta().id;
        batch.put_cf(cf, Self::doc_key(id), serde_json::to_vec(record)?);
        for key in Self::index_keys(record) {
            batch.put_cf(cf, key, id.to_string().as_bytes());
        }
        Ok(())
    }

    fn erase_record(&self, batch: &mut WriteBatch, record: &T) -> OfflineResult<()> {
        let cf = self.cf()?;
        batch.delete_cf(cf, Self::doc_key(record.meta().id));
        for key in Self::index_keys(record) {
            batch.delete_cf(cf, key);
        }
        Ok(())
    }

    // ==================== Record Operations ====================

    /// Insert a new record. The store assigns `id` and `createdAt` and always
    /// starts the record unsynced; whatever the caller put there is ignored.
    pub fn insert(&self, mut record: T) -> OfflineResult<T> {
        record.validate()?;

        let mut last_id = self.lock_writer();
        let id = *last_id + 1;
        {
            let meta = record.meta_mut();
            meta.id = id;
            meta.synced = false;
            meta.synced_at = None;
            meta.created_at = Utc::now().timestamp_millis();
        }

        let mut batch = WriteBatch::default();
        self.write_record(&mut batch, &record)?;
        batch.put_cf(self.meta_cf()?, Self::seq_key(self.name), id.to_string().as_bytes());
        self.db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Failed to insert record: {}", e)))?;

        *last_id = id;
        Ok(record)
    }

    /// Get a record by id
    pub fn get(&self, id: u64) -> OfflineResult<Option<T>> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, Self::doc_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All unsynced records, oldest first, read through the unsynced index
    pub fn unsynced(&self) -> OfflineResult<Vec<T>> {
        let ids = self.ids_with_prefix(UNSYNCED_PREFIX.as_bytes())?;
        self.load_many(&ids)
    }

    /// Number of unsynced records (index scan only, no document reads)
    pub fn count_unsynced(&self) -> OfflineResult<usize> {
        let cf = self.cf()?;
        let prefix = UNSYNCED_PREFIX.as_bytes();
        let mut count = 0;
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Total number of records
    pub fn count(&self) -> OfflineResult<usize> {
        let cf = self.cf()?;
        let prefix = DOC_PREFIX.as_bytes();
        let mut count = 0;
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Records owned by `user_id`
    pub fn by_user(&self, user_id: &str) -> OfflineResult<Vec<T>> {
        let prefix = Self::index_prefix(USER_INDEX, user_id);
        let ids = self.ids_with_prefix(prefix.as_bytes())?;
        self.load_many(&ids)
    }

    /// Records whose collection-specific index (quiz id, game id, queue type) equals `value`
    pub fn by_secondary(&self, index_name: &str, value: &str) -> OfflineResult<Vec<T>> {
        let prefix = Self::index_prefix(index_name, value);
        let ids = self.ids_with_prefix(prefix.as_bytes())?;
        self.load_many(&ids)
    }

    /// Mark a record synced now. Returns `None` if the id no longer exists.
    pub fn mark_synced(&self, id: u64) -> OfflineResult<Option<T>> {
        self.mark_synced_at(id, Utc::now())
    }

    /// Mark a record synced with an explicit timestamp.
    ///
    /// A record that is already synced is returned unchanged.
    pub fn mark_synced_at(&self, id: u64, at: DateTime<Utc>) -> OfflineResult<Option<T>> {
        let _guard = self.lock_writer();
        let old = match self.get(id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if old.meta().synced {
            return Ok(Some(old));
        }

        let mut record = old.clone();
        {
            let meta = record.meta_mut();
            meta.synced = true;
            meta.synced_at = Some(at);
        }

        let mut batch = WriteBatch::default();
        self.erase_record(&mut batch, &old)?;
        self.write_record(&mut batch, &record)?;
        self.db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Failed to mark record synced: {}", e)))?;

        Ok(Some(record))
    }

    /// Apply `change` to an unsynced record and re-index it.
    ///
    /// Bookkeeping fields are restored after `change` runs. Synced records
    /// are immutable and yield `InvalidRecord`.
    pub fn update<F>(&self, id: u64, change: F) -> OfflineResult<Option<T>>
    where
        F: FnOnce(&mut T),
    {
        let _guard = self.lock_writer();
        let old = match self.get(id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        if old.meta().synced {
            return Err(OfflineError::InvalidRecord(format!(
                "record {} in '{}' is already synced",
                id, self.name
            )));
        }

        let mut record = old.clone();
        change(&mut record);
        *record.meta_mut() = old.meta().clone();
        record.validate()?;

        let mut batch = WriteBatch::default();
        self.erase_record(&mut batch, &old)?;
        self.write_record(&mut batch, &record)?;
        self.db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Failed to update record: {}", e)))?;

        Ok(Some(record))
    }

    /// Delete a record and its index entries. Returns whether it existed.
    pub fn delete(&self, id: u64) -> OfflineResult<bool> {
        let _guard = self.lock_writer();
        let record = match self.get(id)? {
            Some(record) => record,
            None => return Ok(false),
        };
        let mut batch = WriteBatch::default();
        self.erase_record(&mut batch, &record)?;
        self.db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Failed to delete record: {}", e)))?;
        Ok(true)
    }

    /// Delete every synced record whose `syncedAt` is strictly before `cutoff`.
    ///
    /// The synced index is ordered by `syncedAt`, so this only walks the
    /// expired range. Returns the number of records deleted.
    pub fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> OfflineResult<usize> {
        let _guard = self.lock_writer();
        let cf = self.cf()?;
        let prefix = SYNCED_PREFIX.as_bytes();
        let end_key = format!("{}{:020}", SYNCED_PREFIX, cutoff.timestamp_millis().max(0));

        let mut expired = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, prefix) {
            let (key, value) = item?;
            if !key.starts_with(prefix) || key.as_ref() >= end_key.as_bytes() {
                break;
            }
            if let Ok(id) = String::from_utf8_lossy(&value).parse::<u64>() {
                expired.push(id);
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let records = self.load_many(&expired)?;
        let mut batch = WriteBatch::default();
        for record in &records {
            self.erase_record(&mut batch, record)?;
        }
        self.db
            .write(batch)
            .map_err(|e| OfflineError::InternalError(format!("Retention purge failed: {}", e)))?;

        Ok(records.len())
    }
}

/// Add a full wipe of collection `name` to `batch`
pub(crate) fn clear_collection_into(
    db: &DB,
    name: &str,
    batch: &mut WriteBatch,
) -> OfflineResult<()> {
    let cf = db
        .cf_handle(name)
        .ok_or_else(|| OfflineError::CollectionNotFound(name.to_string()))?;
    let from: &[u8] = &[];
    let to: &[u8] = &[0xff];
    batch.delete_range_cf(cf, from, to);
    Ok(())
}
