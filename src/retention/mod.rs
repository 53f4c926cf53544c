use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::OfflineResult;
use crate::storage::{GameProgress, LocalStore, QuizResult, Record, SyncQueueItem};

/// How long synced records are kept before the sweep deletes them
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Retention sweep for records the server has already confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_RETENTION,
        }
    }
}

impl RetentionPolicy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    /// Records synced strictly before this instant are expired
    pub fn cutoff_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.max_age) {
            Ok(age) => now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC),
            Err(_) => DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Delete expired synced records from every record collection.
    ///
    /// A failure in one collection is logged and the others are still swept.
    /// Returns the total number of deleted records.
    pub async fn sweep(&self, store: &LocalStore) -> usize {
        self.sweep_at(store, Utc::now()).await
    }

    pub async fn sweep_at(&self, store: &LocalStore, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff_from(now);
        let mut total_deleted = 0;

        total_deleted += report::<QuizResult>(store.purge_synced_before::<QuizResult>(cutoff).await);
        total_deleted +=
            report::<GameProgress>(store.purge_synced_before::<GameProgress>(cutoff).await);
        total_deleted +=
            report::<SyncQueueItem>(store.purge_synced_before::<SyncQueueItem>(cutoff).await);

        if total_deleted > 0 {
            tracing::info!(
                "Retention sweep: deleted {} synced records older than {}",
                total_deleted,
                cutoff
            );
        }
        total_deleted
    }
}

fn report<T: Record>(result: OfflineResult<usize>) -> usize {
    match result {
        Ok(count) => {
            if count > 0 {
                tracing::debug!("Retention sweep: deleted {} from {}", count, T::COLLECTION);
            }
            count
        }
        Err(e) => {
            tracing::warn!("Retention sweep failed for {}: {}", T::COLLECTION, e);
            0
        }
    }
}
