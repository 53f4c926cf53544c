pub mod auth;
pub mod collection;
pub mod engine;
pub mod record;
pub mod schema;

pub use auth::{AuthToken, DeviceId};
pub use collection::Collection;
pub use engine::{LocalStore, StorageStats};
pub use record::{Difficulty, GameProgress, QuizResult, Record, RecordMeta, SyncQueueItem};
