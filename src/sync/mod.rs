//! Synchronization of locally buffered results with the progress server
//!
//! This module provides:
//! - The submission wire format and reply classification (`protocol`)
//! - An HTTP transport behind the `ProgressApi` trait (`transport`)
//! - Connectivity tracking (`network`)
//! - The status/event bus (`events`)
//! - The single-flight synchronizer and its background worker (`worker`)

pub mod events;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod worker;

// Re-export key types
pub use events::{ListenerId, SyncEvent, SyncEventBus, SyncStatus};
pub use network::NetworkMonitor;
pub use protocol::{ApiResponse, ProgressApi, ProgressPayload, SubmitOutcome};
pub use transport::HttpProgressApi;
pub use worker::{
    create_command_channel, CycleOutcome, SkipReason, SyncCommand, SyncWorker, Synchronizer,
    WorkerConfig, WorkerHandle,
};
