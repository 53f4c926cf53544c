use thiserror::Error;

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Stored schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Authentication expired (HTTP {0})")]
    AuthExpired(u16),

    #[error("Server rejected submission with HTTP {status}: {message}")]
    ServerRejected { status: u16, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type OfflineResult<T> = Result<T, OfflineError>;

impl OfflineError {
    /// Errors that mean the device lost its durable fallback for this session
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, OfflineError::StorageUnavailable(_))
    }

    /// Errors that leave the record unsynced for the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfflineError::TransportFailure(_) | OfflineError::ServerRejected { .. }
        )
    }
}

impl serde::Serialize for OfflineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<rocksdb::Error> for OfflineError {
    fn from(err: rocksdb::Error) -> Self {
        OfflineError::InternalError(err.into_string())
    }
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        OfflineError::TransportFailure(err.to_string())
    }
}
