use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{OfflineError, OfflineResult};

/// Fixed key of the single token record
pub(crate) const CURRENT_TOKEN_KEY: &str = "current";

/// File holding the device identifier, next to the database directory
pub const DEVICE_ID_FILE: &str = "device_id";

/// The device's current session credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthToken {
    /// Opaque bearer token
    pub token: String,
    pub user_id: String,
    /// Profile snapshot used to log in while offline
    #[serde(default)]
    pub user: Value,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub device_id: String,
}

impl AuthToken {
    /// A token as returned by a login. `created_at` and `device_id` are
    /// stamped by the store when it is saved.
    pub fn new(
        token: impl Into<String>,
        user_id: impl Into<String>,
        user: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            user,
            expires_at,
            created_at: Utc::now(),
            device_id: String::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Stable per-device random identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId(String);

impl DeviceId {
    /// Read the identifier from `dir`, creating and persisting a new one on first use
    pub fn load_or_create(dir: &Path) -> OfflineResult<Self> {
        let path = Self::path_in(dir);
        match std::fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => {
                return Ok(Self(contents.trim().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OfflineError::IoError(e)),
        }

        std::fs::create_dir_all(dir)?;
        let id = uuid::Uuid::new_v4().to_string();
        std::fs::write(&path, &id)?;
        tracing::info!("Generated new device id {}", id);
        Ok(Self(id))
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(DEVICE_ID_FILE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
