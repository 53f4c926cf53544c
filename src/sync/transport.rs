use std::time::Duration;

use serde_json::Value;

use super::protocol::{ApiResponse, ProgressApi, ProgressPayload};
use crate::error::{OfflineError, OfflineResult};

/// `ProgressApi` over HTTP with a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpProgressApi {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpProgressApi {
    /// `request_timeout` of `None` leaves requests unbounded
    pub fn new(
        base_url: &str,
        progress_path: &str,
        request_timeout: Option<Duration>,
    ) -> OfflineResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| OfflineError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url, progress_path))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, progress_path: &str) -> Self {
        Self {
            client,
            endpoint: join_url(base_url, progress_path),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[async_trait::async_trait]
impl ProgressApi for HttpProgressApi {
    async fn submit(&self, token: &str, payload: &ProgressPayload) -> OfflineResult<ApiResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        // Non-JSON bodies (proxies, HTML error pages) classify on status alone
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        tracing::debug!("POST {} -> {}", self.endpoint, status);
        Ok(ApiResponse::new(status, body))
    }
}
