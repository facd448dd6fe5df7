//! Local desktop helper call-out
//!
//! When the backend cannot fetch a video itself it answers with a
//! `needs_local_helper` envelope. The helper listens on loopback and does
//! the download on this machine.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::DownloadKind;
use crate::api::error_detail;
use crate::http_client::helper_client;

pub const HELPER_URL: &str = "http://127.0.0.1:17682/ycd-helper/run";

/// Body for `POST /ycd-helper/run`
///
/// Fields the backend adds to its envelope (signed urls, cookies) are kept
/// in `extra` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelperRunRequest {
    pub youtube_id: String,
    pub kind: DownloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HelperRunResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("YCD Desktop Helper is not running at {0}")]
    NotRunning(String),

    #[error("YCD Desktop Helper failed: {0}")]
    Failed(String),

    #[error("Invalid helper response: {0}")]
    Decode(String),
}

pub struct HelperClient {
    client: Client,
    url: String,
}

impl Default for HelperClient {
    fn default() -> Self {
        Self::new(HELPER_URL)
    }
}

impl HelperClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: helper_client().clone(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hand a download to the helper and wait for it to finish
    pub async fn run(&self, request: &HelperRunRequest) -> Result<HelperRunResponse, HelperError> {
        debug!(youtube_id = %request.youtube_id, kind = %request.kind, "Delegating download to local helper");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "Helper request failed");
                HelperError::NotRunning(self.url.clone())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HelperError::Decode(e.to_string()))?;

        if !status.is_success() {
            let message = error_detail(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(HelperError::Failed(message));
        }

        let result: HelperRunResponse =
            serde_json::from_str(&body).map_err(|e| HelperError::Decode(e.to_string()))?;
        if !result.ok {
            let message = result
                .error
                .clone()
                .unwrap_or_else(|| "helper reported failure".to_string());
            return Err(HelperError::Failed(message));
        }

        info!(
            youtube_id = %request.youtube_id,
            path = result.path.as_deref().unwrap_or("-"),
            "Local helper finished download"
        );
        Ok(result)
    }
}
