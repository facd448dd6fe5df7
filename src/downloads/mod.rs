//! Metered downloads
//!
//! One download runs: gate, remember the used count, ask the backend, fall
//! back to the local helper when told to, then reconcile the counter.

mod helper;

pub use helper::{HelperClient, HelperError, HelperRunRequest, HelperRunResponse, HELPER_URL};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError};
use crate::billing::{ActionKey, ReconcileOptions, SubscriptionStore, UsageReconciler};
use crate::cancel::CancelFlag;
use crate::http_client::api_client;
use crate::jobs::extract_video_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Transcript,
    Audio,
    Video,
}

impl DownloadKind {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Transcript => "/download_transcript/",
            Self::Audio => "/download_audio/",
            Self::Video => "/download_video/",
        }
    }

    /// Quota bucket this download is charged to
    pub fn action_key(&self, clean: bool) -> ActionKey {
        match self {
            Self::Transcript if clean => ActionKey::CleanTranscripts,
            Self::Transcript => ActionKey::UncleanTranscripts,
            Self::Audio => ActionKey::AudioDownloads,
            Self::Video => ActionKey::VideoDownloads,
        }
    }

    fn default_extension(&self) -> &'static str {
        match self {
            Self::Transcript => "txt",
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }
}

impl std::fmt::Display for DownloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Transcript => "transcript",
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Body for the `/download_*/` endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadRequest {
    pub youtube_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

/// Raw `/download_*/` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadPayload {
    #[serde(default)]
    pub needs_local_helper: bool,
    #[serde(default)]
    pub helper: Option<Map<String, serde_json::Value>>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A download response, classified once at the boundary
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEnvelope {
    /// The backend could not fetch the video, the local helper must
    NeedsHelper {
        request: HelperRunRequest,
        message: Option<String>,
    },
    Transcript {
        text: String,
        file_name: Option<String>,
    },
    File {
        url: String,
        file_name: Option<String>,
    },
}

impl DownloadEnvelope {
    pub fn from_payload(
        payload: DownloadPayload,
        kind: DownloadKind,
        request: &DownloadRequest,
    ) -> Result<Self, ApiError> {
        if payload.needs_local_helper {
            return Ok(Self::NeedsHelper {
                request: HelperRunRequest {
                    youtube_id: request.youtube_id.clone(),
                    kind,
                    format: request.format.clone(),
                    quality: request.quality.clone(),
                    extra: payload.helper.unwrap_or_default(),
                },
                message: payload.message,
            });
        }

        match (kind, payload.transcript, payload.download_url) {
            (DownloadKind::Transcript, Some(text), _) => Ok(Self::Transcript {
                text,
                file_name: payload.file_name,
            }),
            (_, _, Some(url)) => Ok(Self::File {
                url,
                file_name: payload.file_name,
            }),
            _ => Err(ApiError::Decode(format!(
                "{} response carries neither a result nor a helper request",
                kind
            ))),
        }
    }
}

/// What a finished download produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Transcript {
        text: String,
        file_name: String,
    },
    /// Ready to fetch from the backend
    Remote {
        url: String,
        file_name: String,
    },
    /// Saved on this machine by the helper
    Helper {
        path: Option<String>,
        file_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub youtube_id: String,
    pub kind: DownloadKind,
    pub outcome: DownloadOutcome,
    /// Whether the usage counter was seen going up afterwards
    pub usage_confirmed: bool,
}

/// Per-call download settings
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub clean: bool,
    pub format: Option<String>,
    pub quality: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Not a YouTube link or video id: {0}")]
    InvalidVideo(String),

    #[error("{0}")]
    LimitReached(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Helper(#[from] HelperError),

    #[error("Failed to fetch file: {0}")]
    Transfer(#[from] reqwest::Error),

    #[error("Failed to save file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DownloadService {
    api: Arc<ApiClient>,
    helper: HelperClient,
    store: Arc<SubscriptionStore>,
    reconciler: UsageReconciler,
    reconcile: ReconcileOptions,
}

impl DownloadService {
    pub fn new(api: Arc<ApiClient>, helper: HelperClient, store: Arc<SubscriptionStore>) -> Self {
        Self {
            api,
            helper,
            reconciler: UsageReconciler::new(store.clone()),
            store,
            reconcile: ReconcileOptions::default(),
        }
    }

    pub fn with_reconcile(mut self, options: ReconcileOptions) -> Self {
        self.reconcile = options;
        self
    }

    /// Run one metered download for a URL or bare video id
    pub async fn download(
        &self,
        kind: DownloadKind,
        input: &str,
        options: &DownloadOptions,
        cancel: &CancelFlag,
    ) -> Result<DownloadReport, DownloadError> {
        let youtube_id =
            extract_video_id(input).ok_or_else(|| DownloadError::InvalidVideo(input.trim().to_string()))?;

        if self.store.snapshot().fetched_at.is_none() {
            if let Err(e) = self.store.refresh(false).await {
                debug!(error = %e, "Could not load subscription status before download");
            }
        }

        let action = kind.action_key(options.clean);
        let decision = self.store.can_proceed(action, 1);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "Usage limit reached".to_string());
            return Err(DownloadError::LimitReached(reason));
        }
        let before_used = self.store.snapshot().used(action);

        let request = DownloadRequest {
            youtube_id: youtube_id.clone(),
            clean: (kind == DownloadKind::Transcript).then_some(options.clean),
            format: options.format.clone(),
            quality: options.quality.clone(),
        };
        let payload = self.api.download(kind, &request).await?;
        let default_name = format!("{}.{}", youtube_id, kind.default_extension());

        let outcome = match DownloadEnvelope::from_payload(payload, kind, &request)? {
            DownloadEnvelope::NeedsHelper { request, message } => {
                info!(
                    youtube_id = %youtube_id,
                    reason = message.as_deref().unwrap_or("-"),
                    "Backend asked for the local helper"
                );
                let result = self.helper.run(&request).await?;
                DownloadOutcome::Helper {
                    path: result.path,
                    file_name: result.file_name,
                }
            }
            DownloadEnvelope::Transcript { text, file_name } => DownloadOutcome::Transcript {
                text,
                file_name: file_name.unwrap_or(default_name),
            },
            DownloadEnvelope::File { url, file_name } => DownloadOutcome::Remote {
                url: self.absolute_url(&url),
                file_name: file_name.unwrap_or(default_name),
            },
        };

        let usage_confirmed = self
            .reconciler
            .reconcile(action, before_used, self.reconcile, cancel)
            .await;

        info!(youtube_id = %youtube_id, kind = %kind, usage_confirmed, "Download finished");
        Ok(DownloadReport {
            youtube_id,
            kind,
            outcome,
            usage_confirmed,
        })
    }

    /// Write the result into `dir`, returns the saved path
    pub async fn save(&self, outcome: &DownloadOutcome, dir: &Path) -> Result<PathBuf, DownloadError> {
        match outcome {
            DownloadOutcome::Transcript { text, file_name } => {
                let path = dir.join(safe_file_name(file_name));
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::write(&path, text).await?;
                Ok(path)
            }
            DownloadOutcome::Remote { url, file_name } => {
                let path = dir.join(safe_file_name(file_name));
                tokio::fs::create_dir_all(dir).await?;
                let mut request = api_client().get(url);
                if let Some(token) = self.api.session().token() {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await?.error_for_status()?;

                let mut file = tokio::fs::File::create(&path).await?;
                let mut stream = response.bytes_stream();
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    written += chunk.len() as u64;
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                debug!(path = %path.display(), bytes = written, "Saved download");
                Ok(path)
            }
            DownloadOutcome::Helper { path, file_name } => Ok(path
                .as_deref()
                .map(PathBuf::from)
                .or_else(|| file_name.as_deref().map(|n| dir.join(safe_file_name(n))))
                .unwrap_or_else(|| dir.to_path_buf())),
        }
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.api.base_url(), url.trim_start_matches('/'))
        }
    }
}

/// Keep only the last path component of a server-supplied name
fn safe_file_name(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or("download")
        .to_string()
}
