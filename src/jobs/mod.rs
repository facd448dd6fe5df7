//! Batch jobs: several videos submitted at once, then polled to completion
//!
//! The last submitted batch is kept on disk so `ycd batch status` can pick
//! it up again after a restart.

mod parser;
mod service;

pub use parser::{extract_video_id, parse_batch_input, ParsedBatch, MAX_BATCH_ITEMS};
pub use service::{BatchBackend, BatchOptions, BatchService, BatchSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ApiError;
use crate::billing::ActionKey;

/// What each item of a batch produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Transcript,
    Audio,
    Video,
}

impl ResultType {
    /// Quota bucket charged for one item
    pub fn action_key(&self, clean: bool) -> ActionKey {
        match self {
            Self::Transcript if clean => ActionKey::CleanTranscripts,
            Self::Transcript => ActionKey::UncleanTranscripts,
            Self::Audio => ActionKey::AudioDownloads,
            Self::Video => ActionKey::VideoDownloads,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one batch item, unknown values fail decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One video within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub id: Uuid,
    pub youtube_id: String,
    pub status: BatchItemStatus,
    pub result_type: ResultType,
    /// 0..=100
    pub progress: u8,
    #[serde(default)]
    pub result_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    pub fn queued(youtube_id: impl Into<String>, result_type: ResultType) -> Self {
        Self {
            id: Uuid::new_v4(),
            youtube_id: youtube_id.into(),
            status: BatchItemStatus::Queued,
            result_type,
            progress: 0,
            result_refs: Vec::new(),
            error: None,
        }
    }

    fn apply(&mut self, update: &BatchItemPayload) {
        self.status = update.status;
        self.progress = match (update.status, update.progress) {
            (BatchItemStatus::Completed, _) => 100,
            (_, Some(progress)) => progress.min(100),
            (_, None) => self.progress,
        };
        if !update.result_refs.is_empty() {
            self.result_refs = update.result_refs.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
    }
}

/// Job-level status reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// A submitted batch and the latest state of its items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub job_id: String,
    pub result_type: ResultType,
    #[serde(default)]
    pub clean: bool,
    pub items: Vec<BatchItem>,
    /// Used count of the charged action right before submission
    #[serde(default)]
    pub usage_before: u64,
    pub submitted_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchJob {
    pub fn new(
        job_id: impl Into<String>,
        result_type: ResultType,
        clean: bool,
        youtube_ids: &[String],
        usage_before: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            result_type,
            clean,
            items: youtube_ids
                .iter()
                .map(|id| BatchItem::queued(id.clone(), result_type))
                .collect(),
            usage_before,
            submitted_at: now,
            last_updated_at: now,
            error: None,
        }
    }

    pub fn action_key(&self) -> ActionKey {
        self.result_type.action_key(self.clean)
    }

    /// Merge a status payload into the items, matched by video id
    pub fn apply(&mut self, payload: &BatchJobPayload) {
        for update in &payload.items {
            match self
                .items
                .iter_mut()
                .find(|item| item.youtube_id == update.youtube_id)
            {
                Some(item) => item.apply(update),
                None => debug!(
                    job_id = %self.job_id,
                    youtube_id = %update.youtube_id,
                    "Ignoring status for an item not in this batch"
                ),
            }
        }

        if payload.error.is_some() {
            self.error = payload.error.clone();
        }

        // A failed job leaves nothing running
        if payload.status == Some(BatchJobStatus::Failed) {
            for item in self.items.iter_mut().filter(|i| !i.status.is_terminal()) {
                item.status = BatchItemStatus::Failed;
                item.error = item.error.take().or_else(|| self.error.clone());
            }
        }

        self.last_updated_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }

    pub fn count(&self, status: BatchItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    /// Mean progress over all items
    pub fn progress(&self) -> u8 {
        if self.items.is_empty() {
            return 100;
        }
        let total: usize = self.items.iter().map(|item| item.progress as usize).sum();
        (total / self.items.len()) as u8
    }
}

/// `POST /batch/submit` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSubmitRequest {
    pub video_ids: Vec<String>,
    pub result_type: ResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchSubmitResponse {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<BatchJobStatus>,
}

/// `GET /batch/jobs/{id}` body
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchJobPayload {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<BatchJobStatus>,
    #[serde(default)]
    pub items: Vec<BatchItemPayload>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchItemPayload {
    #[serde(alias = "video_id")]
    pub youtube_id: String,
    pub status: BatchItemStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default, alias = "results")]
    pub result_refs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("No video ids to submit")]
    Empty,

    #[error("Too many videos in one batch: {count} (max {max})")]
    TooManyItems { count: usize, max: usize },

    #[error("{0}")]
    LimitReached(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Batch polling cancelled")]
    Cancelled,

    #[error("Batch {job_id} still running after {polls} polls")]
    PollTimeout { job_id: String, polls: u32 },

    #[error("Failed to persist batch job: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Failed to encode batch job: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Batch persistence
pub struct BatchJobManager {
    path: PathBuf,
}

impl BatchJobManager {
    /// `<config dir>/ycd/batch_job.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ycd").join("batch_job.json"))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, job: &BatchJob) -> Result<(), BatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(job)?;
        fs::write(&self.path, json)?;
        debug!(job_id = %job.job_id, finished = job.is_finished(), "Saved batch job");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<BatchJob>, BatchError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<BatchJob>(&json) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Discarding unreadable batch job file");
                Ok(None)
            }
        }
    }

    /// The saved batch, if it was still running when the process exited
    pub fn load_unfinished(&self) -> Result<Option<BatchJob>, BatchError> {
        Ok(self.load()?.filter(|job| !job.is_finished()))
    }

    pub fn clear(&self) -> Result<(), BatchError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            info!("Cleared saved batch job");
        }
        Ok(())
    }
}
