use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    BatchError, BatchItemStatus, BatchJob, BatchJobManager, BatchJobPayload, BatchSubmitRequest,
    BatchSubmitResponse, ResultType, MAX_BATCH_ITEMS,
};
use crate::api::{ApiClient, ApiError};
use crate::billing::{ReconcileOptions, SubscriptionStore, UsageReconciler};
use crate::cancel::CancelFlag;

/// Backend calls the batch flow needs
#[async_trait]
pub trait BatchBackend: Send + Sync {
    async fn submit_batch(&self, request: &BatchSubmitRequest) -> Result<BatchSubmitResponse, ApiError>;
    async fn batch_job(&self, job_id: &str) -> Result<BatchJobPayload, ApiError>;
}

#[async_trait]
impl BatchBackend for ApiClient {
    async fn submit_batch(&self, request: &BatchSubmitRequest) -> Result<BatchSubmitResponse, ApiError> {
        ApiClient::submit_batch(self, request).await
    }

    async fn batch_job(&self, job_id: &str) -> Result<BatchJobPayload, ApiError> {
        ApiClient::batch_job(self, job_id).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub reconcile: ReconcileOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            max_polls: 400,
            reconcile: ReconcileOptions::default(),
        }
    }
}

/// Outcome of a batch that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    /// Whether the store showed the usage increase afterwards
    pub usage_confirmed: bool,
}

pub struct BatchService {
    backend: Arc<dyn BatchBackend>,
    store: Arc<SubscriptionStore>,
    reconciler: UsageReconciler,
    jobs: BatchJobManager,
    options: BatchOptions,
}

impl BatchService {
    pub fn new(
        backend: Arc<dyn BatchBackend>,
        store: Arc<SubscriptionStore>,
        jobs: BatchJobManager,
        options: BatchOptions,
    ) -> Self {
        Self {
            backend,
            reconciler: UsageReconciler::new(store.clone()),
            store,
            jobs,
            options,
        }
    }

    pub fn jobs(&self) -> &BatchJobManager {
        &self.jobs
    }

    /// Gate and submit a batch, one quota unit per video
    pub async fn submit(
        &self,
        youtube_ids: Vec<String>,
        result_type: ResultType,
        clean: bool,
    ) -> Result<BatchJob, BatchError> {
        if youtube_ids.is_empty() {
            return Err(BatchError::Empty);
        }
        if youtube_ids.len() > MAX_BATCH_ITEMS {
            return Err(BatchError::TooManyItems {
                count: youtube_ids.len(),
                max: MAX_BATCH_ITEMS,
            });
        }

        if self.store.snapshot().fetched_at.is_none() {
            if let Err(e) = self.store.refresh(false).await {
                debug!(error = %e, "Could not load subscription status before batch submit");
            }
        }

        let action = result_type.action_key(clean);
        let decision = self.store.can_proceed(action, youtube_ids.len() as u64);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "Usage limit reached".to_string());
            return Err(BatchError::LimitReached(reason));
        }
        let usage_before = self.store.snapshot().used(action);

        let request = BatchSubmitRequest {
            video_ids: youtube_ids.clone(),
            result_type,
            clean: (result_type == ResultType::Transcript).then_some(clean),
        };
        let response = self.backend.submit_batch(&request).await?;

        let job = BatchJob::new(response.job_id, result_type, clean, &youtube_ids, usage_before);
        self.jobs.save(&job)?;
        info!(
            job_id = %job.job_id,
            items = job.items.len(),
            result_type = %result_type,
            "Batch submitted"
        );
        Ok(job)
    }

    /// Poll the job until every item is terminal
    ///
    /// `on_update` sees the job after each merged status. Cancelling stops
    /// the loop before the next request. Transient errors only cost a poll,
    /// a 401 ends it.
    pub async fn poll_until_done<F>(
        &self,
        job: &mut BatchJob,
        cancel: &CancelFlag,
        mut on_update: F,
    ) -> Result<BatchSummary, BatchError>
    where
        F: FnMut(&BatchJob),
    {
        let mut polls = 0;
        while !job.is_finished() {
            if polls >= self.options.max_polls {
                warn!(job_id = %job.job_id, polls, "Giving up on batch polling");
                return Err(BatchError::PollTimeout {
                    job_id: job.job_id.clone(),
                    polls,
                });
            }
            if polls > 0 {
                tokio::time::sleep(self.options.poll_interval).await;
            }
            if cancel.is_cancelled() {
                debug!(job_id = %job.job_id, polls, "Batch polling cancelled");
                return Err(BatchError::Cancelled);
            }

            polls += 1;
            match self.backend.batch_job(&job.job_id).await {
                Ok(payload) => {
                    job.apply(&payload);
                    self.jobs.save(job)?;
                    on_update(job);
                }
                Err(ApiError::Unauthorized) => return Err(ApiError::Unauthorized.into()),
                Err(e) => warn!(job_id = %job.job_id, poll = polls, error = %e, "Batch status poll failed"),
            }
        }

        let completed = job.count(BatchItemStatus::Completed);
        let failed = job.count(BatchItemStatus::Failed);
        info!(job_id = %job.job_id, completed, failed, "Batch finished");

        let usage_confirmed = if completed > 0 {
            self.reconciler
                .reconcile(job.action_key(), job.usage_before, self.options.reconcile, cancel)
                .await
        } else {
            false
        };

        Ok(BatchSummary {
            completed,
            failed,
            usage_confirmed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::test_support::*;
    use crate::billing::{ActionKey, Limit, StoreConfig, SubscriptionTier};
    use crate::jobs::{BatchItemPayload, BatchJobStatus};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        submitted: Mutex<Vec<BatchSubmitRequest>>,
        polls: AtomicU32,
        statuses: Mutex<VecDeque<Result<BatchJobPayload, ApiError>>>,
    }

    impl FakeBackend {
        fn push(&self, result: Result<BatchJobPayload, ApiError>) {
            self.statuses.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl BatchBackend for FakeBackend {
        async fn submit_batch(&self, request: &BatchSubmitRequest) -> Result<BatchSubmitResponse, ApiError> {
            self.submitted.lock().unwrap().push(request.clone());
            Ok(BatchSubmitResponse {
                job_id: "job-1".to_string(),
                status: Some(BatchJobStatus::Queued),
            })
        }

        async fn batch_job(&self, job_id: &str) -> Result<BatchJobPayload, ApiError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(BatchJobPayload {
                        job_id: job_id.to_string(),
                        status: Some(BatchJobStatus::Processing),
                        items: Vec::new(),
                        error: None,
                    })
                })
        }
    }

    fn audio(used: u64, limit: u64) -> crate::billing::SubscriptionSnapshot {
        snapshot_with(
            SubscriptionTier::Free,
            &[(ActionKey::AudioDownloads, used, Limit::Count(limit))],
        )
    }

    fn payload(items: &[(&str, BatchItemStatus)]) -> BatchJobPayload {
        BatchJobPayload {
            job_id: "job-1".to_string(),
            status: None,
            items: items
                .iter()
                .map(|(id, status)| BatchItemPayload {
                    youtube_id: id.to_string(),
                    status: *status,
                    progress: None,
                    result_refs: Vec::new(),
                    error: None,
                })
                .collect(),
            error: None,
        }
    }

    fn ids(n: usize) -> Vec<String> {
        ["dQw4w9WgXcQ", "9bZkp7q19f0", "kJQP7kiw5Fk"][..n]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        source: Arc<FakeSource>,
        service: BatchService,
        _dir: tempfile::TempDir,
    }

    async fn harness(snapshot: crate::billing::SubscriptionSnapshot) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let source = Arc::new(FakeSource::returning(snapshot));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());
        store.refresh(false).await.unwrap();
        let options = BatchOptions {
            poll_interval: Duration::from_secs(3),
            max_polls: 5,
            reconcile: ReconcileOptions {
                max_tries: 2,
                delay: Duration::from_millis(10),
            },
        };
        let service = BatchService::new(
            backend.clone(),
            store,
            BatchJobManager::new(dir.path().join("batch_job.json")),
            options,
        );
        Harness {
            backend,
            source,
            service,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_submit_is_gated_on_item_count() {
        let h = harness(audio(8, 10)).await;

        let err = h
            .service
            .submit(ids(3), ResultType::Audio, false)
            .await
            .unwrap_err();

        match err {
            BatchError::LimitReached(reason) => {
                assert_eq!(reason, "Insufficient audio downloads remaining: 2 left, requested 3")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(h.backend.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_and_oversized() {
        let h = harness(audio(0, 1000)).await;
        assert!(matches!(
            h.service.submit(Vec::new(), ResultType::Audio, false).await,
            Err(BatchError::Empty)
        ));

        let too_many: Vec<String> = (0..=MAX_BATCH_ITEMS).map(|i| format!("{i:011}")).collect();
        assert!(matches!(
            h.service.submit(too_many, ResultType::Audio, false).await,
            Err(BatchError::TooManyItems { count: 101, max: 100 })
        ));
    }

    #[tokio::test]
    async fn test_submit_creates_and_persists_job() {
        let h = harness(audio(1, 10)).await;

        let job = h
            .service
            .submit(ids(2), ResultType::Audio, true)
            .await
            .unwrap();

        assert_eq!(job.job_id, "job-1");
        assert_eq!(job.usage_before, 1);
        assert_eq!(job.items.len(), 2);
        let sent = h.backend.submitted.lock().unwrap()[0].clone();
        assert_eq!(sent.video_ids, ids(2));
        assert_eq!(sent.clean, None);
        assert_eq!(h.service.jobs().load().unwrap(), Some(job));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_done_then_reconciles() {
        let h = harness(audio(1, 10)).await;
        let mut job = h
            .service
            .submit(ids(2), ResultType::Audio, false)
            .await
            .unwrap();

        h.backend.push(Ok(payload(&[
            ("dQw4w9WgXcQ", BatchItemStatus::Processing),
            ("9bZkp7q19f0", BatchItemStatus::Queued),
        ])));
        h.backend.push(Err(ApiError::ServerBusy));
        h.backend.push(Ok(payload(&[
            ("dQw4w9WgXcQ", BatchItemStatus::Completed),
            ("9bZkp7q19f0", BatchItemStatus::Failed),
        ])));
        h.source.set_fallback(Ok(audio(2, 10)));

        let mut updates = 0;
        let summary = h
            .service
            .poll_until_done(&mut job, &CancelFlag::new(), |_| updates += 1)
            .await
            .unwrap();

        assert_eq!(h.backend.polls.load(Ordering::SeqCst), 3);
        assert_eq!(updates, 2);
        assert_eq!(
            summary,
            BatchSummary {
                completed: 1,
                failed: 1,
                usage_confirmed: true
            }
        );
        assert!(h.service.jobs().load_unfinished().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_max_polls() {
        let h = harness(audio(0, 10)).await;
        let mut job = h
            .service
            .submit(ids(1), ResultType::Audio, false)
            .await
            .unwrap();

        let err = h
            .service
            .poll_until_done(&mut job, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::PollTimeout { polls: 5, .. }));
        assert_eq!(h.backend.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let h = harness(audio(0, 10)).await;
        let mut job = h
            .service
            .submit(ids(1), ResultType::Audio, false)
            .await
            .unwrap();
        let cancel = CancelFlag::new();

        let err = h
            .service
            .poll_until_done(&mut job, &cancel, |_| cancel.cancel())
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Cancelled));
        assert_eq!(h.backend.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_ends_polling() {
        let h = harness(audio(0, 10)).await;
        let mut job = h
            .service
            .submit(ids(1), ResultType::Audio, false)
            .await
            .unwrap();
        h.backend.push(Err(ApiError::Unauthorized));

        let err = h
            .service
            .poll_until_done(&mut job, &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Api(ApiError::Unauthorized)));
        assert_eq!(h.backend.polls.load(Ordering::SeqCst), 1);
    }
}
