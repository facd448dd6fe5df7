//! Subscription status store
//!
//! Holds the latest `SubscriptionSnapshot` and keeps it fresh:
//! - one refresh in flight at a time, overlapping callers join it
//! - consecutive failures tracked in `RefreshState`, capped by a circuit breaker
//! - 401 signs the user out and wipes the snapshot
//! - an overdue reset triggers one extra `sync=1` fetch
//! - a background poller on a fixed interval plus focus/visibility nudges

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::limits::ActionGate;
use super::types::{ActionKey, DenialReason, GateDecision, SubscriptionSnapshot};
use crate::api::ApiError;
use crate::auth::SessionStore;

/// Helper to acquire a mutex with poison recovery
fn acquire_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned: PoisonError<MutexGuard<'_, T>>| {
        warn!("Mutex was poisoned, recovering inner value");
        poisoned.into_inner()
    })
}

/// Where subscription snapshots come from
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Fetch the current status, `sync` asks the backend to roll counters over first
    async fn fetch_status(&self, sync: bool) -> Result<SubscriptionSnapshot, ApiError>;
}

/// Refresh state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    InFlight,
    /// `n` consecutive refreshes have failed
    Backoff(u32),
}

impl RefreshState {
    pub fn consecutive_failures(&self) -> u32 {
        match self {
            Self::Backoff(n) => *n,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Session expired, please sign in again")]
    Unauthorized,

    #[error("Subscription refresh paused after {failures} consecutive failures")]
    CircuitOpen { failures: u32 },

    #[error(transparent)]
    Api(ApiError),
}

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub poll_interval: Duration,
    pub max_failed_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_failed_attempts: 30,
        }
    }
}

type RefreshResult = Result<SubscriptionSnapshot, SubscriptionError>;

/// Owner of the subscription snapshot
pub struct SubscriptionStore {
    source: Arc<dyn SubscriptionSource>,
    session: Arc<SessionStore>,
    config: StoreConfig,
    gate: ActionGate,
    snapshot: watch::Sender<SubscriptionSnapshot>,
    state: Mutex<RefreshState>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped after every completed refresh
    generation: AtomicU64,
    /// Outcome of the latest refresh and whether it asked for `sync=1`
    last_result: Mutex<Option<(bool, RefreshResult)>>,
    wake: Notify,
}

impl SubscriptionStore {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        session: Arc<SessionStore>,
        config: StoreConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SubscriptionSnapshot::default());
        Self {
            source,
            session,
            config,
            gate: ActionGate::new(),
            snapshot,
            state: Mutex::new(RefreshState::Idle),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            last_result: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current snapshot (cloned)
    ///
    /// Empty once the session is gone, whichever call dropped it.
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        self.discard_if_signed_out();
        self.snapshot.borrow().clone()
    }

    /// Watch snapshot replacements
    pub fn subscribe(&self) -> watch::Receiver<SubscriptionSnapshot> {
        self.discard_if_signed_out();
        self.snapshot.subscribe()
    }

    /// A 401 on any endpoint clears the session, the entitlements go with it
    fn discard_if_signed_out(&self) {
        if self.session.is_active() {
            return;
        }
        let discarded = self.snapshot.send_if_modified(|snapshot| {
            if *snapshot == SubscriptionSnapshot::default() {
                return false;
            }
            *snapshot = SubscriptionSnapshot::default();
            true
        });
        if discarded {
            debug!("Session ended, subscription snapshot discarded");
        }
    }

    pub fn state(&self) -> RefreshState {
        *acquire_lock(&self.state)
    }

    fn set_state(&self, state: RefreshState) {
        *acquire_lock(&self.state) = state;
    }

    /// Whether a refresh currently holds the in-flight guard
    pub fn is_refreshing(&self) -> bool {
        self.refresh_lock.try_lock().is_err()
    }

    /// Forget failures so refreshing resumes after the circuit opened
    pub fn reset_failures(&self) {
        let mut state = acquire_lock(&self.state);
        if let RefreshState::Backoff(_) = *state {
            *state = RefreshState::Idle;
        }
    }

    /// Discard the snapshot (logout)
    pub fn reset(&self) {
        self.snapshot.send_replace(SubscriptionSnapshot::default());
        debug!("Subscription snapshot reset");
    }

    /// Gate a metered action against the current snapshot
    pub fn can_proceed(&self, action: ActionKey, requested: u64) -> GateDecision {
        if !self.session.is_active() {
            return GateDecision::deny(DenialReason::NotAuthenticated);
        }
        self.gate.can_proceed(&self.snapshot.borrow(), action, requested)
    }

    /// Ask the poller to refresh now (window focus)
    pub fn notify_focus(&self) {
        self.wake.notify_one();
    }

    /// Ask the poller to refresh now (page became visible)
    pub fn notify_visible(&self) {
        self.wake.notify_one();
    }

    /// Refresh the snapshot from the backend
    ///
    /// If another refresh is already running, this waits for it and returns
    /// its result instead of issuing a second request. A forced sync only
    /// joins a refresh that was itself forced; after an unsynced one it
    /// fetches again with `sync=1`.
    pub async fn refresh(&self, force_sync: bool) -> RefreshResult {
        if !self.session.is_active() {
            self.reset();
            return Err(SubscriptionError::NotAuthenticated);
        }

        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.generation.load(Ordering::Acquire) != observed {
            let joined = acquire_lock(&self.last_result).clone();
            match joined {
                Some((synced, result)) if synced || !force_sync => {
                    debug!("Joined in-flight subscription refresh");
                    return result;
                }
                Some(_) => debug!("Joined refresh was not synced, fetching with sync"),
                None => return Ok(self.snapshot()),
            }
        }

        let result = self.refresh_locked(force_sync).await;
        *acquire_lock(&self.last_result) = Some((force_sync, result.clone()));
        self.generation.fetch_add(1, Ordering::Release);
        result
    }

    async fn refresh_locked(&self, force_sync: bool) -> RefreshResult {
        let failures = self.state().consecutive_failures();
        if failures >= self.config.max_failed_attempts {
            warn!(
                failures,
                max = self.config.max_failed_attempts,
                "Subscription refresh skipped after repeated failures"
            );
            return Err(SubscriptionError::CircuitOpen { failures });
        }

        self.set_state(RefreshState::InFlight);
        let mut result = self.source.fetch_status(force_sync).await;

        if let Ok(snapshot) = &result {
            if !force_sync && snapshot.is_reset_overdue(Utc::now()) {
                info!(next_reset = ?snapshot.next_reset, "Usage reset overdue, forcing sync refresh");
                match self.source.fetch_status(true).await {
                    Ok(synced) => result = Ok(synced),
                    Err(ApiError::Unauthorized) => result = Err(ApiError::Unauthorized),
                    Err(e) => warn!(error = %e, "Sync refresh failed, keeping unsynced snapshot"),
                }
            }
        }

        match result {
            Ok(snapshot) => {
                self.set_state(RefreshState::Idle);
                // Logged out while the request was in flight
                if !self.session.is_active() {
                    self.reset();
                    return Err(SubscriptionError::NotAuthenticated);
                }
                debug!(tier = %snapshot.tier, "Subscription snapshot updated");
                self.snapshot.send_replace(snapshot.clone());
                Ok(snapshot)
            }
            Err(ApiError::Unauthorized) => {
                warn!("Subscription refresh unauthorized, signing out");
                self.set_state(RefreshState::Idle);
                self.session.clear();
                self.reset();
                Err(SubscriptionError::Unauthorized)
            }
            Err(e) => {
                let failures = failures + 1;
                self.set_state(RefreshState::Backoff(failures));
                warn!(failures, error = %e, "Subscription refresh failed");
                Err(SubscriptionError::Api(e))
            }
        }
    }

    /// Initial forced refresh, then background polling
    pub async fn init(self: &Arc<Self>) -> (RefreshResult, PollerHandle) {
        let result = self.refresh(true).await;
        (result, self.start_polling())
    }

    /// Start background polling for the current session
    ///
    /// Polling ends when the session ends, on `PollerHandle::stop`, or when
    /// the handle is dropped.
    pub fn start_polling(self: &Arc<Self>) -> PollerHandle {
        let store = Arc::clone(self);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(store.poll_loop(stop_rx));
        PollerHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }

    async fn poll_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session_rx = self.session.subscribe();
        let mut inflight = JoinSet::new();

        info!(interval = ?period, "Subscription polling started");

        while self.session.is_active() {
            tokio::select! {
                _ = ticker.tick() => self.spawn_poll(&mut inflight, "interval"),
                _ = self.wake.notified() => self.spawn_poll(&mut inflight, "foreground"),
                changed = session_rx.changed() => {
                    if changed.is_err() || session_rx.borrow().is_none() {
                        break;
                    }
                }
                _ = stop.changed() => break,
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
            }
        }

        inflight.abort_all();
        if !self.session.is_active() {
            self.reset();
        }
        info!("Subscription polling stopped");
    }

    fn spawn_poll(self: &Arc<Self>, inflight: &mut JoinSet<()>, trigger: &'static str) {
        // A hung request must not queue up ticks behind it
        if self.is_refreshing() {
            debug!(trigger, "Refresh already in flight, skipping poll");
            return;
        }
        let store = Arc::clone(self);
        inflight.spawn(async move {
            if let Err(e) = store.refresh(false).await {
                debug!(trigger, error = %e, "Background refresh failed");
            }
        });
    }
}

/// Handle to a running poller
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stop polling and wait for the loop to exit
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::billing::{Limit, SubscriptionTier};

    fn free_audio(used: u64) -> SubscriptionSnapshot {
        snapshot_with(
            SubscriptionTier::Free,
            &[
                (ActionKey::AudioDownloads, used, Limit::Count(5)),
                (ActionKey::VideoDownloads, 1, Limit::Count(1)),
            ],
        )
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let source = Arc::new(FakeSource::returning(free_audio(2)));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let snap = store.refresh(false).await.unwrap();
        assert_eq!(snap.used(ActionKey::AudioDownloads), 2);
        assert_eq!(store.snapshot().used(ActionKey::AudioDownloads), 2);
        assert_eq!(store.state(), RefreshState::Idle);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_refresh_is_idempotent() {
        let source = Arc::new(FakeSource::returning(free_audio(2)));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let first = store.refresh(false).await.unwrap();
        let second = store.refresh(false).await.unwrap();
        assert!(first.same_state_as(&second));
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_request() {
        let source = Arc::new(
            FakeSource::returning(free_audio(3)).with_delay(Duration::from_millis(200)),
        );
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let results = futures::future::join_all([
            store.refresh(false),
            store.refresh(false),
            store.refresh(false),
        ])
        .await;

        assert_eq!(source.call_count(), 1);
        for result in results {
            assert_eq!(result.unwrap().used(ActionKey::AudioDownloads), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_sync_is_not_lost_behind_plain_refresh() {
        let source = Arc::new(
            FakeSource::returning(free_audio(3)).with_delay(Duration::from_millis(200)),
        );
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let (plain, forced) = tokio::join!(store.refresh(false), store.refresh(true));
        assert!(plain.is_ok());
        assert!(forced.is_ok());
        assert_eq!(*source.syncs.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_refresh_joins_forced_one() {
        let source = Arc::new(
            FakeSource::returning(free_audio(3)).with_delay(Duration::from_millis(200)),
        );
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let (forced, plain) = tokio::join!(store.refresh(true), store.refresh(false));
        assert!(forced.is_ok());
        assert!(plain.is_ok());
        assert_eq!(*source.syncs.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_unauthorized_clears_session_and_snapshot() {
        let source = Arc::new(FakeSource::returning(free_audio(1)));
        let session = signed_in();
        let store = store_with(source.clone(), session.clone(), StoreConfig::default());

        store.refresh(false).await.unwrap();
        assert!(store.can_proceed(ActionKey::AudioDownloads, 1).allowed);

        source.set_fallback(Err(ApiError::Unauthorized));
        let err = store.refresh(false).await.unwrap_err();
        assert_eq!(err, SubscriptionError::Unauthorized);
        assert!(!session.is_active());
        assert_eq!(store.snapshot(), SubscriptionSnapshot::default());

        for key in ActionKey::ALL {
            assert!(!store.can_proceed(key, 1).allowed);
        }
    }

    #[tokio::test]
    async fn test_session_cleared_elsewhere_discards_snapshot() {
        let source = Arc::new(FakeSource::returning(free_audio(2)));
        let session = signed_in();
        let store = store_with(source.clone(), session.clone(), StoreConfig::default());
        store.refresh(false).await.unwrap();
        let mut rx = store.subscribe();

        // e.g. a download answered 401
        session.clear();

        assert_eq!(store.snapshot(), SubscriptionSnapshot::default());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SubscriptionSnapshot::default());
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_session_skips_network() {
        let source = Arc::new(FakeSource::returning(free_audio(1)));
        let session = Arc::new(SessionStore::in_memory());
        let store = store_with(source.clone(), session, StoreConfig::default());

        assert_eq!(
            store.refresh(false).await.unwrap_err(),
            SubscriptionError::NotAuthenticated
        );
        assert_eq!(source.call_count(), 0);
        let decision = store.can_proceed(ActionKey::AudioDownloads, 1);
        assert_eq!(decision.reason.as_deref(), Some("Authentication required"));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_max_failures() {
        let source = Arc::new(FakeSource::failing(ApiError::ServerBusy));
        let config = StoreConfig {
            max_failed_attempts: 3,
            ..StoreConfig::default()
        };
        let store = store_with(source.clone(), signed_in(), config);

        for n in 1..=3 {
            assert!(matches!(
                store.refresh(false).await,
                Err(SubscriptionError::Api(ApiError::ServerBusy))
            ));
            assert_eq!(store.state(), RefreshState::Backoff(n));
        }

        assert_eq!(
            store.refresh(false).await.unwrap_err(),
            SubscriptionError::CircuitOpen { failures: 3 }
        );
        assert_eq!(source.call_count(), 3);

        store.reset_failures();
        source.set_fallback(Ok(free_audio(0)));
        assert!(store.refresh(false).await.is_ok());
        assert_eq!(store.state(), RefreshState::Idle);
        assert_eq!(source.call_count(), 4);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let source = Arc::new(FakeSource::returning(free_audio(0)));
        source.push(Err(ApiError::ServerBusy));
        source.push(Err(ApiError::ServerBusy));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let _ = store.refresh(false).await;
        let _ = store.refresh(false).await;
        assert_eq!(store.state(), RefreshState::Backoff(2));

        store.refresh(false).await.unwrap();
        assert_eq!(store.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_overdue_reset_forces_sync_refresh() {
        let mut stale = free_audio(4);
        stale.next_reset = Some(Utc::now() - chrono::Duration::days(1));
        let mut rolled = free_audio(0);
        rolled.next_reset = Some(Utc::now() + chrono::Duration::days(29));

        let source = Arc::new(FakeSource::returning(rolled));
        source.push(Ok(stale));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let snap = store.refresh(false).await.unwrap();
        assert_eq!(*source.syncs.lock().unwrap(), vec![false, true]);
        assert_eq!(snap.used(ActionKey::AudioDownloads), 0);
        assert_eq!(store.snapshot().used(ActionKey::AudioDownloads), 0);
    }

    #[tokio::test]
    async fn test_forced_refresh_does_not_double_sync() {
        let mut stale = free_audio(4);
        stale.next_reset = Some(Utc::now() - chrono::Duration::days(1));
        let source = Arc::new(FakeSource::returning(stale));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        store.refresh(true).await.unwrap();
        assert_eq!(*source.syncs.lock().unwrap(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_runs_on_interval_and_focus() {
        let source = Arc::new(FakeSource::returning(free_audio(1)));
        let session = signed_in();
        let store = store_with(source.clone(), session.clone(), StoreConfig::default());

        let handle = store.start_polling();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(source.call_count(), 1);

        store.notify_focus();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.call_count(), 2);

        store.notify_visible();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.call_count(), 3);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_when_session_ends() {
        let source = Arc::new(FakeSource::returning(free_audio(1)));
        let session = signed_in();
        let store = store_with(source.clone(), session.clone(), StoreConfig::default());

        store.refresh(true).await.unwrap();
        let handle = store.start_polling();
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.clear();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
        assert_eq!(store.snapshot(), SubscriptionSnapshot::default());

        let before = source.call_count();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.call_count(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_polling() {
        let source = Arc::new(FakeSource::returning(free_audio(1)));
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let handle = store.start_polling();
        drop(handle);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_refresh_does_not_queue_ticks() {
        let source = Arc::new(
            FakeSource::returning(free_audio(1)).with_delay(Duration::from_secs(150)),
        );
        let store = store_with(source.clone(), signed_in(), StoreConfig::default());

        let _handle = store.start_polling();
        // ticks at 60s and 120s both land while the 60s refresh is still running
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(source.call_count(), 1);
        assert!(store.is_refreshing());
    }

    #[tokio::test]
    async fn test_subscribers_see_replacement() {
        let source = Arc::new(FakeSource::returning(free_audio(2)));
        let store = store_with(source, signed_in(), StoreConfig::default());
        let mut rx = store.subscribe();

        store.refresh(false).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().used(ActionKey::AudioDownloads), 2);
    }
}
