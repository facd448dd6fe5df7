//! Post-action usage reconciliation
//!
//! A successful download does not mean `/subscription_status` already shows
//! the new count. After an action, poll the store for a short while until
//! the counter for that action goes up, so the displayed quota is not stale.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::subscription::SubscriptionStore;
use super::types::ActionKey;
use crate::cancel::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub max_tries: u32,
    pub delay: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_tries: 6,
            delay: Duration::from_millis(400),
        }
    }
}

pub struct UsageReconciler {
    store: Arc<SubscriptionStore>,
}

impl UsageReconciler {
    pub fn new(store: Arc<SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Poll until `action`'s used count exceeds `before_used`
    ///
    /// Returns `false` when attempts run out or `cancel` is raised. Neither is
    /// an error, the background poller catches up later.
    pub async fn reconcile(
        &self,
        action: ActionKey,
        before_used: u64,
        options: ReconcileOptions,
        cancel: &CancelFlag,
    ) -> bool {
        for attempt in 1..=options.max_tries {
            if cancel.is_cancelled() {
                debug!(action = %action, attempt, "Usage reconciliation cancelled");
                return false;
            }

            if let Err(e) = self.store.refresh(false).await {
                debug!(action = %action, attempt, error = %e, "Refresh during reconciliation failed");
            }

            if cancel.is_cancelled() {
                debug!(action = %action, attempt, "Usage reconciliation cancelled");
                return false;
            }
            tokio::time::sleep(options.delay).await;

            let used = self.store.snapshot().used(action);
            if used > before_used {
                debug!(action = %action, attempt, before_used, used, "Usage increment observed");
                return true;
            }
        }

        debug!(
            action = %action,
            before_used,
            tries = options.max_tries,
            "Usage increment not observed, leaving it to the background poll"
        );
        false
    }
}
