//! Billing module for subscription status and usage gating
//!
//! This module handles:
//! - Subscription tier and per-action quota types
//! - Usage evaluation and the action gate
//! - The subscription status store with background polling
//! - Post-action usage reconciliation

mod limits;
mod reconcile;
mod subscription;
mod types;

pub use limits::{evaluate, ActionGate, NEAR_LIMIT_PERCENT};
pub use reconcile::{ReconcileOptions, UsageReconciler};
pub use subscription::{
    PollerHandle, RefreshState, StoreConfig, SubscriptionError, SubscriptionSource,
    SubscriptionStore,
};
pub use types::{
    parse_reset_timestamp, ActionKey, DenialReason, GateDecision, Limit, Remaining,
    StatusPayload, SubscriptionSnapshot, SubscriptionTier, UsageEvaluation, UsageLevel,
};

#[cfg(test)]
pub(crate) use subscription::test_support;
