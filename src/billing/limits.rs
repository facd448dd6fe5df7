//! Usage evaluation and limit enforcement
//!
//! `evaluate` is the one place usage is compared against a limit. Every
//! metered surface (single downloads, transcript type, batch submission)
//! goes through `ActionGate`, which goes through `evaluate`.

use super::types::{
    ActionKey, DenialReason, GateDecision, Limit, Remaining, SubscriptionSnapshot,
    SubscriptionTier, UsageEvaluation, UsageLevel,
};

/// Percentage of a finite limit at which usage counts as near the limit
pub const NEAR_LIMIT_PERCENT: u64 = 80;

/// Compare a used count against a limit
///
/// Missing usage counts as 0. A missing limit counts as 0, so the action is blocked.
pub fn evaluate(used: Option<u64>, limit: Option<Limit>) -> UsageEvaluation {
    let used = used.unwrap_or(0);
    let limit = limit.unwrap_or(Limit::Count(0));

    match limit {
        Limit::Unlimited => UsageEvaluation {
            used,
            limit,
            remaining: Remaining::Unlimited,
            at_limit: false,
            level: UsageLevel::Ok,
        },
        Limit::Count(max) => {
            let at_limit = used >= max;
            let level = if at_limit {
                UsageLevel::Exceeded
            } else if used.saturating_mul(100) >= max.saturating_mul(NEAR_LIMIT_PERCENT) {
                UsageLevel::NearLimit
            } else {
                UsageLevel::Ok
            };

            UsageEvaluation {
                used,
                limit,
                remaining: Remaining::Finite(max.saturating_sub(used)),
                at_limit,
                level,
            }
        }
    }
}

/// Decides whether a metered action may start
///
/// Reads a snapshot only, no I/O, so it is cheap enough to call on every render.
pub struct ActionGate;

impl ActionGate {
    pub fn new() -> Self {
        Self
    }

    /// Check whether `requested` more actions of `action` fit in the snapshot's quota
    pub fn can_proceed(
        &self,
        snapshot: &SubscriptionSnapshot,
        action: ActionKey,
        requested: u64,
    ) -> GateDecision {
        // Premium is unlimited by product policy
        if snapshot.tier == SubscriptionTier::Premium {
            return GateDecision::allow();
        }

        let eval = snapshot.evaluate(action);
        if eval.remaining.covers(requested) {
            return GateDecision::allow();
        }

        let remaining = match eval.remaining {
            Remaining::Finite(n) => n,
            Remaining::Unlimited => u64::MAX,
        };

        GateDecision::deny(DenialReason::InsufficientQuota {
            action,
            remaining,
            requested,
        })
    }
}

impl Default for ActionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_snapshot(
        tier: SubscriptionTier,
        entries: &[(ActionKey, u64, Limit)],
    ) -> SubscriptionSnapshot {
        let mut usage = HashMap::new();
        let mut limits = HashMap::new();
        for (key, used, limit) in entries {
            usage.insert(*key, *used);
            limits.insert(*key, *limit);
        }
        SubscriptionSnapshot {
            tier,
            usage,
            limits,
            next_reset: None,
            fetched_at: None,
        }
    }

    #[test]
    fn test_evaluate_finite_limit() {
        let eval = evaluate(Some(3), Some(Limit::Count(5)));
        assert_eq!(eval.used, 3);
        assert_eq!(eval.remaining, Remaining::Finite(2));
        assert!(!eval.at_limit);
        assert_eq!(eval.level, UsageLevel::Ok);
    }

    #[test]
    fn test_evaluate_over_limit_clamps_remaining() {
        let eval = evaluate(Some(9), Some(Limit::Count(5)));
        assert_eq!(eval.remaining, Remaining::Finite(0));
        assert!(eval.at_limit);
        assert_eq!(eval.level, UsageLevel::Exceeded);
    }

    #[test]
    fn test_evaluate_unlimited() {
        let eval = evaluate(Some(1_000_000), Some(Limit::Unlimited));
        assert_eq!(eval.remaining, Remaining::Unlimited);
        assert!(!eval.at_limit);
    }

    #[test]
    fn test_evaluate_missing_values_fail_closed() {
        let eval = evaluate(None, None);
        assert_eq!(eval.used, 0);
        assert_eq!(eval.limit, Limit::Count(0));
        assert!(eval.at_limit);
        assert_eq!(eval.remaining, Remaining::Finite(0));
    }

    #[test]
    fn test_evaluate_near_limit() {
        assert_eq!(evaluate(Some(8), Some(Limit::Count(10))).level, UsageLevel::NearLimit);
        assert_eq!(evaluate(Some(7), Some(Limit::Count(10))).level, UsageLevel::Ok);
    }

    #[test]
    fn test_at_limit_law_holds_across_grid() {
        for used in 0..12u64 {
            for max in 0..12u64 {
                let eval = evaluate(Some(used), Some(Limit::Count(max)));
                assert_eq!(eval.at_limit, used >= max, "used={} max={}", used, max);
            }
            assert!(!evaluate(Some(used), Some(Limit::Unlimited)).at_limit);
        }
    }

    #[test]
    fn test_free_tier_video_at_limit_denied() {
        let gate = ActionGate::new();
        let snap = make_snapshot(
            SubscriptionTier::Free,
            &[(ActionKey::VideoDownloads, 1, Limit::Count(1))],
        );

        let decision = gate.can_proceed(&snap, ActionKey::VideoDownloads, 1);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("video"));
    }

    #[test]
    fn test_insufficient_batch_reason() {
        let gate = ActionGate::new();
        let snap = make_snapshot(
            SubscriptionTier::Pro,
            &[(ActionKey::AudioDownloads, 9, Limit::Count(10))],
        );

        let decision = gate.can_proceed(&snap, ActionKey::AudioDownloads, 3);
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason.as_deref(),
            Some("Insufficient audio downloads remaining: 1 left, requested 3")
        );
        assert!(gate.can_proceed(&snap, ActionKey::AudioDownloads, 1).allowed);
    }

    #[test]
    fn test_premium_always_allowed() {
        let gate = ActionGate::new();
        let snap = make_snapshot(
            SubscriptionTier::Premium,
            &[(ActionKey::VideoDownloads, 500, Limit::Count(0))],
        );

        for key in ActionKey::ALL {
            assert!(gate.can_proceed(&snap, key, 50).allowed);
        }
    }

    #[test]
    fn test_unlimited_limit_always_allowed() {
        let gate = ActionGate::new();
        let snap = make_snapshot(
            SubscriptionTier::Free,
            &[(ActionKey::CleanTranscripts, 12_345, Limit::Unlimited)],
        );
        assert!(gate.can_proceed(&snap, ActionKey::CleanTranscripts, 100).allowed);
    }

    #[test]
    fn test_empty_snapshot_blocks_everything() {
        let gate = ActionGate::new();
        let snap = SubscriptionSnapshot::default();
        for key in ActionKey::ALL {
            assert!(!gate.can_proceed(&snap, key, 1).allowed);
        }
    }
}
