//! Billing data types

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use tracing::debug;

/// Subscription tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Premium,
}

impl SubscriptionTier {
    /// Parse a tier name from the backend, unknown names fall back to free
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "pro" => Self::Pro,
            "premium" => Self::Premium,
            _ => Self::Free,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// Metered action category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKey {
    CleanTranscripts,
    UncleanTranscripts,
    AudioDownloads,
    VideoDownloads,
}

impl ActionKey {
    pub const ALL: [ActionKey; 4] = [
        ActionKey::CleanTranscripts,
        ActionKey::UncleanTranscripts,
        ActionKey::AudioDownloads,
        ActionKey::VideoDownloads,
    ];

    /// Wire name used by the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CleanTranscripts => "clean_transcripts",
            Self::UncleanTranscripts => "unclean_transcripts",
            Self::AudioDownloads => "audio_downloads",
            Self::VideoDownloads => "video_downloads",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Human label used in user-facing messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::CleanTranscripts => "clean transcripts",
            Self::UncleanTranscripts => "unclean transcripts",
            Self::AudioDownloads => "audio downloads",
            Self::VideoDownloads => "video downloads",
        }
    }
}

impl std::fmt::Display for ActionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action quota: a count, or the "unlimited" sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Count(u64),
    Unlimited,
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Count(n) => serializer.serialize_u64(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawLimit {
            Count(i64),
            Text(String),
        }

        match RawLimit::deserialize(deserializer)? {
            RawLimit::Count(n) if n >= 0 => Ok(Limit::Count(n as u64)),
            RawLimit::Count(n) => Err(serde::de::Error::custom(format!(
                "limit must be non-negative or \"unlimited\", got {}",
                n
            ))),
            RawLimit::Text(s) if s.trim().eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            RawLimit::Text(s) => s.trim().parse::<u64>().map(Limit::Count).map_err(|_| {
                serde::de::Error::custom(format!("invalid limit value: {:?}", s))
            }),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Remaining quota for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Finite(u64),
    Unlimited,
}

impl Remaining {
    /// Whether at least `requested` more actions fit
    pub fn covers(&self, requested: u64) -> bool {
        match self {
            Self::Finite(n) => *n >= requested,
            Self::Unlimited => true,
        }
    }
}

impl std::fmt::Display for Remaining {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finite(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Coarse usage classification for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Ok,
    NearLimit,
    Exceeded,
}

/// Result of comparing usage against a limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEvaluation {
    pub used: u64,
    pub limit: Limit,
    pub remaining: Remaining,
    pub at_limit: bool,
    pub level: UsageLevel,
}

/// Latest server-reported subscription state
///
/// Replaced wholesale on every successful refresh, never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub tier: SubscriptionTier,
    pub usage: HashMap<ActionKey, u64>,
    pub limits: HashMap<ActionKey, Limit>,
    pub next_reset: Option<DateTime<Utc>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl SubscriptionSnapshot {
    /// Used count for an action, missing counts as zero
    pub fn used(&self, action: ActionKey) -> u64 {
        self.usage.get(&action).copied().unwrap_or(0)
    }

    pub fn limit(&self, action: ActionKey) -> Option<Limit> {
        self.limits.get(&action).copied()
    }

    pub fn evaluate(&self, action: ActionKey) -> UsageEvaluation {
        super::limits::evaluate(self.usage.get(&action).copied(), self.limit(action))
    }

    /// True when the server-side reset time has already passed
    pub fn is_reset_overdue(&self, now: DateTime<Utc>) -> bool {
        self.next_reset.map(|reset| reset < now).unwrap_or(false)
    }

    /// Equality ignoring `fetched_at`
    pub fn same_state_as(&self, other: &SubscriptionSnapshot) -> bool {
        self.tier == other.tier
            && self.usage == other.usage
            && self.limits == other.limits
            && self.next_reset == other.next_reset
    }

    /// Normalize a `/subscription_status` payload into a snapshot
    pub fn from_payload(payload: StatusPayload, fetched_at: DateTime<Utc>) -> Self {
        let tier = payload
            .tier
            .as_deref()
            .map(SubscriptionTier::from_name)
            .unwrap_or_default();

        let mut usage = HashMap::new();
        for (name, count) in payload.usage {
            match ActionKey::from_wire(&name) {
                Some(key) => {
                    usage.insert(key, count.max(0) as u64);
                }
                None => debug!(key = %name, "Ignoring unknown usage key"),
            }
        }

        let mut limits = HashMap::new();
        for (name, limit) in payload.limits {
            match (ActionKey::from_wire(&name), limit) {
                (Some(key), Some(limit)) => {
                    limits.insert(key, limit);
                }
                (Some(_), None) => {}
                (None, _) => debug!(key = %name, "Ignoring unknown limit key"),
            }
        }

        let next_reset = payload.next_reset.as_ref().and_then(parse_reset_timestamp);

        Self {
            tier,
            usage,
            limits,
            next_reset,
            fetched_at: Some(fetched_at),
        }
    }
}

/// Wire shape of `/subscription_status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub usage: HashMap<String, i64>,
    #[serde(default)]
    pub limits: HashMap<String, Option<Limit>>,
    #[serde(default)]
    pub next_reset: Option<serde_json::Value>,
}

/// Parse a reset timestamp
///
/// Supports unix seconds, RFC 3339, naive ISO datetimes (taken as UTC) and bare dates.
pub fn parse_reset_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return Utc.timestamp_opt(secs, 0).single();
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

/// Reason for blocking a metered action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    InsufficientQuota {
        action: ActionKey,
        remaining: u64,
        requested: u64,
    },
    NotAuthenticated,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientQuota {
                action,
                remaining,
                requested,
            } => write!(
                f,
                "Insufficient {} remaining: {} left, requested {}",
                action.label(),
                remaining,
                requested
            ),
            Self::NotAuthenticated => write!(f, "Authentication required"),
        }
    }
}

/// Outcome of an action gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
        }
    }
}
