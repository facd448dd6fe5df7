//! Wire types for auth and billing endpoints

use serde::{Deserialize, Serialize};

use crate::auth::UserProfile;
use crate::billing::SubscriptionTier;

/// `POST /token` response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// `POST /register` body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// `POST /register` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterResponse {
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /billing/create_checkout_session` body
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub tier: SubscriptionTier,
}

/// Checkout and billing-portal responses
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectResponse {
    pub url: String,
}

/// `POST /subscription/cancel` response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
}

/// Pull a human readable message out of an error body
///
/// Understands `{"detail": "..."}`, validation lists `{"detail": [{"msg": ...}]}`
/// and `{"message": "..."}`. Short plain-text bodies are passed through.
pub fn error_detail(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match value.get("detail") {
            Some(serde_json::Value::String(s)) => return Some(s.clone()),
            Some(serde_json::Value::Array(items)) => {
                let msgs: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !msgs.is_empty() {
                    return Some(msgs.join("; "));
                }
            }
            _ => {}
        }
        for key in ["message", "error"] {
            if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
                return Some(s.to_string());
            }
        }
        return None;
    }

    if trimmed.len() <= 300 {
        Some(trimmed.to_string())
    } else {
        None
    }
}
