//! Bounded retry with exponential backoff for transient failures
//!
//! A request is retried when it produced no response at all, or when the
//! server answered 429/502/503/504. Anything else goes straight back to the
//! caller, including 4xx errors and successes.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Statuses treated as "server busy, try again"
pub const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Anything that carries an HTTP status code
pub trait HttpStatus {
    fn status_code(&self) -> u16;
}

impl HttpStatus for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first
    pub tries: u32,
    /// Wait after the first failed attempt, doubled after each further one
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(tries: u32, base_delay: Duration) -> Self {
        Self {
            tries: tries.max(1),
            base_delay: if base_delay.is_zero() {
                Duration::from_millis(1)
            } else {
                base_delay
            },
        }
    }

    /// Wait after 0-based attempt `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_millis(500))
    }
}

/// Progress of one bounded retry sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttemptState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

impl FetchAttemptState {
    fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_error: None,
        }
    }

    fn has_more(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }
}

/// Issue `send` until it yields a non-transient response or attempts run out
///
/// Returns the last response received, even if it is a retryable status.
/// Returns `None` only when no attempt produced a response.
pub async fn fetch_with_backoff<T, E, F, Fut>(policy: BackoffPolicy, mut send: F) -> Option<T>
where
    T: HttpStatus,
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let policy = BackoffPolicy::new(policy.tries, policy.base_delay);
    let mut state = FetchAttemptState::new(policy.tries);
    let mut last_response = None;

    loop {
        match send().await {
            Ok(response) => {
                let status = response.status_code();
                if !is_retryable_status(status) {
                    return Some(response);
                }
                warn!(
                    status,
                    attempt = state.attempt + 1,
                    max = state.max_attempts,
                    "Transient server status"
                );
                state.last_error = Some(format!("HTTP {}", status));
                last_response = Some(response);
            }
            Err(e) => {
                warn!(
                    attempt = state.attempt + 1,
                    max = state.max_attempts,
                    error = %e,
                    "Request failed without a response"
                );
                state.last_error = Some(e.to_string());
            }
        }

        if !state.has_more() {
            break;
        }

        let delay = policy.delay_for(state.attempt);
        debug!(?delay, attempt = state.attempt + 1, "Backing off before retry");
        tokio::time::sleep(delay).await;
        state.attempt += 1;
    }

    if last_response.is_none() {
        warn!(
            attempts = state.max_attempts,
            last_error = state.last_error.as_deref().unwrap_or(""),
            "Backend unreachable"
        );
    }
    last_response
}
