//! Backend API client
//!
//! Every call goes through `fetch_with_backoff`, and every response through
//! `check_status`. Transient failures and 401 handling therefore live here,
//! and callers only deal with errors specific to their own action.

pub mod backoff;
mod types;

pub use backoff::{fetch_with_backoff, BackoffPolicy, FetchAttemptState, HttpStatus};
pub use types::{
    error_detail, CancelResponse, CheckoutRequest, RedirectResponse, RegisterRequest,
    RegisterResponse, TokenResponse,
};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::SessionStore;
use crate::billing::{StatusPayload, SubscriptionSnapshot, SubscriptionSource, SubscriptionTier};
use crate::downloads::{DownloadKind, DownloadPayload, DownloadRequest};
use crate::http_client::api_client;
use crate::jobs::{BatchJobPayload, BatchSubmitRequest, BatchSubmitResponse};

/// Errors from backend calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// 401, or no token to send
    #[error("Authentication required")]
    Unauthorized,

    /// Validation or business rule failure (400/403/409/422)
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// Retries exhausted on 429/5xx, or the backend never answered
    #[error("Server busy, please try again")]
    ServerBusy,

    #[error("Unexpected response ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Header repeated on every retry of a metered POST so the backend charges once
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the backend
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: Arc<SessionStore>,
    backoff: BackoffPolicy,
}

impl ApiClient {
    /// Create a client on the shared connection pool
    pub fn new(base_url: impl Into<String>, session: Arc<SessionStore>) -> Self {
        Self::with_client(api_client().clone(), base_url, session)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, session: Arc<SessionStore>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> Result<String, ApiError> {
        self.session.token().ok_or(ApiError::Unauthorized)
    }

    /// Run a request through the backoff helper
    async fn send<F, Fut>(&self, send: F) -> Result<Response, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<Response>>,
    {
        fetch_with_backoff(self.backoff, send)
            .await
            .ok_or(ApiError::ServerBusy)
    }

    /// Map non-success statuses onto `ApiError`
    ///
    /// A 401 drops the session so stale credentials are never reused. The
    /// subscription store sees the session end and discards its snapshot.
    async fn check_status(&self, response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        if code == 401 {
            warn!(url = %response.url(), "Backend rejected credentials, signing out");
            self.session.clear();
            return Err(ApiError::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_detail(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string());

        if backoff::is_retryable_status(code) {
            return Err(ApiError::ServerBusy);
        }

        match code {
            400 | 403 | 409 | 422 => Err(ApiError::Rejected {
                status: code,
                message,
            }),
            _ => Err(ApiError::Status {
                status: code,
                message,
            }),
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Exchange credentials for a bearer token
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        let url = self.url("/token");
        let form = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];

        let response = self
            .send(|| self.client.post(&url).form(&form).send())
            .await?;

        // Wrong credentials are a user error here, not an expired session
        if response.status().as_u16() == 401 {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected {
                status: 401,
                message: error_detail(&body)
                    .unwrap_or_else(|| "Incorrect username or password".to_string()),
            });
        }

        let response = self.check_status(response).await?;
        Self::decode(response).await
    }

    /// Create an account
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        let url = self.url("/register");
        let response = self
            .send(|| self.client.post(&url).json(request).send())
            .await?;
        let response = self.check_status(response).await?;

        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            return Ok(RegisterResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Fetch the raw subscription status payload
    pub async fn subscription_status(&self, sync: bool) -> Result<StatusPayload, ApiError> {
        let token = self.bearer()?;
        let url = self.url("/subscription_status");
        let sync_flag = if sync { "1" } else { "0" };

        let response = self
            .send(|| {
                self.client
                    .get(&url)
                    .bearer_auth(&token)
                    .query(&[("sync", sync_flag)])
                    .send()
            })
            .await?;
        let response = self.check_status(response).await?;
        Self::decode(response).await
    }

    /// Start a plan upgrade, returns the checkout URL
    pub async fn create_checkout_session(&self, tier: SubscriptionTier) -> Result<RedirectResponse, ApiError> {
        let body = CheckoutRequest { tier };
        self.post_json("/billing/create_checkout_session", &body).await
    }

    /// Returns the billing portal URL
    pub async fn create_portal_session(&self) -> Result<RedirectResponse, ApiError> {
        self.post_json("/billing/create_portal_session", &serde_json::json!({}))
            .await
    }

    /// Cancel at period end
    pub async fn cancel_subscription(&self) -> Result<CancelResponse, ApiError> {
        let token = self.bearer()?;
        let url = self.url("/subscription/cancel");
        let response = self
            .send(|| self.client.post(&url).bearer_auth(&token).send())
            .await?;
        let response = self.check_status(response).await?;

        let body = response.text().await.unwrap_or_default();
        if body.trim().is_empty() {
            return Ok(CancelResponse::default());
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Perform a metered download
    pub async fn download(
        &self,
        kind: DownloadKind,
        request: &DownloadRequest,
    ) -> Result<DownloadPayload, ApiError> {
        debug!(kind = %kind, youtube_id = %request.youtube_id, "Requesting download");
        self.post_metered(kind.endpoint(), request).await
    }

    pub async fn submit_batch(&self, request: &BatchSubmitRequest) -> Result<BatchSubmitResponse, ApiError> {
        self.post_metered("/batch/submit", request).await
    }

    pub async fn batch_job(&self, job_id: &str) -> Result<BatchJobPayload, ApiError> {
        let token = self.bearer()?;
        let url = self.url(&format!("/batch/jobs/{}", job_id));
        let response = self
            .send(|| self.client.get(&url).bearer_auth(&token).send())
            .await?;
        let response = self.check_status(response).await?;
        Self::decode(response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post_with_key(path, body, None).await
    }

    /// POST that consumes quota, every retry carries the same idempotency key
    async fn post_metered<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = Uuid::new_v4().to_string();
        self.post_with_key(path, body, Some(&key)).await
    }

    async fn post_with_key<B, T>(&self, path: &str, body: &B, key: Option<&str>) -> Result<T, ApiError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.bearer()?;
        let url = self.url(path);
        let response = self
            .send(|| {
                let mut request = self.client.post(&url).bearer_auth(&token).json(body);
                if let Some(key) = key {
                    request = request.header(IDEMPOTENCY_KEY_HEADER, key);
                }
                request.send()
            })
            .await?;
        let response = self.check_status(response).await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl SubscriptionSource for ApiClient {
    async fn fetch_status(&self, sync: bool) -> Result<SubscriptionSnapshot, ApiError> {
        let payload = self.subscription_status(sync).await?;
        Ok(SubscriptionSnapshot::from_payload(payload, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let session = Arc::new(SessionStore::in_memory());
        let client = ApiClient::new("http://localhost:8000/", session);
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(client.url("/token"), "http://localhost:8000/token");
        assert_eq!(
            client.url("download_audio/"),
            "http://localhost:8000/download_audio/"
        );
    }

    #[tokio::test]
    async fn test_authenticated_call_without_session_fails_fast() {
        let session = Arc::new(SessionStore::in_memory());
        let client = ApiClient::new("http://127.0.0.1:9", session);
        assert_eq!(
            client.subscription_status(false).await.unwrap_err(),
            ApiError::Unauthorized
        );
    }
}
