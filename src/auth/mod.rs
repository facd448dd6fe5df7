//! Login, registration and the persisted session

mod session;

pub use session::{Session, SessionError, SessionStore, UserProfile};

use std::sync::Arc;
use tracing::info;

use crate::api::{ApiClient, ApiError, RegisterRequest, RegisterResponse};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Account flows on top of the API client
pub struct AuthService {
    api: Arc<ApiClient>,
}

impl AuthService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Sign in and persist the session
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let token = self.api.login(username, password).await?;
        let user = token.user.unwrap_or_else(|| UserProfile {
            username: username.to_string(),
            email: None,
        });
        let session = Session::new(token.access_token, user);
        self.api.session().set(session.clone())?;
        info!(user = %session.user.username, "Signed in");
        Ok(session)
    }

    /// Create an account, conflicts come back as `ApiError::Rejected`
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, AuthError> {
        let response = self.api.register(request).await?;
        info!(user = %request.username, "Account registered");
        Ok(response)
    }

    pub fn logout(&self) {
        self.api.session().clear();
        info!("Signed out");
    }
}
