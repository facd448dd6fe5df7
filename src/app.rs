//! Wiring of the client components around one session

use std::sync::Arc;
use tracing::info;

use crate::api::ApiClient;
use crate::auth::{AuthError, AuthService, Session, SessionStore};
use crate::billing::SubscriptionStore;
use crate::config::ClientConfig;
use crate::downloads::{DownloadService, HelperClient};
use crate::jobs::{BatchJobManager, BatchOptions, BatchService};

pub struct YcdApp {
    pub config: ClientConfig,
    pub session: Arc<SessionStore>,
    pub api: Arc<ApiClient>,
    pub store: Arc<SubscriptionStore>,
    pub auth: AuthService,
    pub downloads: DownloadService,
    pub batches: BatchService,
}

impl YcdApp {
    /// Restore the saved session and build every service on top of it
    pub fn open(config: ClientConfig) -> Self {
        let session = Arc::new(SessionStore::open(config.session_path.clone()));
        Self::with_session(config, session)
    }

    pub fn with_session(config: ClientConfig, session: Arc<SessionStore>) -> Self {
        let api = Arc::new(ApiClient::new(config.api_url.clone(), session.clone()));
        let store = Arc::new(SubscriptionStore::new(
            api.clone(),
            session.clone(),
            config.store_config(),
        ));
        let downloads = DownloadService::new(
            api.clone(),
            HelperClient::new(config.helper_url.clone()),
            store.clone(),
        );
        let batches = BatchService::new(
            api.clone(),
            store.clone(),
            BatchJobManager::new(config.batch_path.clone()),
            BatchOptions::default(),
        );

        Self {
            auth: AuthService::new(api.clone()),
            config,
            session,
            api,
            store,
            downloads,
            batches,
        }
    }

    /// Sign in, then let refreshes run again if the breaker had opened
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let session = self.auth.login(username, password).await?;
        self.store.reset_failures();
        Ok(session)
    }

    pub fn logout(&self) {
        self.auth.logout();
        self.store.reset();
        info!("Subscription state discarded");
    }
}
