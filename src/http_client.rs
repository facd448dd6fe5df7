//! Shared HTTP Client Module
//!
//! Provides global, lazy-initialized HTTP clients with connection pooling.
//! One client talks to the backend API, another to the local desktop helper.
//!
//! Clients are built once and reused so TLS sessions and TCP connections
//! survive across polling ticks and downloads.

use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

/// Timeout for general API calls
pub const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the local helper, which performs the whole download itself
pub const HELPER_TIMEOUT: Duration = Duration::from_secs(600);

/// Global HTTP client for backend API calls
///
/// - 30s timeout so a hung request cannot stall the refresh cadence for long
/// - small idle pool, the app talks to a single host
pub static API_CLIENT: Lazy<Client> = Lazy::new(|| {
    build_client(API_TIMEOUT, 8).unwrap_or_else(|e| {
        tracing::error!("Failed to build API client with custom settings: {}", e);
        Client::new()
    })
});

/// Global HTTP client for the local helper on 127.0.0.1
pub static HELPER_CLIENT: Lazy<Client> = Lazy::new(|| {
    build_client(HELPER_TIMEOUT, 2).unwrap_or_else(|e| {
        tracing::error!("Failed to build helper client with custom settings: {}", e);
        Client::new()
    })
});

fn build_client(timeout: Duration, idle_per_host: usize) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(concat!("ycd-client/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Get the global API client
#[inline]
pub fn api_client() -> &'static Client {
    &API_CLIENT
}

/// Get the global helper client
#[inline]
pub fn helper_client() -> &'static Client {
    &HELPER_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_are_created() {
        let _ = api_client();
        let _ = helper_client();
    }

    #[test]
    fn test_clients_are_same_instance() {
        let client1 = api_client();
        let client2 = api_client();
        assert!(std::ptr::eq(client1, client2));
    }
}
