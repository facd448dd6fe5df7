//! Client configuration from the environment and `.env`

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::billing::StoreConfig;
use crate::downloads::HELPER_URL;

pub const PRODUCTION_API_URL: &str = "https://api.ycd.app";
pub const DEV_API_PORT: u16 = 8000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Could not determine config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub helper_url: String,
    pub poll_interval: Duration,
    pub max_failed_attempts: u32,
    pub session_path: PathBuf,
    pub batch_path: PathBuf,
    pub download_dir: PathBuf,
}

/// Load `.env` from the working directory, falling back to its parent
pub fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }
}

impl ClientConfig {
    /// Read the process environment (call `load_dotenv` first)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = resolve_api_url(get("YCD_API_URL").as_deref(), get("YCD_HOSTNAME").as_deref());
        let defaults = StoreConfig::default();

        let poll_interval = match get("YCD_POLL_INTERVAL_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "YCD_POLL_INTERVAL_SECS",
                        value: raw,
                    })
                }
            },
            None => defaults.poll_interval,
        };

        let max_failed_attempts = match get("YCD_MAX_FAILED_ATTEMPTS") {
            // Zero would open the circuit before the first refresh
            Some(raw) => match raw.parse::<u32>() {
                Ok(max) if max > 0 => max,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "YCD_MAX_FAILED_ATTEMPTS",
                        value: raw,
                    })
                }
            },
            None => defaults.max_failed_attempts,
        };

        let config_dir = match get("YCD_CONFIG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .map(|dir| dir.join("ycd"))
                .ok_or(ConfigError::NoConfigDir)?,
        };

        let download_dir = get("YCD_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = Self {
            api_url,
            helper_url: get("YCD_HELPER_URL").unwrap_or_else(|| HELPER_URL.to_string()),
            poll_interval,
            max_failed_attempts,
            session_path: config_dir.join("session.json"),
            batch_path: config_dir.join("batch_job.json"),
            download_dir,
        };
        debug!(api_url = %config.api_url, "Loaded client configuration");
        Ok(config)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            poll_interval: self.poll_interval,
            max_failed_attempts: self.max_failed_attempts,
        }
    }
}

/// Pick the backend base URL
///
/// An explicit URL wins. Otherwise the hostname decides: localhost maps to
/// the local dev server, a private network address to a dev server on that
/// host, anything else to production.
pub fn resolve_api_url(explicit: Option<&str>, hostname: Option<&str>) -> String {
    if let Some(url) = explicit {
        return url.trim_end_matches('/').to_string();
    }

    let host = match hostname {
        Some(host) => host,
        None => return PRODUCTION_API_URL.to_string(),
    };

    if host.eq_ignore_ascii_case("localhost") {
        return format!("http://localhost:{}", DEV_API_PORT);
    }

    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => format!("http://localhost:{}", DEV_API_PORT),
        Ok(IpAddr::V4(v4)) if v4.is_private() || v4.is_link_local() => {
            format!("http://{}:{}", v4, DEV_API_PORT)
        }
        _ => PRODUCTION_API_URL.to_string(),
    }
}
