//! Persisted login session
//!
//! The session lives in a watch channel so the poller and other tasks can
//! react to logout. It is mirrored to `~/.config/ycd/session.json` so a
//! restart restores it. `SessionStore` is the only writer of that file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Account details returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// An authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub user: UserProfile,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(token: impl Into<String>, user: UserProfile) -> Self {
        Self {
            token: token.into(),
            user,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to write session file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Holds the current session, optionally backed by a file
pub struct SessionStore {
    path: Option<PathBuf>,
    tx: watch::Sender<Option<Session>>,
}

impl SessionStore {
    /// Default location of the session file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ycd").join("session.json"))
    }

    /// Session store that never touches disk
    pub fn in_memory() -> Self {
        let (tx, _) = watch::channel(None);
        Self { path: None, tx }
    }

    /// Open a file-backed store, restoring any saved session
    ///
    /// A missing or unreadable file starts logged out.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let restored = Self::read_file(&path);
        if let Some(session) = &restored {
            debug!(user = %session.user.username, "Restored saved session");
        }
        let (tx, _) = watch::channel(restored);
        Self {
            path: Some(path),
            tx,
        }
    }

    fn read_file(path: &Path) -> Option<Session> {
        if !path.exists() {
            return None;
        }
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read session file");
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable session file");
                None
            }
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.token.clone())
    }

    pub fn is_active(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Watch for login/logout
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }

    /// Replace the session and persist it
    pub fn set(&self, session: Session) -> Result<(), SessionError> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&session)?;
            write_private(path, json.as_bytes())?;
        }
        debug!(user = %session.user.username, "Session stored");
        self.tx.send_replace(Some(session));
        Ok(())
    }

    /// Drop the session (logout or rejected token)
    pub fn clear(&self) {
        let previous = self.tx.send_replace(None);
        if previous.is_none() {
            return;
        }
        if let Some(path) = &self.path {
            if path.exists() {
                if let Err(e) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to delete session file");
                }
            }
        }
        debug!("Session cleared");
    }
}

/// Write a file only the current user can read, replacing it atomically
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    // Mode only applies to a freshly created file
    let _ = fs::remove_file(&tmp);
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let written = options.open(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
