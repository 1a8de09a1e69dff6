//! Authoritative in-memory holder of the current credential.
//!
//! Reads and writes are serialized through a single-writer/multi-reader
//! lock. Only the refresh token is persisted to disk; the access token
//! and expiry are always re-derived by a refresh after restart.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthError, Result};

/// The managed credential.
///
/// `refresh_token` is empty iff the process has never completed
/// authorization. `expires_at` is epoch seconds; 0 means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: u64,
}

/// The durable record. A single field by design: access tokens are
/// short-lived and not worth persisting.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedToken {
    refresh_token: String,
}

/// Concurrency-safe credential store with refresh-token persistence.
///
/// No operation here performs network I/O.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    credential: RwLock<Credential>,
}

impl TokenStore {
    /// Create a store backed by the given record path. Nothing is read
    /// until [`restore`](Self::restore).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            credential: RwLock::new(Credential::default()),
        }
    }

    /// Path of the durable record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The latest known access token. Possibly empty or stale; the
    /// caller must tolerate serving one request on a token that expires
    /// imminently.
    pub async fn current_access_token(&self) -> String {
        self.credential.read().await.access_token.clone()
    }

    /// The current refresh token (empty if never authorized).
    pub async fn refresh_token(&self) -> String {
        self.credential.read().await.refresh_token.clone()
    }

    /// Expiry of the current access token, epoch seconds.
    pub async fn expires_at(&self) -> u64 {
        self.credential.read().await.expires_at
    }

    /// A consistent copy of the whole credential.
    pub async fn snapshot(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Atomically replace the credential.
    ///
    /// The refresh token is updated only when the caller supplies a
    /// non-empty value; providers may omit it on refresh, meaning "keep
    /// the existing one".
    pub async fn set(&self, access_token: &str, refresh_token: Option<&str>, expires_at: u64) {
        let mut cred = self.credential.write().await;
        cred.access_token = access_token.to_string();
        if let Some(rt) = refresh_token
            && !rt.is_empty()
        {
            cred.refresh_token = rt.to_string();
        }
        cred.expires_at = expires_at;
    }

    /// Reset to the never-authorized state. Used when a restored refresh
    /// token is proven invalid.
    pub async fn clear(&self) {
        let mut cred = self.credential.write().await;
        *cred = Credential::default();
    }

    /// Serialize the refresh token to the durable record, overwriting
    /// any previous content. The file is created owner read/write only.
    pub async fn persist(&self) -> Result<()> {
        let record = PersistedToken {
            refresh_token: self.credential.read().await.refresh_token.clone(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| AuthError::Io(format!("serialize token record: {e}")))?;
        write_restricted(&self.path, &json)?;
        tracing::debug!(path = %self.path.display(), "refresh token persisted");
        Ok(())
    }

    /// Read the durable record and populate the refresh token.
    ///
    /// Returns `Ok(false)` when no record exists. The access token and
    /// expiry are left at their zero values; the caller must refresh
    /// before first use.
    pub async fn restore(&self) -> Result<bool> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let record: PersistedToken = serde_json::from_str(&contents)
            .map_err(|e| AuthError::Io(format!("malformed token record: {e}")))?;

        let mut cred = self.credential.write().await;
        *cred = Credential {
            refresh_token: record.refresh_token,
            ..Credential::default()
        };
        Ok(true)
    }
}

#[cfg(unix)]
fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Current time as epoch seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
