//! Background renewal of the access token.
//!
//! The loop sleeps until five minutes before expiry, performs a
//! refresh-grant exchange, and on any failure retries on a fixed
//! one-minute backoff — indefinitely, preserving the last-known-good
//! access token for continued service until renewal succeeds.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::oauth::{self, ProviderConfig};
use crate::token_store::{TokenStore, epoch_secs};

/// Refresh this long before the access token expires.
pub const REFRESH_MARGIN_SECS: u64 = 5 * 60;

/// Fixed backoff between retries after a failed refresh.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Recomputes the next renewal instant from the current expiry, sleeps
/// until then, and triggers a refresh-token-grant exchange.
pub struct RefreshScheduler {
    store: Arc<TokenStore>,
    config: ProviderConfig,
    client: reqwest::Client,
    margin_secs: u64,
    retry_backoff: Duration,
}

impl RefreshScheduler {
    pub fn new(store: Arc<TokenStore>, config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            store,
            config,
            client: oauth::http_client()?,
            margin_secs: REFRESH_MARGIN_SECS,
            retry_backoff: RETRY_BACKOFF,
        })
    }

    /// Override the renewal margin. Primarily for tests.
    pub fn with_refresh_margin(mut self, secs: u64) -> Self {
        self.margin_secs = secs;
        self
    }

    /// Override the failure backoff. Primarily for tests.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Perform one refresh-grant exchange and update the store.
    ///
    /// A persist failure is logged but does not fail the refresh: the
    /// in-memory credential is already usable.
    pub async fn refresh_once(&self) -> Result<()> {
        let refresh_token = self.store.refresh_token().await;
        let token = oauth::refresh_access_token(&self.client, &self.config, &refresh_token).await?;

        let expires_at = epoch_secs() + token.expires_in;
        self.store
            .set(&token.access_token, token.refresh_token.as_deref(), expires_at)
            .await;
        if let Err(e) = self.store.persist().await {
            tracing::warn!(err = %e, "failed to persist refresh token, in-memory credential still usable");
        }
        tracing::info!(expires_in = token.expires_in, "access token refreshed");
        Ok(())
    }

    /// Run the renewal loop until `cancel` is triggered.
    ///
    /// With an untriggered token this runs for the process lifetime.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let expires_at = self.store.expires_at().await;
            let now = epoch_secs();
            let refresh_at = expires_at.saturating_sub(self.margin_secs);

            if refresh_at > now {
                let wait = Duration::from_secs(refresh_at - now);
                tracing::debug!(secs = wait.as_secs(), "sleeping until next token renewal");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            } else {
                tracing::debug!("token expiry is imminent, refreshing now");
            }

            if cancel.is_cancelled() {
                return;
            }

            if let Err(e) = self.refresh_once().await {
                // The refresh token is kept; transient outages and a
                // revoked token look identical here and both get the
                // fixed backoff.
                tracing::warn!(err = %e, "background refresh failed, retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
            }
        }
    }
}
