//! Composition root for the credential lifecycle.
//!
//! Startup: restore the persisted refresh token (or run the device-code
//! flow), validate it with one eager refresh, persist, then hand
//! control to the background scheduler. The request path reads the
//! current token through [`current_access_token`](CredentialManager::current_access_token),
//! which never performs network I/O.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::device_code;
use crate::error::Result;
use crate::oauth::{self, ProviderConfig};
use crate::scheduler::RefreshScheduler;
use crate::token_store::{TokenStore, epoch_secs};

/// Manages exactly one credential for the process lifetime.
pub struct CredentialManager {
    store: Arc<TokenStore>,
    config: ProviderConfig,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl CredentialManager {
    pub fn new(config: ProviderConfig, token_path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: Arc::new(TokenStore::new(token_path)),
            config,
            client: oauth::http_client()?,
            cancel: CancellationToken::new(),
        })
    }

    /// The underlying store, shared with the request path.
    pub fn store(&self) -> Arc<TokenStore> {
        self.store.clone()
    }

    /// Restore-or-authenticate, validate, then launch the background
    /// renewal loop. Run once at process startup; an error here means
    /// the process cannot serve authenticated traffic.
    pub async fn start(&self) -> Result<()> {
        tracing::info!("initializing credential manager");

        match self.store.restore().await {
            Ok(true) => tracing::info!("restored refresh token from disk"),
            Ok(false) => tracing::info!("no persisted refresh token found"),
            Err(e) => tracing::warn!(err = %e, "could not restore persisted refresh token"),
        }

        if self.store.refresh_token().await.is_empty() {
            tracing::info!("starting device code flow");
            self.authenticate().await?;
        }

        // One eager refresh validates whichever refresh token is now
        // held. If it fails the token is unusable (revoked, expired, or
        // from a stale record): discard it and authenticate once more.
        let scheduler = self.scheduler()?;
        if let Err(e) = scheduler.refresh_once().await {
            tracing::warn!(err = %e, "startup refresh failed, re-running device code flow");
            self.store.clear().await;
            self.authenticate().await?;
        }

        if let Err(e) = self.store.persist().await {
            tracing::warn!(err = %e, "could not persist refresh token");
        }

        tokio::spawn(scheduler.run(self.cancel.clone()));
        Ok(())
    }

    /// The latest known access token for `Authorization: Bearer` use.
    /// Non-blocking apart from the store's reader lock.
    pub async fn current_access_token(&self) -> String {
        self.store.current_access_token().await
    }

    /// Stop the background renewal loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn scheduler(&self) -> Result<RefreshScheduler> {
        RefreshScheduler::new(self.store.clone(), self.config.clone())
    }

    /// Run the device-code flow to completion: issuance, operator
    /// prompt, poll until sign-in. Blocks the caller until the operator
    /// finishes or the provider returns a terminal error.
    async fn authenticate(&self) -> Result<()> {
        let device = device_code::request_device_code(&self.client, &self.config).await?;

        println!();
        println!("=======================================================");
        println!("ACTION REQUIRED: sign in to authorize this proxy");
        println!();
        println!("{}", device_code::operator_prompt(&device));
        println!("=======================================================");
        println!();

        tracing::info!(interval = device.interval, "waiting for operator sign-in");
        let token = device_code::poll_for_tokens(&self.client, &self.config, &device).await?;

        self.store
            .set(
                &token.access_token,
                token.refresh_token.as_deref(),
                epoch_secs() + token.expires_in,
            )
            .await;
        tracing::info!("device authorization complete");
        Ok(())
    }
}
