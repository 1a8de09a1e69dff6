//! OAuth2 credential lifecycle for the EWS Basic-to-Bearer proxy.
//!
//! Legacy Exchange Web Services mail clients only speak HTTP Basic
//! Authentication. This crate obtains and maintains an OAuth2 bearer
//! credential on their behalf via the device-code flow and substitutes
//! it into every proxied request.
//!
//! # Components
//!
//! - [`device_code`] — device-code issuance and the interactive poll loop
//! - [`token_store`] — concurrency-safe credential holder with refresh-token persistence
//! - [`scheduler`] — background renewal loop (refresh 5 minutes before expiry)
//! - [`manager`] — composition root: restore-or-authenticate, eager validation, detached renewal
//! - [`proxy`] — axum server: Basic-Auth gate and bearer substitution

pub mod device_code;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod proxy;
pub mod scheduler;
pub mod token_store;

pub use error::{AuthError, Result};
pub use manager::CredentialManager;
pub use oauth::{DeviceCodeResponse, ProviderConfig, TokenResponse};
pub use proxy::{GateCredentials, ProxyConfig, ProxyServer};
pub use scheduler::RefreshScheduler;
pub use token_store::{Credential, TokenStore};
