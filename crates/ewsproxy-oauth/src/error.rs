//! Error types for the credential lifecycle.

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Errors that can occur while obtaining or maintaining the credential.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Connection-level or timeout failure. Always retryable.
    #[error("network error: {0}")]
    Transport(String),

    /// The provider returned a response we could not parse.
    #[error("malformed provider response: {0}")]
    Protocol(String),

    /// The provider returned a non-200 status with no structured error.
    #[error("provider rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The provider returned a terminal error field.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// Durable token record read/write failure.
    #[error("token record error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        AuthError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Io(e.to_string())
    }
}
