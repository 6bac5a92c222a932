//! Error taxonomy for the bridge.
//!
//! Library operations return [`BridgeError`]; the CLI wraps them in
//! `anyhow` with context. Retry decisions at the request layer are made
//! from [`BridgeError::is_retryable`].

use std::time::Duration;

/// Errors produced while talking to the source API, building documents,
/// or persisting sync state.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Credentials rejected (401/403). Fatal for the whole sync.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Source API answered 429.
    #[error("rate limited by source API")]
    RateLimited {
        /// Server-provided `Retry-After`, when present.
        retry_after: Option<Duration>,
    },

    /// Source API answered 5xx.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// Record or sub-resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other 4xx. Not retried.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    /// Connection, timeout, or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A record from the source could not be parsed.
    #[error("invalid record: {0}")]
    Validation(String),

    /// Checkpoint could not be written.
    #[error("checkpoint persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// The sync was cancelled between pages.
    #[error("sync cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Whether the request that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::RateLimited { .. } | BridgeError::Server { .. } | BridgeError::Transport(_)
        )
    }

    /// Whether this error must abort the whole sync rather than one kind.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Auth(_) | BridgeError::Persistence(_) | BridgeError::Cancelled
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Validation(e.to_string())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BridgeError::RateLimited { retry_after: None }.is_retryable());
        assert!(BridgeError::Server {
            status: 502,
            body: String::new()
        }
        .is_retryable());
        assert!(BridgeError::Transport("reset".into()).is_retryable());
        assert!(!BridgeError::Auth("bad key".into()).is_retryable());
        assert!(!BridgeError::NotFound("tickets/1".into()).is_retryable());
        assert!(!BridgeError::Client {
            status: 422,
            body: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(BridgeError::Auth("x".into()).is_fatal());
        assert!(BridgeError::Cancelled.is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro");
        assert!(BridgeError::Persistence(io).is_fatal());
        assert!(!BridgeError::Validation("no id".into()).is_fatal());
    }

    #[test]
    fn io_error_wraps_as_persistence() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: BridgeError = inner.into();
        assert!(err.to_string().contains("checkpoint persistence"));
    }
}
