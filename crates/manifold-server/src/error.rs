// crates/manifold-server/src/error.rs
// Standardized error types for Manifold

use thiserror::Error;

/// Main error type for the Manifold library.
///
/// The variants mirror the failure kinds surfaced to the upstream
/// client: callers match on the kind, the message is human-readable,
/// and machine-readable hints (retry delay, original payload) ride on
/// the variant fields.
#[derive(Error, Debug)]
pub enum ManifoldError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("downstream '{name}' unavailable: {reason} (retry in {retry_after_secs}s)")]
    Unavailable {
        name: String,
        reason: String,
        retry_after_secs: u64,
    },

    #[error("deadline exceeded waiting for '{0}'")]
    Timeout(String),

    /// The downstream returned a structured error or the transport
    /// failed non-transiently. The original payload is preserved so it
    /// can be forwarded unchanged.
    #[error("downstream error: {message}")]
    Upstream {
        message: String,
        payload: Option<serde_json::Value>,
    },

    #[error("confirmation required for '{0}'")]
    NeedsConfirmation(String),

    #[error("failed to spawn '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using ManifoldError
pub type Result<T> = std::result::Result<T, ManifoldError>;

impl ManifoldError {
    /// Retry hint in seconds, when the failure carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ManifoldError::Unavailable {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// True for failures worth retrying within the same call window.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ManifoldError::Timeout(_) | ManifoldError::Io(_) | ManifoldError::Http(_)
        )
    }
}

impl From<String> for ManifoldError {
    fn from(s: String) -> Self {
        ManifoldError::Upstream {
            message: s,
            payload: None,
        }
    }
}

impl From<tokio::task::JoinError> for ManifoldError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            ManifoldError::Cancelled
        } else {
            ManifoldError::Fatal(err.to_string())
        }
    }
}
