//! Worker error type.

use swkit_common::SwKitError;
use swkit_net::NetError;
use thiserror::Error;

/// Errors raised while handling worker events.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    /// The network failed and no cached copy exists.
    #[error("No response for {url}: {reason}")]
    NoResponse { url: String, reason: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Precache error: {0}")]
    Precache(String),

    #[error("Bad precache response for {url}: status {status}")]
    BadPrecacheResponse { url: String, status: u16 },

    #[error("Integrity mismatch for {0}")]
    Integrity(String),

    #[error("Malformed push payload: {0}")]
    Push(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Common(#[from] SwKitError),
}

impl SwError {
    /// Whether a fallback substitute may stand in for this failure.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SwError::Network(e) => e.is_transient(),
            SwError::NoResponse { .. } => true,
            SwError::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type SwResult<T> = Result<T, SwError>;
