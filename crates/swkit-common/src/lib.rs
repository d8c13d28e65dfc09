//! # swkit Common
//!
//! Shared error type, logging setup, and retry helpers used by every swkit crate.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - `tracing` subscriber configuration (pretty, compact, JSON)
//! - Retry with exponential backoff and timeout helpers
//! - `Result` extension trait for adding context

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for swkit.
#[derive(Error, Debug)]
pub enum SwKitError {
    /// Configuration could not be loaded or is inconsistent.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl SwKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Transient failures the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwKitError::Timeout(_))
    }

    /// Error category, used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            SwKitError::Config { .. } => "config",
            SwKitError::Json(_) => "json",
            SwKitError::Timeout(_) => "timeout",
            SwKitError::InvalidArgument(_) => "invalid_argument",
            SwKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for swkit operations.
pub type Result<T> = std::result::Result<T, SwKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap the error as an internal error with context.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        let message = message.into();
        self.map_err(|e| SwKitError::Internal {
            message: format!("{message}: {e}"),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}
