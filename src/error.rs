//! Error types for the reminder engine

use std::io;

use thiserror::Error;

/// Result type alias for the reminder engine
pub type Result<T> = std::result::Result<T, Error>;

/// Reminder engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable storage error (unreadable file, failed write)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Durable storage refused a write because it is full
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The REST collaborator answered with an error
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status (or 200 when the envelope carried a non-zero code)
        status: u16,
        /// Server-provided message
        message: String,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Scheduler already torn down
    #[error("Scheduler shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an API error
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Whether the error came from durable storage rather than the network
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::QuotaExceeded(_))
    }
}
