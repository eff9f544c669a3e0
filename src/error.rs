//! Error types for sitedump

use std::io;
use thiserror::Error;

/// Result type for sitedump operations
pub type Result<T> = std::result::Result<T, SiteDumpError>;

/// Errors that can occur in sitedump
#[derive(Debug, Error)]
pub enum SiteDumpError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed URL given to dump/show creation
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected input
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Persistence unavailable or write rejected
    #[error("Store write failed: {0}")]
    StoreWrite(String),

    /// Persistence unavailable or stored data unreadable
    #[error("Store read failed: {0}")]
    StoreRead(String),

    /// Failure while extracting a single captured exchange
    #[error("Failed to process exchange for {url}: {reason}")]
    ExchangeProcessing {
        /// Request URL of the exchange
        url: String,
        /// Underlying cause
        reason: String,
    },

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(i64),

    /// Primary document navigation failed
    #[error("Navigation to {url} failed: {reason}")]
    Navigation {
        /// Navigation target
        url: String,
        /// Underlying cause
        reason: String,
    },

    /// Browsing engine unavailable or misbehaving
    #[error("Browsing engine error: {0}")]
    Engine(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for SiteDumpError {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::QueryReturnedNoRows
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => Self::StoreRead(error.to_string()),
            _ => Self::StoreWrite(error.to_string()),
        }
    }
}

impl SiteDumpError {
    /// Whether this failure is scoped to a single exchange rather than a session
    #[must_use]
    pub fn is_exchange_scoped(&self) -> bool {
        matches!(
            self,
            Self::ExchangeProcessing { .. } | Self::DataTooLarge { .. } | Self::StoreWrite(_)
        )
    }
}
