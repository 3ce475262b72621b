//! Error handling and custom error types
//!
//! Provides unified error handling across the application using thiserror.
//! The quota ledger has its own narrow taxonomy ([`QuotaError`]) so callers
//! can tell "storage is down" apart from "bad client identifier".

use thiserror::Error;

/// Errors originating in the quota ledger and its counter stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Usage store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Invalid client identifier: {reason}")]
    InvalidClient { reason: String },
}

impl QuotaError {
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn invalid_client(reason: impl Into<String>) -> Self {
        Self::InvalidClient {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("AI provider error: {0}")]
    AiProvider(String),

    #[error("Photo provider error: {0}")]
    PhotoProvider(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;
