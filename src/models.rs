//! Configuration and request/response payloads
//!
//! Configuration is read once at startup from the environment. Payload types
//! mirror the JSON bodies of the chat and generate endpoints.

use crate::quota::{DEFAULT_FREE_LIMIT, DEFAULT_STORE_TIMEOUT};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CHAT_MODEL: &str = "google/gemini-2.0-flash-001";
pub const DEFAULT_THEME: &str = "nature";
const DEFAULT_DB_PATH: &str = "sassmaster.sqlite";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub theme: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// Which counter store backs the quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaBackend {
    /// Process memory only; counts reset on restart.
    Memory,
    /// Atomic upsert on a dedicated SQLite table.
    Sqlite,
    /// Generic key/value table with a locking transaction per increment.
    Kv,
}

impl FromStr for QuotaBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(QuotaBackend::Memory),
            "sqlite" => Ok(QuotaBackend::Sqlite),
            "kv" => Ok(QuotaBackend::Kv),
            other => Err(Error::Config(format!(
                "QUOTA_BACKEND must be one of memory, sqlite, kv (got '{}')",
                other
            ))),
        }
    }
}

// Configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub free_limit: NonZeroU64,
    pub quota_backend: QuotaBackend,
    pub quota_db_path: PathBuf,
    pub store_timeout: Duration,
    pub store_retries: usize,
    pub openrouter_key: Option<String>,
    pub unsplash_key: Option<String>,
    pub chat_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset and blank values fall back
    /// to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let free_limit = match get("FREE_LIMIT") {
            Some(raw) => parse_number::<u64>("FREE_LIMIT", &raw).and_then(|n| {
                NonZeroU64::new(n)
                    .ok_or_else(|| Error::Config("FREE_LIMIT must be greater than 0".to_string()))
            })?,
            None => NonZeroU64::new(DEFAULT_FREE_LIMIT)
                .ok_or_else(|| Error::Invariant("default free limit is zero".to_string()))?,
        };

        let quota_backend = match get("QUOTA_BACKEND") {
            Some(raw) => raw.parse()?,
            None => QuotaBackend::Sqlite,
        };

        let store_timeout = match get("QUOTA_STORE_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(parse_number("QUOTA_STORE_TIMEOUT_MS", &raw)?),
            None => DEFAULT_STORE_TIMEOUT,
        };

        let store_retries = match get("QUOTA_STORE_RETRIES") {
            Some(raw) => parse_number("QUOTA_STORE_RETRIES", &raw)?,
            None => crate::quota::sqlite::DEFAULT_MAX_RETRIES,
        };

        Ok(Self {
            free_limit,
            quota_backend,
            quota_db_path: get("QUOTA_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            store_timeout,
            store_retries,
            openrouter_key: get("OPENROUTER_KEY"),
            unsplash_key: get("UNSPLASH_KEY"),
            chat_model: get("CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        })
    }

    pub fn require_openrouter_key(&self) -> Result<String> {
        self.openrouter_key
            .clone()
            .ok_or_else(|| Error::Config("OPENROUTER_KEY not set".to_string()))
    }

    pub fn require_unsplash_key(&self) -> Result<String> {
        self.unsplash_key
            .clone()
            .ok_or_else(|| Error::Config("UNSPLASH_KEY not set".to_string()))
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer (got '{}')", key, raw)))
}
