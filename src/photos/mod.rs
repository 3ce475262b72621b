//! Paid image source for the metered generate endpoint
//!
//! Every call here costs money, so callers must pass the quota gate first.

pub mod client;
pub mod mock;

pub use client::UnsplashClient;
pub use mock::MockPhotoClient;

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PhotoService: Send + Sync {
    /// Fetch one photo matching `theme`, returning the raw encoded bytes.
    async fn fetch_photo(&self, theme: &str) -> Result<Vec<u8>>;
}
