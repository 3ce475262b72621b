//! Image composition for generated art
//!
//! Normalizes fetched photos to a fixed frame and re-encodes them as PNG.

pub mod mock;
pub mod processor;

pub use mock::MockImageProcessor;
pub use processor::ImageProcessor;

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ImageService: Send + Sync {
    async fn render_png(&self, image_data: &[u8]) -> Result<Vec<u8>>;
}
