use super::ImageService;
use crate::{Error, Result};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

pub const OUTPUT_WIDTH: u32 = 800;
pub const OUTPUT_HEIGHT: u32 = 600;

pub struct ImageProcessor {
    width: u32,
    height: u32,
}

impl ImageProcessor {
    pub fn new() -> Self {
        Self {
            width: OUTPUT_WIDTH,
            height: OUTPUT_HEIGHT,
        }
    }

    fn render_sync(image_data: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>> {
        let img = image::load_from_memory(&image_data)?;
        let resized = DynamicImage::ImageRgb8(img.to_rgb8()).resize_exact(
            width,
            height,
            image::imageops::FilterType::Lanczos3,
        );

        let mut out = Vec::new();
        resized.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        Ok(out)
    }
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageService for ImageProcessor {
    async fn render_png(&self, image_data: &[u8]) -> Result<Vec<u8>> {
        let image_data = image_data.to_vec();
        let (width, height) = (self.width, self.height);

        tokio::task::spawn_blocking(move || Self::render_sync(image_data, width, height))
            .await
            .map_err(|e| Error::Invariant(format!("Image processing task join error: {}", e)))?
    }
}
