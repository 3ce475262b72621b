use super::PhotoService;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.unsplash.com";

#[derive(Debug, Deserialize)]
struct RandomPhoto {
    urls: PhotoUrls,
}

#[derive(Debug, Deserialize)]
struct PhotoUrls {
    regular: String,
}

pub struct UnsplashClient {
    client: Client,
    access_key: String,
    base_url: String,
}

impl UnsplashClient {
    pub fn new(access_key: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            access_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    async fn random_photo(&self, theme: &str) -> Result<RandomPhoto> {
        let url = format!("{}/photos/random", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", theme), ("client_id", self.access_key.as_str())])
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send request to Unsplash: {}", e);
                e
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            tracing::error!("Unsplash API error (status {}): {}", status, error_text);
            return Err(Error::PhotoProvider(format!(
                "Unsplash API error (status {}): {}",
                status, error_text
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::error!("Failed to parse Unsplash response: {}", e);
            Error::PhotoProvider(format!("Failed to parse Unsplash response: {}", e))
        })
    }
}

#[async_trait]
impl PhotoService for UnsplashClient {
    async fn fetch_photo(&self, theme: &str) -> Result<Vec<u8>> {
        let photo = self.random_photo(theme).await?;
        tracing::debug!("Downloading photo for theme '{}'", theme);

        let response = self.client.get(&photo.urls.regular).send().await?;
        if !response.status().is_success() {
            return Err(Error::PhotoProvider(format!(
                "Photo download failed (status {})",
                response.status()
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }
}
