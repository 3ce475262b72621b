use super::PhotoService;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockPhotoClient {
    photo: Arc<Mutex<Option<Vec<u8>>>>,
    themes: Arc<Mutex<Vec<String>>>,
    should_fail: Arc<Mutex<bool>>,
}

impl MockPhotoClient {
    pub fn new() -> Self {
        Self {
            photo: Arc::new(Mutex::new(None)),
            themes: Arc::new(Mutex::new(Vec::new())),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_photo(self, photo: Vec<u8>) -> Self {
        *self.photo.lock().unwrap() = Some(photo);
        self
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    pub fn get_fetch_count(&self) -> usize {
        self.themes.lock().unwrap().len()
    }

    pub fn get_themes(&self) -> Vec<String> {
        self.themes.lock().unwrap().clone()
    }
}

impl Default for MockPhotoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhotoService for MockPhotoClient {
    async fn fetch_photo(&self, theme: &str) -> Result<Vec<u8>> {
        self.themes.lock().unwrap().push(theme.to_string());

        if *self.should_fail.lock().unwrap() {
            return Err(Error::PhotoProvider("Mock failure".to_string()));
        }

        let photo = self.photo.lock().unwrap().clone();
        Ok(photo.unwrap_or_else(|| vec![0x89, 0x50, 0x4E, 0x47]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_photo_records_themes() {
        let client = MockPhotoClient::new().with_photo(vec![1, 2, 3]);

        assert_eq!(client.fetch_photo("cats").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(client.get_fetch_count(), 1);
        assert_eq!(client.get_themes(), vec!["cats"]);
    }

    #[tokio::test]
    async fn test_mock_photo_failure() {
        let client = MockPhotoClient::new().with_failure(true);
        assert!(client.fetch_photo("cats").await.is_err());
    }
}
