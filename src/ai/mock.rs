use super::ChatService;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MockChatClient {
    responses: Arc<Mutex<Vec<String>>>,
    system_prompts: Arc<Mutex<Vec<String>>>,
    should_fail: Arc<Mutex<bool>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            system_prompts: Arc::new(Mutex::new(Vec::new())),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn with_response(self, response: String) -> Self {
        self.responses.lock().unwrap().push(response);
        self
    }

    pub fn with_failure(self, should_fail: bool) -> Self {
        *self.should_fail.lock().unwrap() = should_fail;
        self
    }

    pub fn get_call_count(&self) -> usize {
        self.system_prompts.lock().unwrap().len()
    }

    /// System prompts received so far, oldest first.
    pub fn get_system_prompts(&self) -> Vec<String> {
        self.system_prompts.lock().unwrap().clone()
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatService for MockChatClient {
    async fn reply(&self, system_prompt: &str, message: &str) -> Result<String> {
        let mut prompts = self.system_prompts.lock().unwrap();
        prompts.push(system_prompt.to_string());

        if *self.should_fail.lock().unwrap() {
            return Err(Error::AiProvider("Mock failure".to_string()));
        }

        let responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(format!("Oh, you want to know about {}? How quaint.", message))
        } else {
            let index = (prompts.len() - 1) % responses.len();
            Ok(responses[index].clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_chat_default_reply_echoes_message() {
        let client = MockChatClient::new();
        let reply = client.reply("system", "rust").await.unwrap();
        assert!(reply.contains("rust"));
        assert_eq!(client.get_call_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_chat_cycles_responses_and_records_prompts() {
        let client = MockChatClient::new()
            .with_response("first".to_string())
            .with_response("second".to_string());

        assert_eq!(client.reply("a", "x").await.unwrap(), "first");
        assert_eq!(client.reply("b", "x").await.unwrap(), "second");
        assert_eq!(client.reply("c", "x").await.unwrap(), "first");
        assert_eq!(client.get_system_prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_chat_failure() {
        let client = MockChatClient::new().with_failure(true);
        assert!(client.reply("s", "m").await.is_err());
        assert_eq!(client.get_call_count(), 1);
    }
}
