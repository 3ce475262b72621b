//! Text-generation collaborator for the chat endpoint
//!
//! Chat is free; the ledger is only consulted to pick the persona's tone.

pub mod client;
pub mod mock;
pub mod types;

pub use client::OpenRouterChatClient;
pub use mock::MockChatClient;

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChatService: Send + Sync {
    async fn reply(&self, system_prompt: &str, message: &str) -> Result<String>;
}
