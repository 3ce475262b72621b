//! Request handlers for the chat and metered generate endpoints.
//!
//! Handlers return a [`HandlerResponse`] carrying the HTTP status and body the
//! web layer should send, so the quota contract can be exercised without a
//! server.

use crate::ai::{ChatService, OpenRouterChatClient};
use crate::error::QuotaError;
use crate::image::{ImageProcessor, ImageService};
use crate::models::{
    ChatReply, ChatRequest, Config, ErrorBody, GenerateRequest, QuotaBackend, DEFAULT_THEME,
};
use crate::photos::{PhotoService, UnsplashClient};
use crate::prompts;
use crate::quota::{
    ClientId, CounterStore, Decision, KvCounterStore, MemoryCounterStore, QuotaLedger,
    SqliteCounterStore,
};
use crate::Result;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const SUBSCRIPTION_REQUIRED: &str = "Subscription Required";
pub const USAGE_UNAVAILABLE: &str = "Usage tracking unavailable";
pub const GENERATE_FAILED: &str = "Failed to generate";

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Png(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub body: ResponseBody,
}

impl HandlerResponse {
    fn json<T: serde::Serialize>(status: StatusCode, body: &T) -> Self {
        let value = serde_json::to_value(body)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }));
        Self {
            status,
            body: ResponseBody::Json(value),
        }
    }

    fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, &ErrorBody::new(message))
    }

    fn png(bytes: Vec<u8>) -> Self {
        Self {
            status: StatusCode::OK,
            body: ResponseBody::Png(bytes),
        }
    }
}

/// Build the quota ledger for the configured backend.
///
/// Durable backends get their schema created up front so a broken database
/// path fails at startup rather than on the first request.
pub async fn build_ledger(config: &Config) -> Result<QuotaLedger> {
    let store: Arc<dyn CounterStore> = match config.quota_backend {
        QuotaBackend::Memory => {
            warn!("Using in-memory quota store; usage counts reset on restart");
            Arc::new(MemoryCounterStore::new())
        }
        QuotaBackend::Sqlite => {
            let store = SqliteCounterStore::new(&config.quota_db_path)
                .with_max_retries(config.store_retries);
            store.init().await?;
            info!("Quota store: sqlite ({})", store.path().display());
            Arc::new(store)
        }
        QuotaBackend::Kv => {
            let store =
                KvCounterStore::new(&config.quota_db_path).with_max_retries(config.store_retries);
            store.init().await?;
            info!("Quota store: key/value ({})", store.path().display());
            Arc::new(store)
        }
    };

    Ok(QuotaLedger::new(store, config.free_limit).with_store_timeout(config.store_timeout))
}

/// Wires the quota ledger in front of the paid collaborators.
pub struct App {
    ledger: QuotaLedger,
    chat: Box<dyn ChatService>,
    photos: Box<dyn PhotoService>,
    image: Box<dyn ImageService>,
}

/// Injectable service bundle used to construct [`App`] in tests/harnesses.
pub struct AppServices {
    pub ledger: QuotaLedger,
    pub chat: Box<dyn ChatService>,
    pub photos: Box<dyn PhotoService>,
    pub image: Box<dyn ImageService>,
}

impl App {
    pub fn with_services(services: AppServices) -> Self {
        Self {
            ledger: services.ledger,
            chat: services.chat,
            photos: services.photos,
            image: services.image,
        }
    }

    /// Construct an app from configuration; both provider keys are required.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let chat = OpenRouterChatClient::new(
            config.require_openrouter_key()?,
            config.chat_model.clone(),
        )?;
        info!("Chat provider: OpenRouter (model: {})", config.chat_model);
        let photos = UnsplashClient::new(config.require_unsplash_key()?)?;

        Ok(Self::with_services(AppServices {
            ledger: build_ledger(config).await?,
            chat: Box::new(chat),
            photos: Box::new(photos),
            image: Box::new(ImageProcessor::new()),
        }))
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Metered endpoint: one free use is spent before the paid photo fetch.
    ///
    /// A use spent on a request that later fails is not refunded.
    pub async fn generate(&self, client: &str, request: GenerateRequest) -> HandlerResponse {
        let client = match ClientId::parse(client) {
            Ok(client) => client,
            Err(e) => {
                warn!("Rejected generate request: {}", e);
                return HandlerResponse::error(StatusCode::BAD_REQUEST, &e.to_string());
            }
        };

        match self.ledger.try_consume(&client).await {
            Ok(Decision::Allowed { used }) => {
                info!(
                    client = %client,
                    "Free generation {}/{}",
                    used,
                    self.ledger.free_limit()
                );
            }
            Ok(Decision::Denied) => {
                return HandlerResponse::error(StatusCode::FORBIDDEN, SUBSCRIPTION_REQUIRED);
            }
            Err(e) => {
                error!(client = %client, "Quota check failed, refusing generation: {}", e);
                return HandlerResponse::error(StatusCode::SERVICE_UNAVAILABLE, USAGE_UNAVAILABLE);
            }
        }

        // Only a missing theme falls back; an explicit one is passed as given.
        let theme = request.theme.as_deref().unwrap_or(DEFAULT_THEME);

        match self.render_photo(theme).await {
            Ok(png) => HandlerResponse::png(png),
            Err(e) => {
                error!(client = %client, "Generation failed for theme '{}': {}", theme, e);
                HandlerResponse::error(StatusCode::INTERNAL_SERVER_ERROR, GENERATE_FAILED)
            }
        }
    }

    /// Free endpoint: reads the ledger only to choose the persona's tone.
    pub async fn chat(&self, client: &str, request: ChatRequest) -> HandlerResponse {
        let message = request.message.trim();
        if message.is_empty() {
            return HandlerResponse::error(StatusCode::BAD_REQUEST, "Message required");
        }

        let sass = self.sass_for(client).await;
        let system_prompt = prompts::chat_system_prompt(sass);

        let reply = match self.chat.reply(&system_prompt, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Chat provider failed, sending fallback reply: {}", e);
                prompts::FALLBACK_REPLY.to_string()
            }
        };

        HandlerResponse::json(StatusCode::OK, &ChatReply { reply })
    }

    async fn sass_for(&self, client: &str) -> bool {
        let hint = match ClientId::parse(client) {
            Ok(client) => self.ledger.sass_hint(&client).await,
            Err(e) => Err(e),
        };

        match hint {
            Ok(sass) => sass,
            Err(QuotaError::InvalidClient { reason }) => {
                warn!("Chat from unidentifiable client ({}), using default tone", reason);
                false
            }
            Err(e) => {
                warn!("Could not read usage for tone selection: {}", e);
                false
            }
        }
    }

    async fn render_photo(&self, theme: &str) -> Result<Vec<u8>> {
        let photo = self.photos.fetch_photo(theme).await?;
        self.image.render_png(&photo).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockChatClient;
    use crate::image::MockImageProcessor;
    use crate::photos::MockPhotoClient;
    use crate::quota::MockCounterStore;
    use pretty_assertions::assert_eq;
    use std::num::NonZeroU64;

    struct Probes {
        store: MockCounterStore,
        chat: MockChatClient,
        photos: MockPhotoClient,
    }

    fn build_test_app(free_limit: u64) -> (App, Probes) {
        let store = MockCounterStore::new();
        let chat = MockChatClient::new().with_response("Sure, genius.".to_string());
        let photos = MockPhotoClient::new().with_photo(vec![7, 7, 7]);

        let app = App::with_services(AppServices {
            ledger: QuotaLedger::new(
                Arc::new(store.clone()),
                NonZeroU64::new(free_limit).unwrap(),
            ),
            chat: Box::new(chat.clone()),
            photos: Box::new(photos.clone()),
            image: Box::new(MockImageProcessor::new()),
        });

        (
            app,
            Probes {
                store,
                chat,
                photos,
            },
        )
    }

    fn generate_request(theme: Option<&str>) -> GenerateRequest {
        GenerateRequest {
            theme: theme.map(str::to_string),
        }
    }

    fn chat_request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
        }
    }

    fn error_of(response: &HandlerResponse) -> String {
        match &response.body {
            ResponseBody::Json(value) => value["error"].as_str().unwrap_or_default().to_string(),
            ResponseBody::Png(_) => panic!("Expected JSON body, got PNG"),
        }
    }

    #[tokio::test]
    async fn test_generate_returns_png_until_quota_then_403() {
        let (app, probes) = build_test_app(2);

        for _ in 0..2 {
            let response = app.generate("10.0.0.1", generate_request(Some("ocean"))).await;
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.body, ResponseBody::Png(vec![7, 7, 7]));
        }

        let response = app.generate("10.0.0.1", generate_request(Some("ocean"))).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(error_of(&response), SUBSCRIPTION_REQUIRED);
        assert_eq!(probes.photos.get_fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_generate_defaults_only_missing_theme() {
        let (app, probes) = build_test_app(5);

        app.generate("c", generate_request(None)).await;
        app.generate("c", generate_request(Some(""))).await;
        app.generate("c", generate_request(Some("desert"))).await;

        assert_eq!(probes.photos.get_themes(), vec!["nature", "", "desert"]);
    }

    #[tokio::test]
    async fn test_generate_store_failure_is_503_and_skips_paid_call() {
        let (app, probes) = build_test_app(5);
        probes.store.set_write_failure(true);

        let response = app.generate("c", generate_request(None)).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_of(&response), USAGE_UNAVAILABLE);
        assert_eq!(probes.photos.get_fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_invalid_client_is_400_without_storage_access() {
        let (app, probes) = build_test_app(5);

        let response = app.generate("", generate_request(None)).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(probes.store.get_increment_count(), 0);
        assert_eq!(probes.photos.get_fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_provider_failure_is_500_and_use_is_spent() {
        let store = MockCounterStore::new();
        let app = App::with_services(AppServices {
            ledger: QuotaLedger::new(Arc::new(store.clone()), NonZeroU64::new(5).unwrap()),
            chat: Box::new(MockChatClient::new()),
            photos: Box::new(MockPhotoClient::new().with_failure(true)),
            image: Box::new(MockImageProcessor::new()),
        });

        let response = app.generate("c", generate_request(None)).await;

        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_of(&response), GENERATE_FAILED);
        let c = ClientId::parse("c").unwrap();
        assert_eq!(app.ledger().remaining(&c).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_chat_switches_to_sass_when_exhausted_without_consuming() {
        let (app, probes) = build_test_app(1);

        let response = app.chat("c", chat_request("hello")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.body,
            ResponseBody::Json(serde_json::json!({ "reply": "Sure, genius." }))
        );

        app.generate("c", generate_request(None)).await;
        app.chat("c", chat_request("hello again")).await;

        let prompts_seen = probes.chat.get_system_prompts();
        assert_eq!(prompts_seen.len(), 2);
        assert!(!prompts_seen[0].contains("broke"));
        assert!(prompts_seen[1].contains("broke"));

        // Only the generate call touched the counter.
        assert_eq!(probes.store.get_increment_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_falls_back_when_provider_fails() {
        let store = MockCounterStore::new();
        let app = App::with_services(AppServices {
            ledger: QuotaLedger::new(Arc::new(store), NonZeroU64::new(5).unwrap()),
            chat: Box::new(MockChatClient::new().with_failure(true)),
            photos: Box::new(MockPhotoClient::new()),
            image: Box::new(MockImageProcessor::new()),
        });

        let response = app.chat("c", chat_request("hi")).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            response.body,
            ResponseBody::Json(serde_json::json!({ "reply": prompts::FALLBACK_REPLY }))
        );
    }

    #[tokio::test]
    async fn test_chat_survives_unavailable_ledger() {
        let chat = MockChatClient::new();
        let app = App::with_services(AppServices {
            ledger: QuotaLedger::new(
                Arc::new(MockCounterStore::new().with_failure(true)),
                NonZeroU64::new(5).unwrap(),
            ),
            chat: Box::new(chat.clone()),
            photos: Box::new(MockPhotoClient::new()),
            image: Box::new(MockImageProcessor::new()),
        });

        let response = app.chat("c", chat_request("hi")).await;

        assert_eq!(response.status, StatusCode::OK);
        assert!(!chat.get_system_prompts()[0].contains("broke"));
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let (app, probes) = build_test_app(5);

        let response = app.chat("c", chat_request("  ")).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(probes.chat.get_call_count(), 0);
    }

    #[tokio::test]
    async fn test_build_ledger_memory_backend() {
        let config = Config::from_lookup(|key| match key {
            "QUOTA_BACKEND" => Some("memory".to_string()),
            "FREE_LIMIT" => Some("2".to_string()),
            _ => None,
        })
        .unwrap();

        let ledger = build_ledger(&config).await.unwrap();
        assert_eq!(ledger.free_limit(), 2);
    }

    #[tokio::test]
    async fn test_build_ledger_rejects_unopenable_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = dir.path().to_string_lossy().to_string();
        let config = Config::from_lookup(|key| match key {
            "QUOTA_DB_PATH" => Some(db_dir.clone()),
            "QUOTA_STORE_RETRIES" => Some("0".to_string()),
            _ => None,
        })
        .unwrap();

        assert!(build_ledger(&config).await.is_err());
    }
}
