//! Common test utilities for E2E tests

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use linedeck::data::{Account, Channel, EntityId, hash_bearer_token};
use linedeck::error::AppError;
use linedeck::line::{MessagingApi, UserProfile};
use linedeck::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_API_TOKEN: &str = "test-api-token";
pub const TEST_BOT_TOKEN: &str = "test-bot-token";
pub const TEST_CHANNEL_SECRET: &str = "test-channel-secret";

/// Provider API stub recording every outbound call
#[derive(Default)]
pub struct RecordingApi {
    pub replies: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
    pub pushes: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
    pub multicasts: Mutex<Vec<Vec<String>>>,
    pub broadcasts: Mutex<u64>,
}

#[async_trait]
impl MessagingApi for RecordingApi {
    async fn reply(
        &self,
        _access_token: &str,
        reply_token: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn push(
        &self,
        _access_token: &str,
        to: &str,
        messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.pushes
            .lock()
            .unwrap()
            .push((to.to_string(), messages.to_vec()));
        Ok(())
    }

    async fn multicast(
        &self,
        _access_token: &str,
        to: &[String],
        _messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        self.multicasts.lock().unwrap().push(to.to_vec());
        Ok(())
    }

    async fn broadcast(
        &self,
        _access_token: &str,
        _messages: &[serde_json::Value],
    ) -> Result<(), AppError> {
        *self.broadcasts.lock().unwrap() += 1;
        Ok(())
    }

    async fn get_profile(
        &self,
        _access_token: &str,
        _line_user_id: &str,
    ) -> Result<Option<UserProfile>, AppError> {
        Ok(None)
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub api: Arc<RecordingApi>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Spin up a full server on a random port with a stub provider.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
                domain: "test.example.com".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            line: config::LineConfig {
                api_base_url: "https://api.line.invalid".to_string(),
                request_timeout_seconds: 5,
                allow_unsigned_webhooks: false,
            },
            broadcast: config::BroadcastConfig {
                batch_size: 2,
                batch_delay_ms: 0,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let api: Arc<RecordingApi> = Arc::new(RecordingApi::default());
        let state = AppState::with_messaging(config, api.clone()).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = linedeck::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            api,
            _temp_dir: temp_dir,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Seed an account whose API/bot tokens are the well-known test
    /// tokens.
    pub async fn create_test_account(&self) -> Account {
        let now = Utc::now();
        let account = Account {
            id: EntityId::new().0,
            username: "testuser".to_string(),
            api_token_hash: Some(hash_bearer_token(TEST_API_TOKEN)),
            bot_token_hash: Some(hash_bearer_token(TEST_BOT_TOKEN)),
            created_at: now,
            updated_at: now,
        };
        self.state.db.insert_account(&account).await.unwrap();
        account
    }

    /// Seed an active channel owned by the given account.
    pub async fn create_test_channel(&self, account: &Account) -> Channel {
        let now = Utc::now();
        let channel = Channel {
            id: EntityId::new().0,
            account_id: account.id.clone(),
            line_channel_id: "1654000000".to_string(),
            channel_secret: TEST_CHANNEL_SECRET.to_string(),
            access_token: "test-access-token".to_string(),
            name: "Support".to_string(),
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.state.db.register_channel(&channel).await.unwrap()
    }

    /// Provider-shaped webhook body with one text message event.
    pub fn text_webhook_body(user_id: &str, text: &str, reply_token: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "destination": "U_dest",
            "events": [{
                "type": "message",
                "replyToken": reply_token,
                "source": { "type": "user", "userId": user_id },
                "timestamp": 1700000000000u64,
                "message": { "id": "100001", "type": "text", "text": text }
            }]
        }))
        .unwrap()
    }

    /// Deliver a signed webhook for the given channel.
    pub async fn post_signed_webhook(
        &self,
        channel: &Channel,
        body: Vec<u8>,
    ) -> reqwest::Response {
        let signature = linedeck::line::sign_body(&channel.channel_secret, &body).unwrap();
        self.client
            .post(self.url(&format!("/webhook/{}", channel.id)))
            .header("content-type", "application/json")
            .header("x-line-signature", signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}
