//! Common test utilities for E2E tests

#![allow(dead_code)]

use apcore::{AppState, config};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const DOMAIN: &str = "test.example.com";
pub const BASE_URL: &str = "https://test.example.com";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

/// Configuration every test server starts from.
pub fn test_config(db_path: std::path::PathBuf) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
            domain: DOMAIN.to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: db_path,
            max_connections: 4,
        },
        federation: config::FederationConfig {
            require_signatures: true,
            // Remote peers are wiremock servers on loopback.
            allow_private_addresses: true,
            fetch_timeout_seconds: 5,
            remote_cache_ttl_days: 7,
            key_bits: 1024,
        },
        collections: config::CollectionsConfig { page_size: 10 },
        queue: config::QueueConfig {
            enabled: false,
            max_idle_seconds: 1,
            claim_ttl_seconds: 300,
            backoff_base_minutes: 3,
            delivery_timeout_seconds: 5,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path().join("test.db"));
        adjust(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router
        let app = apcore::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Request URL for an entity id minted by the server
    pub fn url_of(&self, id: &str) -> String {
        let path = id
            .strip_prefix(BASE_URL)
            .unwrap_or_else(|| panic!("{} is not a local id", id));
        self.url(path)
    }

    /// Store a bearer token for `user_id`, reading collections as `actor_id`
    pub async fn create_test_token(&self, user_id: &str, actor_id: Option<&str>) -> String {
        let token = format!("token-{}", ulid::Ulid::new());
        self.state
            .db
            .insert_access_token(&token, user_id, actor_id)
            .await
            .unwrap();
        token
    }

    /// Create a local actor through the API; returns `(actor document, token)`
    pub async fn create_test_actor(&self, user_id: &str, username: &str) -> (Value, String) {
        let actor_id = format!("{}/users/{}", BASE_URL, username);
        let token = self.create_test_token(user_id, Some(&actor_id)).await;

        let response = self
            .client
            .post(self.url("/actors"))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "preferredUsername": username }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201, "actor creation failed");

        (response.json().await.unwrap(), token)
    }

    /// GET an entity as ActivityPub JSON
    pub async fn get_json(&self, url: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/activity+json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }
}
