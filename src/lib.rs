//! apcore - the federation engine of an ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Entity reads, inbox and outbox posts                     │
//! │  - WebSub hub and callbacks                                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Pipeline / Queue                           │
//! │  - Client-to-server and server-to-server handler chains     │
//! │  - Delivery planning, durable job queue and worker          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Entity store chain                           │
//! │  - Staging, synthesized keys and collections                │
//! │  - Remote dereferencing, SQLite (sqlx)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `pipeline`: Activity handler chains
//! - `queue`: Background jobs and the worker that runs them
//! - `entity`: Store chain, flattener and id minting
//! - `collections`: Collection membership
//! - `federation`: Signatures, delivery planning, Atom and Salmon
//! - `websub`: WebSub hub and client
//! - `data`: Documents, models and the database
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod collections;
pub mod config;
pub mod data;
pub mod entity;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod websub;

use std::sync::Arc;
use tokio::sync::Notify;

/// Largest request body accepted.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; everything inside is a shared handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: data::Database,

    /// Activity handler chains
    pub pipeline: Arc<pipeline::Pipeline>,

    /// Remote document fetcher, also owning the document converters
    pub fetcher: Arc<entity::RemoteFetcher>,

    /// WebSub hub for local actors
    pub hub: Arc<websub::WebSubHub>,

    /// Held while an inbound activity or a queued job is processed
    pub processing: pipeline::ProcessingLock,

    /// Wakes the queue worker when jobs are enqueued
    pub queue_notify: Arc<Notify>,

    /// HTTP client for federation
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Initialize application state
    ///
    /// Connects to SQLite (running migrations) and wires the store chain
    /// factory, pipeline and WebSub hub.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or the HTTP client
    /// cannot be built
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path, config.database.max_connections)
            .await?;
        tracing::info!("Database connected");

        Self::from_database(config, db)
    }

    /// Wire application state over an open database.
    pub fn from_database(
        config: config::AppConfig,
        db: data::Database,
    ) -> Result<Self, error::AppError> {
        let config = Arc::new(config);

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("apcore/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let allow_private = config.federation.allow_private_addresses;
        let fetcher = Arc::new(entity::RemoteFetcher::new(
            http_client.clone(),
            entity::ConverterRegistry::new(),
            federation::HostPolicy::new(allow_private),
            std::time::Duration::from_secs(config.federation.fetch_timeout_seconds),
        ));
        let flattener = Arc::new(entity::EntityFlattener::new(Arc::new(
            entity::UlidMinter::new(config.server.base_url()),
        )));
        let stores = Arc::new(entity::EntityStoreFactory::new(
            config.clone(),
            fetcher.clone(),
            flattener,
        ));

        let queue_notify = Arc::new(Notify::new());
        let pipeline = Arc::new(pipeline::Pipeline::new(
            config.clone(),
            stores,
            queue_notify.clone(),
        ));
        let hub = Arc::new(websub::WebSubHub::new(
            http_client.clone(),
            federation::HostPolicy::new(allow_private),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config,
            db,
            pipeline,
            fetcher,
            hub,
            processing: Arc::new(tokio::sync::Mutex::new(())),
            queue_notify,
            http_client,
        })
    }

    /// Build the queue worker for this process.
    ///
    /// Claims are arbitrated through the database so several processes may
    /// share one queue.
    pub fn queue_worker(&self) -> queue::QueueWorker {
        let runner = queue::TaskRunner::new(
            self.config.clone(),
            self.pipeline.clone(),
            self.http_client.clone(),
        );
        queue::QueueWorker::new(
            self.db.clone(),
            runner,
            Arc::new(queue::SqliteClaimLock::new(self.db.clone())),
            self.processing.clone(),
            self.queue_notify.clone(),
            self.config.queue.clone(),
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .merge(api::websub_router())
        .fallback(api::entity_fallback())
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
