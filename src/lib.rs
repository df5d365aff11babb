//! linedeck - a multi-tenant LINE Official Account inbox server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Provider webhook + bot log endpoints                     │
//! │  - Dashboard API (messages, broadcasts, channels, grants)   │
//! │  - SSE streaming                                            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Entity resolution, ingestion, auto-reply, access gate    │
//! │  - Outbound dispatch and broadcast fan-out                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: business logic
//! - `line`: provider client, signatures, dispatch, broadcast
//! - `realtime`: SSE connection registry
//! - `data`: database layer
//! - `auth`: bearer-token authentication
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod line;
pub mod metrics;
pub mod realtime;
pub mod service;

use std::sync::Arc;

use line::{BroadcastRunner, LineClient, MessagingApi, OutboundDispatcher};
use realtime::Notifier;
use service::{AccessGate, EntityResolver, IngestService};

/// Application state shared across all handlers
///
/// Cloned per request; everything inside is an `Arc` or a cheap
/// handle wrapping one.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub db: Arc<data::Database>,
    pub notifier: Arc<Notifier>,
    pub line: Arc<dyn MessagingApi>,
    pub resolver: EntityResolver,
    pub dispatcher: OutboundDispatcher,
    pub ingest: IngestService,
    pub gate: AccessGate,
    pub broadcasts: Arc<BroadcastRunner>,
}

impl AppState {
    /// Initialize application state against the real provider API.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened/migrated or
    /// the HTTP client cannot be built.
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("linedeck/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(
                config.line.request_timeout_seconds,
            ))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let line: Arc<dyn MessagingApi> = Arc::new(LineClient::new(
            Arc::new(http_client),
            config.line.api_base_url.clone(),
        ));

        Self::with_messaging(config, line).await
    }

    /// Initialize application state with a caller-supplied provider
    /// API implementation. Tests inject recording stubs here.
    pub async fn with_messaging(
        config: config::AppConfig,
        line: Arc<dyn MessagingApi>,
    ) -> Result<Self, error::AppError> {
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let notifier = Arc::new(Notifier::new());
        let resolver = EntityResolver::new(db.clone(), line.clone());
        let dispatcher = OutboundDispatcher::new(line.clone(), db.clone(), notifier.clone());
        let ingest = IngestService::new(
            db.clone(),
            resolver.clone(),
            dispatcher.clone(),
            notifier.clone(),
        );
        let gate = AccessGate::new(db.clone());
        let broadcasts = Arc::new(BroadcastRunner::new(
            line.clone(),
            db.clone(),
            config.broadcast.clone(),
        ));

        tracing::info!("Application state initialized");

        Ok(Self {
            config: Arc::new(config),
            db,
            notifier,
            line,
            resolver,
            dispatcher,
            ingest,
            gate,
            broadcasts,
        })
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::webhook_router())
        .nest(
            "/api",
            Router::new()
                .merge(api::messages_router())
                .merge(api::broadcast_router())
                .merge(api::streaming_router())
                .merge(api::channels_router())
                .merge(api::permissions_router()),
        )
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
