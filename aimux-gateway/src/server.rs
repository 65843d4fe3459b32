//! HTTP server assembly: application state, routes and middleware.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};

use aimux_core::{FormatDetector, GatewayManager};

use crate::config::Config;
use crate::handlers;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<GatewayManager>,
    pub detector: Arc<FormatDetector>,
}

/// Build the router: construct the dispatch engine from config, start the
/// health monitor, and wire up routes plus the CORS and body-limit layers.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    let manager = GatewayManager::new(config.gateway.clone())?;
    // The monitor runs for the life of the process; the handle is detached
    // deliberately.
    let _monitor = manager.spawn_monitor();

    let state = AppState {
        config: Arc::new(config.clone()),
        manager,
        detector: Arc::new(FormatDetector::new()),
    };

    let mut app = Router::new()
        // Chat surfaces
        .route("/anthropic/v1/messages", post(handlers::anthropic_messages))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        // Model listings
        .route("/anthropic/v1/models", get(handlers::list_models_anthropic))
        .route("/v1/models", get(handlers::list_models_openai))
        // Health and introspection
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .route("/metrics", get(handlers::metrics))
        .route("/providers", get(handlers::providers))
        .route(
            "/config",
            get(handlers::get_config).post(handlers::update_config),
        )
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(config.server.max_body_size)))
        .with_state(state);

    if config.server.cors.enabled {
        app = app.layer(cors_layer(&config));
    }

    Ok(app)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.server.cors.allowed_origins;
    let allow_origin = if origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS enabled with wildcard origins; scope allowed_origins for production");
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
        ])
        .max_age(std::time::Duration::from_secs(86_400))
}
