//! REST + WebSocket API. Assembles the router, the shared `AppState`,
//! and the uniform `ok: bool` response envelope.

pub mod envelope;
pub mod handlers;
mod routes;
pub mod ws;

use std::sync::{Arc, RwLock};

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ai_client::AiClient;
use crate::broadcaster::Broadcaster;
use crate::identity::Identity;
use crate::pipeline::PipelineManager;
use crate::storage::Storage;
use crate::types::ContactSubmission;

const CORS_MAX_AGE_SECS: u64 = 600;
const BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Shared application state, cloned cheaply into every handler (every field
/// is an `Arc` or an `Arc<RwLock<..>>`).
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<Identity>,
    pub storage: Arc<Storage>,
    pub pipeline: Arc<PipelineManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub ai_client: Arc<AiClient>,
    pub contacts: Arc<RwLock<Vec<ContactSubmission>>>,
}

/// Builds the full router: `/api/*` REST endpoints, `/ws` for live packets,
/// and `/health`. CORS is locked to the configured origin list (empty list
/// means same-origin only); preflight responses are cached for ten minutes.
pub fn create_app(state: AppState, cors_allowed_origins: &[String]) -> Router {
    let cors = build_cors_layer(cors_allowed_origins);

    Router::new()
        .merge(routes::api_routes())
        .route("/health", axum::routing::get(handlers::health))
        .route("/ws", axum::routing::get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let parsed: Vec<_> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
    let origin = AllowOrigin::list(parsed);

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(CORS_MAX_AGE_SECS))
}
