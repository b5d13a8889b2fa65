//! Route table for the `/api/*` surface.

use axum::routing::{get, post};
use axum::Router;

use super::{handlers, AppState};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/session", get(handlers::session))
        .route("/api/status", get(handlers::status))
        .route("/api/packets", get(handlers::list_packets))
        .route("/api/packets/count", get(handlers::packets_count))
        .route("/api/threats/count", get(handlers::threats_count))
        .route("/api/threat-intel", get(handlers::threat_intel))
        .route("/api/incidents/timeline", get(handlers::incidents_timeline))
        .route("/api/contact", post(handlers::submit_contact).get(handlers::list_contacts))
        .route("/api/admin/reset-mongo", post(handlers::reset_mongo))
}
