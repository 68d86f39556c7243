//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! Two realtime surfaces share one Axum router: the websocket chat channel
//! at `/api/ws` and the read-only SSE change feed at `/api/events`, plus the
//! small auth endpoints the client session layer depends on.

pub mod auth;
pub mod chat;
pub mod events;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(chat::handle_ws))
        .route("/api/events", get(events::handle_events))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/dev-login", post(auth::dev_login))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
