//! API route definitions.

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::ws::ws_handler;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .route("/sessions", get(handlers::list_sessions))
        .route(
            "/conversations/{conversation_id}",
            get(handlers::get_conversation),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(trace_layer)
}
