//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use convoy_protocol::Conversation;
use serde::Serialize;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::ws::SessionSummary;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub sessions: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.hub.session_count(),
    })
}

/// List live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.hub.list())
}

/// Fetch a stored conversation.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    let load = state.collaborators.store.load(&conversation_id);
    let conversation = tokio::time::timeout(state.store_timeout, load)
        .await
        .map_err(|_| ApiError::service_unavailable("conversation store did not respond"))??
        .ok_or_else(|| ApiError::not_found(format!("conversation {conversation_id}")))?;
    Ok(Json(conversation))
}
