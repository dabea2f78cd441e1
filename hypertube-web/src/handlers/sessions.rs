//! Session lifecycle endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use hypertube_core::{Quality, SessionId, SessionSnapshot, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::parse_session_id;
use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuery {
    pub title_id: String,
    pub quality: String,
    pub magnet: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: SessionId,
    pub state: SessionState,
}

/// `GET /stream/start?titleId=&quality=&magnet=`
///
/// Returns as soon as the session exists; resolution continues in the
/// background and a bad magnet link shows up as a failed session.
///
/// # Errors
///
/// - `ApiError::BadRequest` - If the title id or quality is invalid
/// - `ApiError::Unavailable` - If the server is shutting down
pub async fn start_stream(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> Result<Json<StartResponse>, ApiError> {
    let quality: Quality = query.quality.parse()?;
    let handle = state
        .manager
        .start(&query.title_id, quality, &query.magnet)?;
    info!(session = %handle.id(), state = %handle.state(), "Stream requested");

    Ok(Json(StartResponse {
        session_id: handle.id().clone(),
        state: handle.state(),
    }))
}

/// `GET /stream/status/{sessionId}`
///
/// # Errors
///
/// - `ApiError::NotFound` - If the session is unknown
pub async fn stream_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = parse_session_id(&session_id)?;
    Ok(Json(state.manager.status(&id)?))
}

/// `GET /stream/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.manager.sessions())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.manager.sessions().len(),
    }))
}
