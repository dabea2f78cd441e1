//! Availability endpoint for seek bars.

use axum::Json;
use axum::extract::{Path, Query, State};
use hypertube_core::{AvailabilityReport, StorageError};
use serde::Deserialize;

use super::parse_session_id;
use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AvailabilityQuery {
    /// Only report bytes at or after this offset
    pub from: Option<u64>,
}

/// `GET /stream/availability/{sessionId}?from=`
///
/// A session that has not selected its file yet reports no ranges and an
/// unknown total size.
///
/// # Errors
///
/// - `ApiError::NotFound` - If the session is unknown
pub async fn stream_availability(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityReport>, ApiError> {
    let id = parse_session_id(&session_id)?;
    // Unknown sessions are a 404, sessions without storage an empty report
    state.manager.handle(&id)?;

    match state.reporter.report(&id, query.from.unwrap_or(0)) {
        Ok(report) => Ok(Json(report)),
        Err(StorageError::UnknownSession { .. }) => Ok(Json(AvailabilityReport::unresolved(id))),
        Err(e) => Err(e.into()),
    }
}
