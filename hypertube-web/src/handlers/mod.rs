//! HTTP request handlers organized by functionality

pub mod availability;
pub mod range;
pub mod sessions;
pub mod streaming;

// Re-export handler functions
pub use availability::{AvailabilityQuery, stream_availability};
pub use sessions::{StartQuery, StartResponse, health, list_sessions, start_stream, stream_status};
pub use streaming::stream_data;

use hypertube_core::SessionId;

use crate::error::ApiError;

/// Parses a `{sessionId}` path segment. A malformed id cannot name a session.
fn parse_session_id(value: &str) -> Result<SessionId, ApiError> {
    value.parse().map_err(|_| ApiError::NotFound {
        id: value.to_string(),
    })
}
