//! Mapping of core errors to HTTP responses.

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use hypertube_core::streaming::{RangeError, unsatisfied_content_range};
use hypertube_core::{SessionError, StorageError, StreamingError};
use serde_json::json;
use tracing::{error, warn};

/// Seconds a client should wait before retrying a session that is still resolving.
const RETRY_AFTER_SECS: u64 = 5;

/// Error returned by API handlers, rendered as a JSON body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{reason}")]
    BadRequest { reason: String },

    #[error("Unknown session {id}")]
    NotFound { id: String },

    /// `total_size` is `None` when the file size is not known yet
    #[error("Range not satisfiable: {reason}")]
    RangeNotSatisfiable {
        total_size: Option<u64>,
        reason: String,
    },

    /// The requested region was not fetched in time; the client may retry
    #[error("Bytes {start}-{end} were not downloaded within {after:?}")]
    DataTimeout { start: u64, end: u64, after: Duration },

    /// The torrent has not resolved yet
    #[error("{reason}")]
    NotReady { reason: String },

    #[error("{reason}")]
    Unavailable { reason: String },

    #[error("{reason}")]
    Internal { reason: String },
}

impl ApiError {
    /// `416` for a `Range` header that cannot be served from a file of `total_size` bytes.
    pub fn range(total_size: Option<u64>, error: &RangeError) -> Self {
        let total_size = match error {
            RangeError::Unsatisfiable { total_size } => Some(*total_size),
            _ => total_size,
        };
        Self::RangeNotSatisfiable {
            total_size,
            reason: error.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::DataTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::NotReady { .. } | Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Self::DataTimeout { .. } => "data_timeout",
            Self::NotReady { .. } => "not_ready",
            Self::Unavailable { .. } => "unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::DataTimeout { .. } | Self::NotReady { .. })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::GATEWAY_TIMEOUT {
            error!(%status, "Request failed: {}", self);
        } else if status == StatusCode::GATEWAY_TIMEOUT {
            warn!("Request timed out: {}", self);
        }

        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        }));
        let mut response = (status, body).into_response();

        let headers = response.headers_mut();
        match &self {
            Self::RangeNotSatisfiable {
                total_size: Some(total_size),
                ..
            } => {
                if let Ok(value) = HeaderValue::from_str(&unsatisfied_content_range(*total_size)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
            }
            Self::NotReady { .. } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            _ => {}
        }
        response
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::InvalidTitleId { .. } | SessionError::InvalidQuality { .. } => {
                Self::BadRequest {
                    reason: error.to_string(),
                }
            }
            SessionError::InvalidSessionId { id } => Self::NotFound { id },
            SessionError::UnknownSession { id } => Self::NotFound { id: id.to_string() },
            SessionError::NotReady { .. } => Self::NotReady {
                reason: error.to_string(),
            },
            SessionError::Failed { .. }
            | SessionError::Cancelled
            | SessionError::ShuttingDown => Self::Unavailable {
                reason: error.to_string(),
            },
            SessionError::Storage(storage) => storage.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::UnknownSession { id } => Self::NotFound { id: id.to_string() },
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

impl From<StreamingError> for ApiError {
    fn from(error: StreamingError) -> Self {
        match error {
            StreamingError::Range(range) => Self::range(None, &range),
            StreamingError::Session(session) => session.into(),
            StreamingError::Storage(storage) => storage.into(),
            StreamingError::DataTimeout { start, end, after } => {
                Self::DataTimeout { start, end, after }
            }
            StreamingError::Aborted { .. } | StreamingError::Cancelled => Self::Unavailable {
                reason: error.to_string(),
            },
        }
    }
}
