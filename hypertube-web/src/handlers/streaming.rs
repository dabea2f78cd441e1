//! Media endpoint serving byte ranges of a download in progress.
//!
//! A request first waits for the session to select its file, then for the
//! head chunk of the requested range. Only then are the status and headers
//! sent; the rest of the body is awaited chunk by chunk while the client
//! reads it, so a slow swarm never holds more than one chunk in memory.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use hypertube_core::storage::SessionStorage;
use hypertube_core::streaming::{RangeError, read_chunk};
use hypertube_core::{RangeRequest, SessionId};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::parse_session_id;
use super::range::{media_response, resolve_range};
use crate::error::ApiError;
use crate::server::AppState;

/// `GET /stream/data/{sessionId}`
///
/// Only the head chunk is awaited before the status line and the full
/// `Content-Length` go out. A later chunk that misses the await timeout
/// cannot become a 504 anymore: the body ends with an error and the client
/// sees a truncated transfer it can resume with a new `Range` request.
///
/// # Errors
///
/// - `ApiError::NotFound` - If the session is unknown
/// - `ApiError::RangeNotSatisfiable` - If the `Range` header cannot be served
/// - `ApiError::NotReady` - If the torrent did not resolve within the await timeout
/// - `ApiError::DataTimeout` - If the head of the range did not arrive in time
/// - `ApiError::Unavailable` - If the session failed
pub async fn stream_data(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&session_id)?;
    let handle = state.manager.handle(&id)?;

    // Dropping the handler or the body cancels every wait of this request
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    let timeout = state.streaming.await_timeout;
    let storage = handle.await_storage(timeout, &cancel).await?;
    let total_size = storage.total_size();
    let resolved = resolve_range(&headers, total_size)?;

    let mut chunks = resolved.range.chunks(state.streaming.chunk_size);
    let Some(head) = chunks.next() else {
        return Err(ApiError::range(
            Some(total_size),
            &RangeError::Unsatisfiable { total_size },
        ));
    };
    let head = read_chunk(&storage, head, timeout, &cancel).await?;

    debug!(
        session = %id,
        start = resolved.range.start,
        end = resolved.range.end,
        partial = resolved.partial,
        "Serving range"
    );

    let content_type = mime_guess::from_path(storage.path())
        .first_or_octet_stream()
        .to_string();
    let body = body_stream(
        id,
        head,
        BodyState {
            storage,
            chunks,
            timeout,
            cancel,
            _guard: guard,
            done: false,
        },
    );

    media_response(&resolved, total_size, &content_type)
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::Internal {
            reason: e.to_string(),
        })
}

struct BodyState<I> {
    storage: Arc<SessionStorage>,
    chunks: I,
    timeout: Duration,
    cancel: CancellationToken,
    _guard: DropGuard,
    done: bool,
}

fn body_stream<I>(
    id: SessionId,
    head: Bytes,
    state: BodyState<I>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static
where
    I: Iterator<Item = RangeRequest> + Send + 'static,
{
    let rest = stream::unfold((id, state), |(id, mut state)| async move {
        if state.done {
            return None;
        }
        let chunk = state.chunks.next()?;

        match read_chunk(&state.storage, chunk, state.timeout, &state.cancel).await {
            Ok(bytes) => Some((Ok(bytes), (id, state))),
            Err(e) => {
                // Headers are already sent, so the body is cut short
                if state.cancel.is_cancelled() {
                    info!(session = %id, "Server shutting down mid-stream");
                } else {
                    warn!(session = %id, start = chunk.start, "Aborting response body: {e}");
                }
                state.done = true;
                Some((Err(io::Error::other(e)), (id, state)))
            }
        }
    });

    stream::iter([Ok(head)]).chain(rest)
}
