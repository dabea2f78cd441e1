//! HTTP Range request handling for video streaming
//!
//! Resolves the `Range` header of a request against the size of the selected
//! file and builds the headers of `200` and `206` responses.

use axum::http::{HeaderMap, StatusCode, header};
use axum::http::response::Builder;
use hypertube_core::RangeRequest;
use hypertube_core::streaming::RangeError;

use crate::error::ApiError;

/// The bytes a request asked for, resolved against the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub range: RangeRequest,
    /// True when the client sent a `Range` header and expects `206`
    pub partial: bool,
}

/// Resolves the request's `Range` header against a file of `total_size` bytes.
///
/// Without a header the whole file is served.
///
/// # Errors
///
/// - `ApiError::RangeNotSatisfiable` - If the header is malformed, lists several
///   ranges or lies outside the file
pub fn resolve_range(headers: &HeaderMap, total_size: u64) -> Result<ResolvedRange, ApiError> {
    let Some(value) = headers.get(header::RANGE) else {
        let range = RangeRequest::full(total_size).ok_or_else(|| {
            ApiError::range(Some(total_size), &RangeError::Unsatisfiable { total_size })
        })?;
        return Ok(ResolvedRange {
            range,
            partial: false,
        });
    };

    let header = value.to_str().map_err(|_| {
        ApiError::range(
            Some(total_size),
            &RangeError::Malformed {
                header: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            },
        )
    })?;
    let range = RangeRequest::from_header(header, total_size)
        .map_err(|e| ApiError::range(Some(total_size), &e))?;
    Ok(ResolvedRange {
        range,
        partial: true,
    })
}

/// Response builder with the status and headers for `resolved`.
pub fn media_response(resolved: &ResolvedRange, total_size: u64, content_type: &str) -> Builder {
    let builder = axum::http::Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, resolved.range.len())
        .header(header::CACHE_CONTROL, "no-cache");

    if resolved.partial {
        builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                resolved.range.content_range(total_size),
            )
    } else {
        builder.status(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(range: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(range).unwrap());
        headers
    }

    #[test]
    fn test_no_header_serves_whole_file() {
        let resolved = resolve_range(&HeaderMap::new(), 1000).unwrap();
        assert!(!resolved.partial);
        assert_eq!((resolved.range.start, resolved.range.end), (0, 999));
    }

    #[test]
    fn test_header_is_resolved() {
        let resolved = resolve_range(&headers("bytes=100-199"), 1000).unwrap();
        assert!(resolved.partial);
        assert_eq!((resolved.range.start, resolved.range.end), (100, 199));

        let response = media_response(&resolved, 1000, "video/mp4")
            .body(())
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "100");
        assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    }

    #[test]
    fn test_bad_headers_are_unsatisfiable() {
        for range in ["bytes=2000-", "bytes=0-1,5-6", "lines=1-2"] {
            let error = resolve_range(&headers(range), 1000).unwrap_err();
            assert!(
                matches!(
                    error,
                    ApiError::RangeNotSatisfiable {
                        total_size: Some(1000),
                        ..
                    }
                ),
                "{range:?} should be unsatisfiable"
            );
        }
    }
}
