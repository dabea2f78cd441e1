//! `Range` header parsing for single byte ranges.

/// Why a `Range` header cannot be served. Every variant maps to `416`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Malformed range header '{header}'")]
    Malformed { header: String },

    #[error("Multiple ranges are not supported")]
    MultipleRanges,

    #[error("Range not satisfiable for {total_size} bytes")]
    Unsatisfiable { total_size: u64 },
}

/// Byte range as written by the client, before the file size is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-b` or `bytes=a-`
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-n`, the last `n` bytes
    Suffix { len: u64 },
}

impl RangeSpec {
    /// Parses a `Range` header value.
    ///
    /// # Errors
    ///
    /// - `RangeError::MultipleRanges` - If more than one range is listed
    /// - `RangeError::Malformed` - If the value is not `bytes=` followed by one range
    pub fn parse(header: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed {
            header: header.to_string(),
        };

        let (unit, spec) = header.trim().split_once('=').ok_or_else(malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(malformed());
        }
        if spec.contains(',') {
            return Err(RangeError::MultipleRanges);
        }

        let (start, end) = spec.trim().split_once('-').ok_or_else(malformed)?;
        let (start, end) = (start.trim(), end.trim());
        let number = |value: &str| value.parse::<u64>().map_err(|_| malformed());

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(malformed()),
            (true, false) => Ok(Self::Suffix { len: number(end)? }),
            (false, true) => Ok(Self::FromTo {
                start: number(start)?,
                end: None,
            }),
            (false, false) => Ok(Self::FromTo {
                start: number(start)?,
                end: Some(number(end)?),
            }),
        }
    }

    /// Applies the spec to a file of `total_size` bytes.
    ///
    /// An end past the file is clamped to the last byte.
    ///
    /// # Errors
    ///
    /// - `RangeError::Unsatisfiable` - If `start > end`, `start >= total_size`
    ///   or the suffix is empty
    pub fn resolve(self, total_size: u64) -> Result<RangeRequest, RangeError> {
        let unsatisfiable = RangeError::Unsatisfiable { total_size };
        if total_size == 0 {
            return Err(unsatisfiable);
        }
        let last = total_size - 1;

        match self {
            Self::FromTo { start, end } => {
                let end = end.unwrap_or(last);
                if start > end || start >= total_size {
                    return Err(unsatisfiable);
                }
                Ok(RangeRequest {
                    start,
                    end: end.min(last),
                })
            }
            Self::Suffix { len } => {
                if len == 0 {
                    return Err(unsatisfiable);
                }
                Ok(RangeRequest {
                    start: total_size.saturating_sub(len),
                    end: last,
                })
            }
        }
    }
}

/// Inclusive byte range `[start, end]` of one HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: u64,
}

impl RangeRequest {
    /// The whole file, `None` for an empty file.
    pub fn full(total_size: u64) -> Option<Self> {
        total_size.checked_sub(1).map(|end| Self { start: 0, end })
    }

    /// Parses and resolves a `Range` header in one step.
    ///
    /// # Errors
    ///
    /// - `RangeError` - If the header is malformed or unsatisfiable
    pub fn from_header(header: &str, total_size: u64) -> Result<Self, RangeError> {
        RangeSpec::parse(header)?.resolve(total_size)
    }

    /// Number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A resolved range always holds at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a `206` response.
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{total_size}", self.start, self.end)
    }

    /// Splits the range into consecutive pieces of at most `chunk_size` bytes.
    pub fn chunks(self, chunk_size: u64) -> impl Iterator<Item = RangeRequest> {
        let chunk_size = chunk_size.max(1);
        let mut next = Some(self.start);
        std::iter::from_fn(move || {
            let start = next?;
            let end = start.saturating_add(chunk_size - 1).min(self.end);
            next = (end < self.end).then_some(end + 1);
            Some(RangeRequest { start, end })
        })
    }
}

/// `Content-Range` value for a `416` response.
pub fn unsatisfied_content_range(total_size: u64) -> String {
    format!("bytes */{total_size}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(header: &str, total: u64) -> Result<(u64, u64), RangeError> {
        RangeRequest::from_header(header, total).map(|range| (range.start, range.end))
    }

    #[test]
    fn test_closed_range() {
        assert_eq!(resolve("bytes=100-199", 1000), Ok((100, 199)));
        assert_eq!(resolve("bytes=0-0", 1000), Ok((0, 0)));
    }

    #[test]
    fn test_open_range() {
        assert_eq!(resolve("bytes=500-", 1000), Ok((500, 999)));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(resolve("bytes=-100", 1000), Ok((900, 999)));
        assert_eq!(resolve("bytes=-5000", 1000), Ok((0, 999)));
    }

    #[test]
    fn test_end_is_clamped() {
        assert_eq!(resolve("bytes=900-5000", 1000), Ok((900, 999)));
    }

    #[test]
    fn test_unsatisfiable_ranges() {
        let unsatisfiable = Err(RangeError::Unsatisfiable { total_size: 1000 });
        assert_eq!(resolve("bytes=2000-", 1000), unsatisfiable);
        assert_eq!(resolve("bytes=1000-1000", 1000), unsatisfiable);
        assert_eq!(resolve("bytes=200-100", 1000), unsatisfiable);
        assert_eq!(resolve("bytes=-0", 1000), unsatisfiable);
        assert!(resolve("bytes=0-", 0).is_err());
    }

    #[test]
    fn test_malformed_ranges() {
        for header in ["", "bytes", "items=0-10", "bytes=-", "bytes=a-b", "bytes=10"] {
            assert!(
                matches!(resolve(header, 1000), Err(RangeError::Malformed { .. })),
                "{header:?} should be malformed"
            );
        }
        assert_eq!(
            resolve("bytes=0-10,20-30", 1000),
            Err(RangeError::MultipleRanges)
        );
    }

    #[test]
    fn test_chunks_cover_range_exactly() {
        let range = RangeRequest { start: 10, end: 34 };
        let chunks: Vec<(u64, u64)> = range.chunks(10).map(|c| (c.start, c.end)).collect();
        assert_eq!(chunks, vec![(10, 19), (20, 29), (30, 34)]);
        assert_eq!(range.len(), 25);
        assert_eq!(range.content_range(1000), "bytes 10-34/1000");
    }

    #[test]
    fn test_full_range() {
        assert_eq!(RangeRequest::full(1000), Some(RangeRequest { start: 0, end: 999 }));
        assert_eq!(RangeRequest::full(0), None);
        assert_eq!(unsatisfied_content_range(1000), "bytes */1000");
    }
}
