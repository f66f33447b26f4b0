//! Byte-range header parsing and resolution
//!
//! Pure functions; the HTTP handler turns the resolved span into a 200,
//! 206, or 416. A syntactically broken `Range` header is ignored (full
//! body), matching general HTTP file-server behavior; a parseable but
//! unsatisfiable one is an error.

use crate::{Error, Result};

/// Parsed `Range: bytes=...` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// `bytes=a-b`
    Bounded(u64, u64),

    /// `bytes=a-`
    From(u64),

    /// `bytes=-n`: the final n bytes
    Suffix(u64),
}

/// The span of the response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRange {
    /// Whole file, status 200
    Full,

    /// `[start, end]` inclusive, status 206
    Partial { start: u64, end: u64 },
}

impl ResolvedRange {
    /// Bytes the body will carry
    pub fn len(&self, file_size: u64) -> u64 {
        match self {
            ResolvedRange::Full => file_size,
            ResolvedRange::Partial { start, end } => end - start + 1,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, ResolvedRange::Partial { .. })
    }
}

/// Parse a `Range` header value. `None` means the header is absent or
/// malformed and the request should get the full body.
pub fn parse_range(header: &str) -> Option<RangeRequest> {
    let spec = header.trim().strip_prefix("bytes=")?;

    // Multi-range requests are served as a full body.
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        ("", "") => None,
        ("", n) => n.parse().ok().map(RangeRequest::Suffix),
        (a, "") => a.parse().ok().map(RangeRequest::From),
        (a, b) => {
            let a = a.parse().ok()?;
            let b = b.parse().ok()?;
            Some(RangeRequest::Bounded(a, b))
        }
    }
}

/// Resolve a parsed range against the file size
pub fn resolve_range(request: Option<RangeRequest>, file_size: u64) -> Result<ResolvedRange> {
    let Some(request) = request else {
        return Ok(ResolvedRange::Full);
    };

    match request {
        RangeRequest::Bounded(start, end) => {
            if start > end || end >= file_size {
                return Err(Error::RangeUnsatisfiable);
            }
            Ok(ResolvedRange::Partial { start, end })
        }
        RangeRequest::From(start) => {
            // `bytes=0-` on an empty file is a plain empty 200.
            if start == 0 && file_size == 0 {
                return Ok(ResolvedRange::Full);
            }
            if start >= file_size {
                return Err(Error::RangeUnsatisfiable);
            }
            Ok(ResolvedRange::Partial {
                start,
                end: file_size - 1,
            })
        }
        RangeRequest::Suffix(n) => {
            if n == 0 || file_size == 0 {
                return Err(Error::RangeUnsatisfiable);
            }
            let len = n.min(file_size);
            Ok(ResolvedRange::Partial {
                start: file_size - len,
                end: file_size - 1,
            })
        }
    }
}

/// MIME type for a source file, from its extension
pub fn content_type(path: &std::path::Path) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("video/mp4")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_range("bytes=0-1023"), Some(RangeRequest::Bounded(0, 1023)));
        assert_eq!(parse_range("bytes=500-"), Some(RangeRequest::From(500)));
        assert_eq!(parse_range("bytes=-200"), Some(RangeRequest::Suffix(200)));
        assert_eq!(parse_range(" bytes=1-2 "), Some(RangeRequest::Bounded(1, 2)));
    }

    #[test]
    fn test_parse_garbage_is_ignored() {
        assert_eq!(parse_range("bits=0-100"), None);
        assert_eq!(parse_range("bytes=-"), None);
        assert_eq!(parse_range("bytes=abc-def"), None);
        assert_eq!(parse_range("bytes=0-100,200-300"), None);
        assert_eq!(parse_range(""), None);
    }

    #[test]
    fn test_resolve_bounded() {
        let r = resolve_range(Some(RangeRequest::Bounded(0, 1023)), 2048).unwrap();
        assert_eq!(r, ResolvedRange::Partial { start: 0, end: 1023 });
        assert_eq!(r.len(2048), 1024);
    }

    #[test]
    fn test_resolve_rejects_inverted_and_overlong() {
        // a > b
        assert!(matches!(
            resolve_range(Some(RangeRequest::Bounded(10, 5)), 100),
            Err(Error::RangeUnsatisfiable)
        ));
        // b >= size
        assert!(matches!(
            resolve_range(Some(RangeRequest::Bounded(0, 100)), 100),
            Err(Error::RangeUnsatisfiable)
        ));
    }

    #[test]
    fn test_resolve_open_ended() {
        let r = resolve_range(Some(RangeRequest::From(100)), 2048).unwrap();
        assert_eq!(r, ResolvedRange::Partial { start: 100, end: 2047 });

        assert!(resolve_range(Some(RangeRequest::From(2048)), 2048).is_err());
    }

    #[test]
    fn test_zero_length_file_from_zero_is_full() {
        let r = resolve_range(Some(RangeRequest::From(0)), 0).unwrap();
        assert_eq!(r, ResolvedRange::Full);
        assert_eq!(r.len(0), 0);

        assert!(resolve_range(Some(RangeRequest::From(5)), 0).is_err());
    }

    #[test]
    fn test_suffix_ranges() {
        let r = resolve_range(Some(RangeRequest::Suffix(100)), 2048).unwrap();
        assert_eq!(r, ResolvedRange::Partial { start: 1948, end: 2047 });

        // Longer than the file clamps to the whole file.
        let r = resolve_range(Some(RangeRequest::Suffix(5000)), 2048).unwrap();
        assert_eq!(r, ResolvedRange::Partial { start: 0, end: 2047 });
    }

    #[test]
    fn test_absent_header_is_full() {
        assert_eq!(resolve_range(None, 2048).unwrap(), ResolvedRange::Full);
    }

    #[test]
    fn test_content_type_fallback() {
        assert_eq!(content_type(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type(Path::new("a.mkv")), "video/x-matroska");
        assert_eq!(content_type(Path::new("noext")), "video/mp4");
    }
}
