//! HTTP `Range` header handling
//!
//! Only single byte ranges are honored: `bytes=a-b`, `bytes=a-` and
//! `bytes=-n`. A header we don't understand (other units, multiple ranges,
//! garbage) is ignored and the whole body is served.

/// Inclusive byte range within a body of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    /// Number of bytes covered. Never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value, e.g. `bytes 100-199/1000`
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// What to serve for a request against a body of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable `Range`, serve everything with 200
    Full,
    /// Serve a slice with 206
    Partial(ByteRange),
    /// Serve 416 with `Content-Range: bytes */len`
    Unsatisfiable,
}

/// `Content-Range` value for a 416 response
pub fn unsatisfiable_content_range(total: u64) -> String {
    format!("bytes */{}", total)
}

/// Resolve a `Range` header against a body of `total` bytes.
///
/// An end past the body is clamped to the last byte.
pub fn parse_range(header: Option<&str>, total: u64) -> RangeRequest {
    let Some(ranges) = header.map(str::trim).and_then(|h| h.strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    let ranges = ranges.trim();
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix range: bytes=-500 means the last 500 bytes
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || total == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: total.saturating_sub(suffix),
            end: total - 1,
            total,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return RangeRequest::Full,
        }
    };

    if let Some(end) = end {
        if end < start {
            return RangeRequest::Full;
        }
    }
    if start >= total {
        return RangeRequest::Unsatisfiable;
    }

    let last_byte = total - 1;
    RangeRequest::Partial(ByteRange {
        start,
        end: end.map(|e| e.min(last_byte)).unwrap_or(last_byte),
        total,
    })
}

/// Whether a `Range` header asks for the body from its first byte with no
/// upper bound, which is the same bytes as no range at all.
pub fn covers_whole_body(header: Option<&str>) -> bool {
    match header.map(str::trim) {
        None => true,
        Some(h) => matches!(
            h.strip_prefix("bytes=").map(str::trim),
            Some("0-")
        ),
    }
}
