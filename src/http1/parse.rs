//! Request head scanning and parsing
//!
//! The engine locates and bounds the request line and header block itself;
//! the grammar inside those bounds is delegated to `httparse`.

use http::{HeaderMap, HeaderName, HeaderValue, Request, Version};

use crate::{EngineError, Result};

/// Hard cap on header count handed to the grammar
pub const MAX_HEADER_COUNT: usize = 128;

/// Progress of locating a complete request head in the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadScan {
    /// Need more bytes; `line_seen` is true once the request line is complete
    Partial {
        /// Whether the request line has been fully received
        line_seen: bool,
    },
    /// Request line exceeds the configured limit
    LineOverflow,
    /// Header block exceeds the configured limit
    HeadersOverflow,
    /// Full head received; `head_end` is the offset just past the blank line
    Complete {
        /// Offset one past the head terminator
        head_end: usize,
    },
}

/// Locate the request head, enforcing the line and header block bounds
///
/// `max_line` bounds the request line excluding its CRLF; `max_headers`
/// bounds the header block including its terminator.
pub fn scan_head(buf: &[u8], max_line: usize, max_headers: usize) -> HeadScan {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        // allow for a trailing CR still in flight
        if buf.len() > max_line + 1 {
            return HeadScan::LineOverflow;
        }
        return HeadScan::Partial { line_seen: false };
    };

    let line_len = if nl > 0 && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
    if line_len > max_line {
        return HeadScan::LineOverflow;
    }

    let block_start = nl + 1;
    match find_head_end(&buf[block_start..]) {
        Some(rel_end) => {
            if rel_end > max_headers {
                HeadScan::HeadersOverflow
            } else {
                HeadScan::Complete {
                    head_end: block_start + rel_end,
                }
            }
        }
        None => {
            if buf.len() - block_start > max_headers {
                HeadScan::HeadersOverflow
            } else {
                HeadScan::Partial { line_seen: true }
            }
        }
    }
}

/// Offset one past the blank line ending a header block, if present
///
/// The block may be empty (head ends immediately after the request line).
fn find_head_end(block: &[u8]) -> Option<usize> {
    if block.starts_with(b"\r\n") {
        return Some(2);
    }
    if block.starts_with(b"\n") {
        return Some(1);
    }
    for i in 0..block.len() {
        if block[i] != b'\n' {
            continue;
        }
        let rest = &block[i + 1..];
        if rest.starts_with(b"\r\n") {
            return Some(i + 3);
        }
        if rest.starts_with(b"\n") {
            return Some(i + 2);
        }
    }
    None
}

/// Parse a complete request head into request parts
///
/// # Errors
///
/// Grammar failures map to [`EngineError::MalformedRequestLine`]; more
/// than [`MAX_HEADER_COUNT`] headers maps to the header limit error.
pub fn parse_head(head: &[u8]) -> Result<Request<()>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(EngineError::MalformedRequestLine),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(EngineError::HeadersTooLarge {
                limit: MAX_HEADER_COUNT,
            })
        }
        Err(_) => return Err(EngineError::MalformedRequestLine),
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(EngineError::MalformedRequestLine),
    };

    let mut builder = Request::builder()
        .method(parsed.method.ok_or(EngineError::MalformedRequestLine)?)
        .uri(parsed.path.ok_or(EngineError::MalformedRequestLine)?)
        .version(version);

    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| EngineError::MalformedRequestLine)?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| EngineError::MalformedRequestLine)?;
        builder = builder.header(name, value);
    }

    builder
        .body(())
        .map_err(|_| EngineError::MalformedRequestLine)
}

/// How the request body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Exactly this many body bytes follow
    ContentLength(u64),
    /// Chunked transfer coding
    Chunked,
}

/// Determine body framing from the parsed head
///
/// # Errors
///
/// A request carrying both content-length and chunked coding, or an
/// unparsable length, is rejected as malformed.
pub fn body_framing(req: &Request<()>) -> Result<BodyFraming> {
    let chunked = req
        .headers()
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .any(|v| {
            v.to_str()
                .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
                .unwrap_or(false)
        });

    let content_length = match req.headers().get(http::header::CONTENT_LENGTH) {
        Some(value) => {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(EngineError::MalformedRequestLine)?;
            Some(parsed)
        }
        None => None,
    };

    match (chunked, content_length) {
        // ambiguous framing is a smuggling vector, reject outright
        (true, Some(_)) => Err(EngineError::MalformedRequestLine),
        (true, None) => Ok(BodyFraming::Chunked),
        (false, Some(0)) | (false, None) => Ok(BodyFraming::None),
        (false, Some(n)) => Ok(BodyFraming::ContentLength(n)),
    }
}

/// Whether the request's connection semantics allow reuse
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let connection_token = |token: &str| {
        headers.get_all(http::header::CONNECTION).iter().any(|v| {
            v.to_str()
                .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };

    match version {
        Version::HTTP_11 => !connection_token("close"),
        Version::HTTP_10 => connection_token("keep-alive"),
        _ => false,
    }
}
