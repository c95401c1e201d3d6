//! HTTP/1.x wire codec for backend conversations.
//!
//! Backends signal deny conditions with nonstandard 4-digit status
//! codes that `http::StatusCode` cannot represent, so response heads
//! are parsed here with the status kept as a raw `u16`. Requests are
//! serialized verbatim from the client request plus the gateway's
//! rewritten headers.

use crate::traits::ClientRequest;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

/// Largest response head we are willing to buffer before declaring the
/// backend garbled.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Backend is shutting down; retry elsewhere.
pub const STATUS_SHUTDOWN: u16 = 3210;
/// Backend is overloaded; retry elsewhere.
pub const STATUS_HIGH_LOAD: u16 = 1234;

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug)]
pub enum ParseOutcome {
    /// Head parsed; `consumed` bytes belong to it, the rest is body.
    Complete {
        head: ResponseHead,
        consumed: usize,
    },
    /// Need more bytes.
    Incomplete,
    Failed(String),
}

pub fn parse_response_head(buffer: &[u8]) -> ParseOutcome {
    let end = match find_head_end(buffer) {
        Some(end) => end,
        None => {
            if buffer.len() > MAX_HEAD_BYTES {
                return ParseOutcome::Failed("response head too large".to_string());
            }
            return ParseOutcome::Incomplete;
        }
    };

    let head_text = match std::str::from_utf8(&buffer[..end]) {
        Ok(text) => text,
        Err(_) => return ParseOutcome::Failed("response head is not valid UTF-8".to_string()),
    };

    let mut lines = head_text.split("\r\n");
    let status_line = match lines.next() {
        Some(line) if !line.is_empty() => line,
        _ => return ParseOutcome::Failed("empty status line".to_string()),
    };

    let (status, reason) = match parse_status_line(status_line) {
        Ok(parsed) => parsed,
        Err(err) => return ParseOutcome::Failed(err),
    };

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return ParseOutcome::Failed(format!("malformed header line '{line}'"));
        };
        let name = match HeaderName::try_from(name.trim()) {
            Ok(name) => name,
            Err(_) => return ParseOutcome::Failed(format!("invalid header name '{name}'")),
        };
        let value = match HeaderValue::from_str(value.trim()) {
            Ok(value) => value,
            Err(_) => return ParseOutcome::Failed(format!("invalid value for '{name}'")),
        };
        headers.append(name, value);
    }

    ParseOutcome::Complete {
        head: ResponseHead {
            status,
            reason,
            headers,
        },
        consumed: end + 4,
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<(u16, String), String> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(format!("unsupported protocol '{version}'"));
    }
    let code = parts
        .next()
        .ok_or_else(|| "missing status code".to_string())?;
    if code.is_empty() || code.len() > 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid status code '{code}'"));
    }
    let status: u16 = code.parse().map_err(|_| "status out of range".to_string())?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

/// Serializes the forwarded request. `resource` is the rewritten path
/// plus query; `probe` adds the cache-negotiation header.
pub fn serialize_request(request: &ClientRequest, resource: &str, probe: bool) -> Vec<u8> {
    let version = if request.version == http::Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };

    let mut out = Vec::with_capacity(256 + request.body.len());
    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(resource.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in request.headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if probe {
        out.extend_from_slice(b"X-Request-ETag: true\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}

/// Content encodings the cache partitions by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
        }
    }
}

/// The best encoding this client accepts. `*` means everything, so
/// compressed is preferred.
pub fn accepted_encoding(request: &ClientRequest) -> ContentEncoding {
    match request.header("Accept-Encoding") {
        Some("*") => ContentEncoding::Gzip,
        Some(value) if value.contains("gzip") => ContentEncoding::Gzip,
        _ => ContentEncoding::Identity,
    }
}

/// Encoding of a backend response, from its `Content-Encoding` header.
pub fn response_encoding(head: &ResponseHead) -> ContentEncoding {
    match head.header("Content-Encoding") {
        Some(value) if value.contains("gzip") => ContentEncoding::Gzip,
        _ => ContentEncoding::Identity,
    }
}
