//! Contract between the gateway and the HTTP server that hosts it.
//!
//! The server owns the accept loop and the client sockets; the gateway
//! only sees a parsed [`ClientRequest`] and answers with a
//! [`GatewayReply`]. Server threads are synchronous: they call
//! [`ContentStream::next_chunk`] in a loop and write whatever comes
//! back to the client, which lets them poll for client disconnects
//! between chunks.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use std::net::IpAddr;

/// A client request as handed over by the hosting server.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    /// Path plus optional query string, exactly as received.
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    /// Whether the client channel was TLS-terminated upstream of us.
    pub encrypted: bool,
}

impl ClientRequest {
    pub fn path(&self) -> &str {
        match self.uri.find('?') {
            Some(idx) => &self.uri[..idx],
            None => &self.uri,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.find('?').map(|idx| &self.uri[idx + 1..])
    }

    /// Returns the first query parameter named `name`, percent-decoded.
    pub fn param(&self, name: &str) -> Option<String> {
        let query = self.query()?;
        for pair in query.split('&') {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key, value),
                None => (pair, ""),
            };
            if key == name {
                return Some(percent_decode(value));
            }
        }
        None
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = &value[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One pull from a streaming reply.
#[derive(Debug)]
pub enum StreamChunk {
    /// Bytes ready to be written to the client.
    Data(Bytes),
    /// Nothing yet; the producer is still working. Call again.
    Pending,
    /// All bytes delivered.
    End,
    /// The stream failed; the client connection should be dropped.
    Aborted,
}

/// A pull-based byte stream consumed by a server thread.
///
/// `next_chunk` blocks for at most ~100 ms, so the caller regains
/// control often enough to notice a disconnected client.
pub trait ContentStream: Send {
    fn next_chunk(&mut self) -> StreamChunk;
}

/// What the gateway hands back to the hosting server.
pub enum ReplyBody {
    Full(Bytes),
    /// Raw HTTP/1.x bytes (status line, headers, body) to be relayed
    /// to the client verbatim, one chunk at a time.
    Stream(Box<dyn ContentStream>),
}

pub struct GatewayReply {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: ReplyBody,
}

impl GatewayReply {
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: ReplyBody::Full(Bytes::from(body.into())),
        }
    }
}

/// Entry point the hosting server routes requests into.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &ClientRequest) -> GatewayReply;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn request(uri: &str) -> ClientRequest {
        ClientRequest {
            method: Method::GET,
            uri: uri.to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            encrypted: false,
        }
    }

    #[test]
    fn path_and_query_split() {
        let req = request("/wms?layer=a&x=1");
        assert_eq!(req.path(), "/wms");
        assert_eq!(req.query(), Some("layer=a&x=1"));

        let req = request("/wms");
        assert_eq!(req.path(), "/wms");
        assert_eq!(req.query(), None);
    }

    #[test]
    fn param_decodes_percent_and_plus() {
        let req = request("/admin?what=pause&note=hello+there%21");
        assert_eq!(req.param("what").as_deref(), Some("pause"));
        assert_eq!(req.param("note").as_deref(), Some("hello there!"));
        assert_eq!(req.param("missing"), None);
    }

    #[test]
    fn param_without_value_is_empty() {
        let req = request("/admin?flag&x=1");
        assert_eq!(req.param("flag").as_deref(), Some(""));
    }
}
