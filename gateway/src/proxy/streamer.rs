//! Per-request backend conversation.
//!
//! Each forwarded request gets one `GatewayStreamer`. A task on the
//! backend runtime drives the conversation (probe, cache lookup,
//! content fetch, body relay) while the hosting server's thread pulls
//! chunks synchronously. The two sides meet at one mutex-guarded
//! buffer plus a wakeup channel; consumer waits are bounded at 100 ms
//! so the server can notice client disconnects.
//!
//! The probe round-trip carries `X-Request-ETag: true`. A backend that
//! answers with an `ETag` lets the gateway satisfy the request from
//! cache without a body fetch; a backend that answers without one has
//! opted out, and the probe connection simply becomes the data
//! connection.

use crate::cache::{CachedResponseMetadata, ResponseCache};
use crate::proxy::requests::{ActiveRequestGuard, BackendRequestGuard};
use crate::proxy::wire::{
    self, ContentEncoding, ParseOutcome, ResponseHead,
};
use crate::traits::{ContentStream, StreamChunk};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

const CONSUMER_WAIT: Duration = Duration::from_millis(100);
const READ_CHUNK_BYTES: usize = 8 * 1024;
const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";
const SERVER_IDENT: &str = concat!("cluster-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Ongoing,
    Finished,
    Failed,
}

/// Everything a conversation needs from the proxy core.
#[derive(Clone)]
pub(crate) struct StreamerContext {
    pub gzip: Arc<ResponseCache>,
    pub identity: Arc<ResponseCache>,
    pub idle_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub max_cached_buffer_bytes: usize,
    pub server_name: String,
}

impl StreamerContext {
    fn pool(&self, encoding: ContentEncoding) -> &Arc<ResponseCache> {
        match encoding {
            ContentEncoding::Gzip => &self.gzip,
            ContentEncoding::Identity => &self.identity,
        }
    }
}

/// One backend conversation, fully prepared by the router.
pub(crate) struct Conversation {
    pub addr: SocketAddr,
    /// `name:port`, for logs.
    pub label: String,
    pub probe_request: Vec<u8>,
    pub content_request: Vec<u8>,
    pub accepted_encoding: ContentEncoding,
    pub if_none_match: Option<String>,
    pub has_if_modified_since: bool,
    pub client_http_11: bool,
}

struct StreamerInner {
    outbound: BytesMut,
    status: GatewayStatus,
    backend_buffer_full: bool,
}

struct StreamerShared {
    inner: Mutex<StreamerInner>,
    resume_reads: Notify,
    wake: mpsc::Sender<()>,
}

impl StreamerShared {
    /// Appends produced bytes and reports whether the outbound buffer
    /// is now over budget (reads must pause until the consumer
    /// drains).
    fn push_output(&self, data: &[u8], max_buffer: usize) -> bool {
        let mut inner = self.inner.lock().expect("streamer lock");
        inner.outbound.extend_from_slice(data);
        let full = inner.outbound.len() > max_buffer;
        if full {
            inner.backend_buffer_full = true;
        }
        drop(inner);
        let _ = self.wake.send(());
        full
    }

    fn set_terminal(&self, status: GatewayStatus) {
        let mut inner = self.inner.lock().expect("streamer lock");
        if inner.status == GatewayStatus::Ongoing {
            inner.status = status;
        }
        drop(inner);
        let _ = self.wake.send(());
    }

    fn finish(&self) {
        self.set_terminal(GatewayStatus::Finished);
    }

    fn fail(&self) {
        self.set_terminal(GatewayStatus::Failed);
    }
}

pub struct GatewayStreamer {
    shared: Arc<StreamerShared>,
    wake_rx: mpsc::Receiver<()>,
    task: Option<tokio::task::JoinHandle<()>>,
    _backend_guard: BackendRequestGuard,
    _request_guard: Option<ActiveRequestGuard>,
}

impl GatewayStreamer {
    /// Spawns the backend conversation onto `handle` and returns the
    /// consumer side.
    pub(crate) fn spawn(
        handle: &tokio::runtime::Handle,
        context: StreamerContext,
        conversation: Conversation,
        backend_guard: BackendRequestGuard,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel();
        let shared = Arc::new(StreamerShared {
            inner: Mutex::new(StreamerInner {
                outbound: BytesMut::new(),
                status: GatewayStatus::Ongoing,
                backend_buffer_full: false,
            }),
            resume_reads: Notify::new(),
            wake: wake_tx,
        });

        let task_shared = Arc::clone(&shared);
        let task = handle.spawn(async move {
            drive(&task_shared, &context, conversation).await;
        });

        Self {
            shared,
            wake_rx,
            task: Some(task),
            _backend_guard: backend_guard,
            _request_guard: None,
        }
    }

    /// Keeps the active-request registration alive for the lifetime of
    /// the stream.
    pub fn retain_request_guard(&mut self, guard: ActiveRequestGuard) {
        self._request_guard = Some(guard);
    }

    /// Returns up to the first `len` produced bytes without consuming
    /// them, waiting (in 100 ms slices) until that many bytes exist or
    /// the stream reaches a terminal state.
    pub fn peek_prefix(&self, len: usize) -> Bytes {
        loop {
            {
                let inner = self.shared.inner.lock().expect("streamer lock");
                if inner.outbound.len() >= len {
                    return Bytes::copy_from_slice(&inner.outbound[..len]);
                }
                if inner.status != GatewayStatus::Ongoing {
                    return Bytes::copy_from_slice(&inner.outbound);
                }
            }
            let _ = self.wake_rx.recv_timeout(CONSUMER_WAIT);
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.shared.inner.lock().expect("streamer lock").status
    }

    fn take_output(&self) -> Option<StreamChunk> {
        let mut inner = self.shared.inner.lock().expect("streamer lock");
        if !inner.outbound.is_empty() {
            let data = inner.outbound.split().freeze();
            if inner.backend_buffer_full {
                inner.backend_buffer_full = false;
                self.shared.resume_reads.notify_one();
            }
            return Some(StreamChunk::Data(data));
        }
        match inner.status {
            GatewayStatus::Finished => Some(StreamChunk::End),
            GatewayStatus::Failed => Some(StreamChunk::Aborted),
            GatewayStatus::Ongoing => None,
        }
    }
}

impl ContentStream for GatewayStreamer {
    fn next_chunk(&mut self) -> StreamChunk {
        if let Some(chunk) = self.take_output() {
            return chunk;
        }
        let _ = self.wake_rx.recv_timeout(CONSUMER_WAIT);
        self.take_output().unwrap_or(StreamChunk::Pending)
    }
}

impl Drop for GatewayStreamer {
    fn drop(&mut self) {
        // Cancelling the task closes the backend socket and the idle
        // timer with it.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum HeadOutcome {
    Parsed { head: ResponseHead, consumed: usize },
    Aborted,
}

async fn drive(shared: &Arc<StreamerShared>, ctx: &StreamerContext, conv: Conversation) {
    let mut socket = match TcpStream::connect(conv.addr).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(backend = %conv.label, error = %err, "backend connection failed");
            shared.fail();
            return;
        }
    };
    let _ = socket.set_nodelay(true);

    if let Err(err) = socket.write_all(&conv.probe_request).await {
        warn!(backend = %conv.label, error = %err, "backend write failed");
        shared.fail();
        return;
    }

    let mut head_buf = Vec::new();
    let head = match read_head(shared, ctx, &mut socket, &mut head_buf, &conv, "cache probe").await
    {
        HeadOutcome::Parsed { head, .. } => head,
        HeadOutcome::Aborted => return,
    };

    let Some(etag) = head.header("ETag").map(str::to_string) else {
        // Backend opted out of frontend caching; the probe connection
        // becomes the data connection and everything read so far goes
        // straight to the client.
        debug!(backend = %conv.label, "no ETag, passing response through");
        let full = shared.push_output(&head_buf, ctx.max_buffer_bytes);
        if full {
            shared.resume_reads.notified().await;
        }
        stream_body(shared, ctx, socket, &conv, None).await;
        return;
    };

    let cached = match conv.accepted_encoding {
        ContentEncoding::Gzip => ctx
            .gzip
            .find(&etag)
            .or_else(|| ctx.identity.find(&etag)),
        ContentEncoding::Identity => ctx.identity.find(&etag),
    };

    if let Some((buffer, metadata)) = cached {
        debug!(backend = %conv.label, etag = %etag, "serving response from cache");
        let response = build_cached_response(
            &conv,
            &metadata,
            head.header("Expires"),
            &buffer,
            &ctx.server_name,
        );
        {
            let mut inner = shared.inner.lock().expect("streamer lock");
            inner.outbound.extend_from_slice(&response);
            inner.status = GatewayStatus::Finished;
        }
        let _ = shared.wake.send(());
        // Dropping the socket ends the probe connection; the backend
        // body was never requested.
        return;
    }

    // Cache miss: fetch the content over a fresh connection, without
    // the probe header.
    drop(socket);
    head_buf.clear();

    let mut socket = match TcpStream::connect(conv.addr).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!(backend = %conv.label, error = %err, "backend reconnect failed");
            shared.fail();
            return;
        }
    };
    let _ = socket.set_nodelay(true);

    if let Err(err) = socket.write_all(&conv.content_request).await {
        warn!(backend = %conv.label, error = %err, "backend write failed");
        shared.fail();
        return;
    }

    let (head, consumed) =
        match read_head(shared, ctx, &mut socket, &mut head_buf, &conv, "content fetch").await {
            HeadOutcome::Parsed { head, consumed } => (head, consumed),
            HeadOutcome::Aborted => return,
        };

    let staging = evaluate_cacheability(&head).map(|metadata| {
        let mut staging = BytesMut::new();
        staging.extend_from_slice(&head_buf[consumed..]);
        Staging { metadata, body: staging }
    });

    let full = shared.push_output(&head_buf, ctx.max_buffer_bytes);
    if full {
        shared.resume_reads.notified().await;
    }
    stream_body(shared, ctx, socket, &conv, staging).await;
}

async fn read_head(
    shared: &Arc<StreamerShared>,
    ctx: &StreamerContext,
    socket: &mut TcpStream,
    head_buf: &mut Vec<u8>,
    conv: &Conversation,
    phase: &str,
) -> HeadOutcome {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match timeout(ctx.idle_timeout, socket.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!(backend = %conv.label, phase, error = %err, "backend read failed");
                shared.fail();
                return HeadOutcome::Aborted;
            }
            Err(_) => {
                warn!(backend = %conv.label, phase, "backend timed out");
                shared.fail();
                return HeadOutcome::Aborted;
            }
        };
        if read == 0 {
            warn!(backend = %conv.label, phase, "backend closed before response head");
            shared.fail();
            return HeadOutcome::Aborted;
        }
        head_buf.extend_from_slice(&chunk[..read]);

        match wire::parse_response_head(head_buf) {
            ParseOutcome::Complete { head, consumed } => {
                return HeadOutcome::Parsed { head, consumed };
            }
            ParseOutcome::Incomplete => continue,
            ParseOutcome::Failed(reason) => {
                warn!(backend = %conv.label, phase, reason = %reason, "garbled backend response");
                shared.fail();
                return HeadOutcome::Aborted;
            }
        }
    }
}

struct Staging {
    metadata: CachedResponseMetadata,
    body: BytesMut,
}

/// A response is cacheable iff it has an ETag and a Content-Type, no
/// Transfer-Encoding, and status 200.
fn evaluate_cacheability(head: &ResponseHead) -> Option<CachedResponseMetadata> {
    let etag = head.header("ETag")?;
    let mime_type = head.header("Content-Type")?;
    if head.header("Transfer-Encoding").is_some() || head.status != 200 {
        return None;
    }
    Some(CachedResponseMetadata {
        etag: etag.to_string(),
        mime_type: mime_type.to_string(),
        cache_control: head.header("Cache-Control").map(str::to_string),
        expires: head.header("Expires").map(str::to_string),
        vary: head.header("Vary").map(str::to_string),
        access_control_allow_origin: head
            .header("Access-Control-Allow-Origin")
            .map(str::to_string),
        content_encoding: wire::response_encoding(head),
        buffer_hash: 0,
    })
}

async fn stream_body(
    shared: &Arc<StreamerShared>,
    ctx: &StreamerContext,
    mut socket: TcpStream,
    conv: &Conversation,
    mut staging: Option<Staging>,
) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match timeout(ctx.idle_timeout, socket.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!(backend = %conv.label, error = %err, "backend read failed mid-body");
                shared.fail();
                return;
            }
            Err(_) => {
                // Timed-out responses are never cached.
                warn!(backend = %conv.label, "backend idle timeout");
                shared.fail();
                return;
            }
        };

        if read == 0 {
            if let Some(staging) = staging.take() {
                if !staging.body.is_empty() {
                    let pool = ctx.pool(staging.metadata.content_encoding);
                    pool.insert(staging.metadata, staging.body.freeze());
                }
            }
            shared.finish();
            return;
        }

        if let Some(st) = staging.as_mut() {
            st.body.extend_from_slice(&chunk[..read]);
            if st.body.len() > ctx.max_cached_buffer_bytes {
                debug!(backend = %conv.label, "staged body over limit, abandoning cache");
                staging = None;
            }
        }

        let full = shared.push_output(&chunk[..read], ctx.max_buffer_bytes);
        if full {
            // The consumer relaunches us once it has drained the
            // outbound buffer; while parked, the idle timer is idle
            // too.
            shared.resume_reads.notified().await;
        }
    }
}

/// Synthesizes the full client response for a cache hit. An `Expires`
/// header on the probe response overrides the cached value for this
/// response only.
fn build_cached_response(
    conv: &Conversation,
    metadata: &CachedResponseMetadata,
    probe_expires: Option<&str>,
    buffer: &Bytes,
    frontend_host: &str,
) -> Vec<u8> {
    let version = if conv.client_http_11 {
        "HTTP/1.1"
    } else {
        "HTTP/1.0"
    };

    let not_modified = match conv.if_none_match.as_deref() {
        Some(presented) => presented == metadata.etag,
        None => conv.has_if_modified_since,
    };

    let expires = probe_expires
        .or(metadata.expires.as_deref())
        .unwrap_or(EPOCH_EXPIRES);
    let cache_control = metadata
        .cache_control
        .as_deref()
        .unwrap_or("must-revalidate");
    let vary = metadata.vary.as_deref().unwrap_or("Accept-Encoding");

    let mut out = String::new();
    if not_modified {
        out.push_str(version);
        out.push_str(" 304 Not Modified\r\n");
    } else {
        out.push_str(version);
        out.push_str(" 200 OK\r\n");
    }

    out.push_str("Date: ");
    out.push_str(&httpdate::fmt_http_date(SystemTime::now()));
    out.push_str("\r\n");
    out.push_str("Server: ");
    out.push_str(SERVER_IDENT);
    out.push_str("\r\n");
    out.push_str("X-Frontend-Server: ");
    out.push_str(frontend_host);
    out.push_str("\r\n");
    if conv.client_http_11 {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("ETag: ");
    out.push_str(&metadata.etag);
    out.push_str("\r\n");
    out.push_str("Expires: ");
    out.push_str(expires);
    out.push_str("\r\n");
    out.push_str("Cache-Control: ");
    out.push_str(cache_control);
    out.push_str("\r\n");
    out.push_str("Vary: ");
    out.push_str(vary);
    out.push_str("\r\n");
    if let Some(origin) = metadata.access_control_allow_origin.as_deref() {
        out.push_str("Access-Control-Allow-Origin: ");
        out.push_str(origin);
        out.push_str("\r\n");
    }

    if !not_modified {
        out.push_str("Content-Type: ");
        out.push_str(&metadata.mime_type);
        out.push_str("\r\n");
        if metadata.content_encoding == ContentEncoding::Gzip {
            out.push_str("Content-Encoding: gzip\r\n");
        }
        out.push_str("Content-Length: ");
        out.push_str(&buffer.len().to_string());
        out.push_str("\r\n");
        out.push_str("X-Frontend-Cache-Hit: true\r\n");
    }
    out.push_str("\r\n");

    let mut bytes = out.into_bytes();
    if !not_modified {
        bytes.extend_from_slice(buffer);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ByteSize, CacheSection};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};
    use tempfile::TempDir;

    fn head_of(raw: &[u8]) -> ResponseHead {
        match wire::parse_response_head(raw) {
            ParseOutcome::Complete { head, .. } => head,
            other => panic!("expected complete head, got {other:?}"),
        }
    }

    #[test]
    fn cacheability_requires_etag_mime_and_200() {
        let ok = b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Type: text/plain\r\n\r\n";
        assert!(evaluate_cacheability(&head_of(ok)).is_some());

        let no_etag = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        assert!(evaluate_cacheability(&head_of(no_etag)).is_none());

        let no_mime = b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\n\r\n";
        assert!(evaluate_cacheability(&head_of(no_mime)).is_none());

        let chunked =
            b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Type: a/b\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(evaluate_cacheability(&head_of(chunked)).is_none());

        let not_ok = b"HTTP/1.1 404 Not Found\r\nETag: \"v1\"\r\nContent-Type: a/b\r\n\r\n";
        assert!(evaluate_cacheability(&head_of(not_ok)).is_none());
    }

    #[test]
    fn cacheability_copies_replay_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nETag: \"v2\"\r\nContent-Type: image/png\r\n\
            Cache-Control: max-age=60\r\nExpires: Sat, 01 Jan 2028 00:00:00 GMT\r\n\
            Vary: Accept\r\nAccess-Control-Allow-Origin: *\r\nContent-Encoding: gzip\r\n\r\n";
        let metadata = evaluate_cacheability(&head_of(raw)).unwrap();

        assert_eq!(metadata.etag, "\"v2\"");
        assert_eq!(metadata.mime_type, "image/png");
        assert_eq!(metadata.cache_control.as_deref(), Some("max-age=60"));
        assert_eq!(
            metadata.expires.as_deref(),
            Some("Sat, 01 Jan 2028 00:00:00 GMT")
        );
        assert_eq!(metadata.vary.as_deref(), Some("Accept"));
        assert_eq!(metadata.access_control_allow_origin.as_deref(), Some("*"));
        assert_eq!(metadata.content_encoding, ContentEncoding::Gzip);
    }

    fn conversation(if_none_match: Option<&str>, has_ims: bool) -> Conversation {
        Conversation {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1)),
            label: "alpha:1".to_string(),
            probe_request: Vec::new(),
            content_request: Vec::new(),
            accepted_encoding: ContentEncoding::Identity,
            if_none_match: if_none_match.map(str::to_string),
            has_if_modified_since: has_ims,
            client_http_11: true,
        }
    }

    fn sample_metadata() -> CachedResponseMetadata {
        CachedResponseMetadata {
            etag: "\"v7\"".to_string(),
            mime_type: "image/png".to_string(),
            cache_control: Some("max-age=60".to_string()),
            expires: None,
            vary: None,
            access_control_allow_origin: None,
            content_encoding: ContentEncoding::Identity,
            buffer_hash: 0,
        }
    }

    #[test]
    fn cached_response_full_body() {
        let body = Bytes::from_static(b"pngpngpng");
        let raw = build_cached_response(
            &conversation(None, false),
            &sample_metadata(),
            None,
            &body,
            "front-1",
        );
        let text = String::from_utf8_lossy(&raw);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Frontend-Cache-Hit: true\r\n"));
        assert!(text.contains("X-Frontend-Server: front-1\r\n"));
        assert!(text.contains("Content-Type: image/png\r\n"));
        assert!(text.contains("Content-Length: 9\r\n"));
        assert!(text.contains("Cache-Control: max-age=60\r\n"));
        assert!(text.contains(&format!("Expires: {EPOCH_EXPIRES}\r\n")));
        assert!(text.contains("Vary: Accept-Encoding\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("pngpngpng"));
    }

    #[test]
    fn cached_response_matching_etag_is_not_modified() {
        let body = Bytes::from_static(b"ignored");
        let raw = build_cached_response(
            &conversation(Some("\"v7\""), false),
            &sample_metadata(),
            None,
            &body,
            "front-1",
        );
        let text = String::from_utf8_lossy(&raw);

        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(text.contains("ETag: \"v7\"\r\n"));
        assert!(!text.contains("X-Frontend-Cache-Hit"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn cached_response_mismatched_etag_sends_body() {
        let body = Bytes::from_static(b"data");
        let raw = build_cached_response(
            &conversation(Some("\"old\""), true),
            &sample_metadata(),
            None,
            &body,
            "front-1",
        );
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("data"));
    }

    #[test]
    fn cached_response_if_modified_since_is_not_modified() {
        let body = Bytes::from_static(b"ignored");
        let raw = build_cached_response(
            &conversation(None, true),
            &sample_metadata(),
            None,
            &body,
            "front-1",
        );
        assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 304 Not Modified\r\n"));
    }

    #[test]
    fn probe_expires_overrides_cached_value() {
        let mut metadata = sample_metadata();
        metadata.expires = Some("Sat, 01 Jan 2028 00:00:00 GMT".to_string());
        let raw = build_cached_response(
            &conversation(None, false),
            &metadata,
            Some("Sun, 02 Jan 2028 00:00:00 GMT"),
            &Bytes::from_static(b"x"),
            "front-1",
        );
        let text = String::from_utf8_lossy(&raw);
        assert!(text.contains("Expires: Sun, 02 Jan 2028 00:00:00 GMT\r\n"));
        assert!(!text.contains("Expires: Sat, 01 Jan 2028 00:00:00 GMT\r\n"));
    }

    struct TestHarness {
        _dirs: (TempDir, TempDir),
        context: StreamerContext,
        runtime: tokio::runtime::Runtime,
        counter: Arc<crate::proxy::requests::BackendRequestCounter>,
    }

    fn harness() -> TestHarness {
        let gz_dir = TempDir::new().unwrap();
        let id_dir = TempDir::new().unwrap();
        let section = |dir: &TempDir| CacheSection {
            memory_bytes: ByteSize(1024 * 1024),
            filesystem_bytes: ByteSize(1024 * 1024),
            directory: Some(dir.path().to_path_buf()),
        };
        let context = StreamerContext {
            gzip: Arc::new(ResponseCache::open("gzip", &section(&gz_dir)).unwrap()),
            identity: Arc::new(ResponseCache::open("identity", &section(&id_dir)).unwrap()),
            idle_timeout: Duration::from_secs(5),
            max_buffer_bytes: 1024 * 1024,
            max_cached_buffer_bytes: 1024 * 1024,
            server_name: "front-1".to_string(),
        };
        TestHarness {
            _dirs: (gz_dir, id_dir),
            context,
            runtime: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_io()
                .enable_time()
                .build()
                .unwrap(),
            counter: Arc::new(crate::proxy::requests::BackendRequestCounter::new()),
        }
    }

    /// One-shot mock backend: each accepted connection gets the next
    /// scripted response, then the socket is closed.
    fn scripted_backend(responses: Vec<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = match listener.accept() {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let mut seen = Vec::new();
                while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => seen.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(&response);
            }
        });
        addr
    }

    fn drain(streamer: &mut GatewayStreamer) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match streamer.next_chunk() {
                StreamChunk::Data(data) => out.extend_from_slice(&data),
                StreamChunk::Pending => continue,
                StreamChunk::End => return (out, true),
                StreamChunk::Aborted => return (out, false),
            }
        }
    }

    fn spawn_streamer(
        harness: &TestHarness,
        addr: SocketAddr,
        accepted: ContentEncoding,
    ) -> GatewayStreamer {
        let conv = Conversation {
            addr,
            label: format!("alpha:{}", addr.port()),
            probe_request: b"GET /x HTTP/1.1\r\nX-Request-ETag: true\r\n\r\n".to_vec(),
            content_request: b"GET /x HTTP/1.1\r\n\r\n".to_vec(),
            accepted_encoding: accepted,
            if_none_match: None,
            has_if_modified_since: false,
            client_http_11: true,
        };
        let guard = harness.counter.start("alpha", addr.port());
        GatewayStreamer::spawn(harness.runtime.handle(), harness.context.clone(), conv, guard)
    }

    #[test]
    fn no_etag_response_passes_through_verbatim() {
        let harness = harness();
        let addr = scripted_backend(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
        ]);

        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        let (bytes, clean) = drain(&mut streamer);

        assert!(clean);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));
        assert!(!text.contains("X-Frontend-Cache-Hit"));
    }

    #[test]
    fn etag_miss_fetches_and_caches_content() {
        let harness = harness();
        let probe = b"HTTP/1.1 200 OK\r\nETag: \"v7\"\r\nContent-Type: text/plain\r\n\r\n".to_vec();
        let content =
            b"HTTP/1.1 200 OK\r\nETag: \"v7\"\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\nbody"
                .to_vec();
        let addr = scripted_backend(vec![probe, content]);

        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        let (bytes, clean) = drain(&mut streamer);

        assert!(clean);
        assert!(String::from_utf8_lossy(&bytes).ends_with("body"));

        let (cached, metadata) = harness.context.identity.find("\"v7\"").unwrap();
        assert_eq!(cached, Bytes::from_static(b"body"));
        assert_eq!(metadata.mime_type, "text/plain");
    }

    #[test]
    fn etag_hit_is_served_without_content_fetch() {
        let harness = harness();
        harness.context.identity.insert(
            sample_metadata(),
            Bytes::from_static(b"cached-body"),
        );

        // Only one scripted response: a second connection would hang.
        let probe = b"HTTP/1.1 200 OK\r\nETag: \"v7\"\r\nContent-Type: image/png\r\n\r\n".to_vec();
        let addr = scripted_backend(vec![probe]);

        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        let (bytes, clean) = drain(&mut streamer);

        assert!(clean);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("X-Frontend-Cache-Hit: true\r\n"));
        assert!(text.ends_with("cached-body"));
    }

    #[test]
    fn gzip_client_falls_back_to_identity_pool() {
        let harness = harness();
        harness
            .context
            .identity
            .insert(sample_metadata(), Bytes::from_static(b"plain-body"));

        let probe = b"HTTP/1.1 200 OK\r\nETag: \"v7\"\r\nContent-Type: image/png\r\n\r\n".to_vec();
        let addr = scripted_backend(vec![probe]);

        // The compressed pool is empty; the identity entry still
        // satisfies a gzip-accepting client.
        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Gzip);
        let (bytes, clean) = drain(&mut streamer);

        assert!(clean);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("X-Frontend-Cache-Hit: true\r\n"));
        assert!(!text.contains("Content-Encoding"));
        assert!(text.ends_with("plain-body"));
    }

    #[test]
    fn connect_failure_fails_the_stream() {
        let harness = harness();
        // Nothing listens here.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        let (bytes, clean) = drain(&mut streamer);
        assert!(!clean);
        assert!(bytes.is_empty());
    }

    #[test]
    fn peek_prefix_sees_status_line_without_consuming() {
        let harness = harness();
        let addr = scripted_backend(vec![
            b"HTTP/1.1 3210 Shutdown\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ]);

        let mut streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        let peeked = streamer.peek_prefix(13);
        assert_eq!(&peeked[..], b"HTTP/1.1 3210");

        // The peeked bytes are still delivered to the consumer.
        let (bytes, clean) = drain(&mut streamer);
        assert!(clean);
        assert!(bytes.starts_with(b"HTTP/1.1 3210"));
    }

    #[test]
    fn drop_decrements_backend_counter() {
        let harness = harness();
        let addr = scripted_backend(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec(),
        ]);

        let streamer = spawn_streamer(&harness, addr, ContentEncoding::Identity);
        assert_eq!(harness.counter.in_flight("alpha", addr.port()), 1);
        drop(streamer);
        assert_eq!(harness.counter.in_flight("alpha", addr.port()), 0);
    }
}
