//! Ownership hub of the gateway.
//!
//! One `ProxyCore` owns the two response-cache pools, the backend I/O
//! runtime, the in-flight bookkeeping, and the pause state. The
//! router borrows it to run individual forwards; the admin plane
//! borrows it to report on all of the above.

use crate::admin::pause::PauseState;
use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::proxy::requests::{ActiveRequests, BackendRequestCounter};
use crate::proxy::streamer::{Conversation, GatewayStatus, GatewayStreamer, StreamerContext};
use crate::proxy::wire::{self, ContentEncoding};
use crate::registry::Backend;
use crate::traits::ClientRequest;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of one backend conversation attempt, judged from its first
/// bytes.
pub enum ForwardOutcome {
    /// The conversation is under way; relay the stream to the client.
    Success(GatewayStreamer),
    /// The backend asked us to go elsewhere (shutdown or high load).
    RemoteDenied,
    /// The backend could not be talked to; it may have crashed.
    RemoteHostFailed,
}

pub struct ProxyCore {
    gzip_cache: Arc<ResponseCache>,
    identity_cache: Arc<ResponseCache>,
    runtime: tokio::runtime::Runtime,
    pub counter: Arc<BackendRequestCounter>,
    pub active_requests: Arc<ActiveRequests>,
    pub pause: Arc<PauseState>,
    idle_timeout: Duration,
    max_buffer_bytes: usize,
    max_cached_buffer_bytes: usize,
    server_name: String,
    started: Instant,
}

impl ProxyCore {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Arc<Self>> {
        let threads = config.backend.threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("backend-io")
            .enable_io()
            .enable_time()
            .build()?;

        info!(
            backend_threads = threads,
            backend_timeout_secs = config.backend.timeout,
            "proxy core starting"
        );

        Ok(Arc::new(Self {
            gzip_cache: Arc::new(ResponseCache::open("gzip", &config.compressed_cache)?),
            identity_cache: Arc::new(ResponseCache::open(
                "identity",
                &config.uncompressed_cache,
            )?),
            runtime,
            counter: Arc::new(BackendRequestCounter::new()),
            active_requests: Arc::new(ActiveRequests::new()),
            pause: Arc::new(PauseState::new()),
            idle_timeout: Duration::from_secs(config.backend.timeout.max(1)),
            max_buffer_bytes: config.backend.max_buffer_bytes.bytes() as usize,
            max_cached_buffer_bytes: config.backend.max_cached_buffer_bytes.bytes() as usize,
            server_name: config.server_name(),
            started: Instant::now(),
        }))
    }

    pub fn cache(&self, encoding: ContentEncoding) -> &Arc<ResponseCache> {
        match encoding {
            ContentEncoding::Gzip => &self.gzip_cache,
            ContentEncoding::Identity => &self.identity_cache,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Seconds since the gateway came up; used for admin rate figures.
    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64().max(f64::EPSILON)
    }

    /// Runs one conversation against `backend` for the (already
    /// rewritten) request, and classifies its first bytes.
    pub fn forward(
        self: &Arc<Self>,
        request: &ClientRequest,
        backend: &Backend,
        resource: &str,
    ) -> ForwardOutcome {
        let context = StreamerContext {
            gzip: Arc::clone(&self.gzip_cache),
            identity: Arc::clone(&self.identity_cache),
            idle_timeout: self.idle_timeout,
            max_buffer_bytes: self.max_buffer_bytes,
            max_cached_buffer_bytes: self.max_cached_buffer_bytes,
            server_name: self.server_name.clone(),
        };

        let conversation = Conversation {
            addr: SocketAddr::new(backend.ip, backend.port),
            label: format!("{}:{}", backend.name, backend.port),
            probe_request: wire::serialize_request(request, resource, true),
            content_request: wire::serialize_request(request, resource, false),
            accepted_encoding: wire::accepted_encoding(request),
            if_none_match: request.header("If-None-Match").map(str::to_string),
            has_if_modified_since: request.header("If-Modified-Since").is_some(),
            client_http_11: request.version != http::Version::HTTP_10,
        };

        let guard = self.counter.start(&backend.name, backend.port);
        let streamer =
            GatewayStreamer::spawn(self.runtime.handle(), context, conversation, guard);

        // The only way to learn the status of a gateway response is to
        // look at the byte stream: "HTTP/1.x NNNN" is 13 bytes.
        let prefix = streamer.peek_prefix(13);
        if prefix.len() < 13 {
            if streamer.status() == GatewayStatus::Failed {
                return ForwardOutcome::RemoteHostFailed;
            }
            // Terminal with a short buffer can only be a failure, but
            // be conservative about anything unexpected.
            warn!(
                backend = %backend.name,
                port = backend.port,
                "backend reply ended before a status line"
            );
            return ForwardOutcome::RemoteHostFailed;
        }

        match &prefix[9..13] {
            b"3210" => {
                info!(
                    backend = %backend.name,
                    port = backend.port,
                    "backend shutting down, resending to another backend"
                );
                ForwardOutcome::RemoteDenied
            }
            b"1234" => {
                info!(
                    backend = %backend.name,
                    port = backend.port,
                    "backend under high load, resending to another backend"
                );
                ForwardOutcome::RemoteDenied
            }
            _ => ForwardOutcome::Success(streamer),
        }
    }
}
