//! Aggregating admin verbs ask every backend the same question over
//! plain short-lived sockets. The sockets deliberately do not share
//! the proxy's backend runtime: a wedged aggregation must never eat
//! into forwarding capacity, so each call brings its own little
//! current-thread runtime and throws it away afterwards.

use crate::registry::Backend;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

pub const FANOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// One backend's answer, already stripped down to the response body.
#[derive(Debug, Clone)]
pub struct BackendBody {
    pub backend: String,
    pub body: String,
}

/// Sends `GET /admin?what=<verb>&format=<format>` to every backend in
/// parallel and collects the bodies. Backends that fail or time out
/// are logged and skipped; aggregation is best-effort.
pub fn collect(backends: &[Backend], verb: &str, format: &str) -> Vec<BackendBody> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!(error = %err, "could not build fan-out runtime");
            return Vec::new();
        }
    };

    let request = format!(
        "GET /admin?what={verb}&format={format} HTTP/1.0\r\nAccept: */*\r\nConnection: close\r\n\r\n"
    );

    runtime.block_on(async {
        let queries = backends.iter().map(|backend| {
            let request = request.clone();
            async move {
                match timeout(FANOUT_TIMEOUT, fetch(backend, &request)).await {
                    Ok(Ok(body)) => Some(BackendBody {
                        backend: backend.name.clone(),
                        body,
                    }),
                    Ok(Err(err)) => {
                        warn!(
                            backend = %backend.name,
                            port = backend.port,
                            error = %err,
                            "backend admin query failed"
                        );
                        None
                    }
                    Err(_) => {
                        warn!(
                            backend = %backend.name,
                            port = backend.port,
                            "backend admin query timed out"
                        );
                        None
                    }
                }
            }
        });
        join_all(queries).await.into_iter().flatten().collect()
    })
}

async fn fetch(backend: &Backend, request: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect((backend.ip, backend.port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    Ok(strip_head(&raw))
}

/// Drops the response head; everything after the blank line is body.
fn strip_head(raw: &[u8]) -> String {
    let body = match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => &raw[idx + 4..],
        None => raw,
    };
    String::from_utf8_lossy(body).into_owned()
}
