//! Request routing: service lookup, URI and header rewriting, backend
//! selection with deny-retries, and failure classification.

use crate::proxy::core::{ForwardOutcome, ProxyCore};
use crate::registry::{Backend, Service, ServiceRegistry};
use crate::traits::{ClientRequest, GatewayReply, ReplyBody, RequestHandler};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on deny-retries for one client request. A cluster in
/// which every backend keeps denying must not spin forever.
const MAX_DENY_RETRIES: usize = 8;

pub struct Router {
    core: Arc<ProxyCore>,
    registry: Arc<dyn ServiceRegistry>,
}

enum Rewrite {
    Resource(String),
    Contradiction,
}

impl Router {
    pub fn new(core: Arc<ProxyCore>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self { core, registry }
    }

    fn transport(&self, request: &ClientRequest) -> GatewayReply {
        let guard = self
            .core
            .active_requests
            .register(request.client_ip, &request.uri);

        let mut forwarded = request.clone();
        rewrite_headers(&mut forwarded);

        let mut denies = 0usize;
        let mut previous_backend: Option<Backend> = None;

        loop {
            let Some(service) = self.registry.service_for(forwarded.path()) else {
                debug!(path = %forwarded.path(), "no service for path");
                return GatewayReply::text(StatusCode::NOT_FOUND, "Service not found\n");
            };

            let Some(backend) = self.registry.backend_for(&service) else {
                warn!(prefix = %service.prefix, "service has no backend");
                return GatewayReply::text(StatusCode::BAD_GATEWAY, "No backend available\n");
            };

            if previous_backend.as_ref() == Some(&backend) {
                warn!(
                    backend = %backend.name,
                    port = backend.port,
                    "same backend selected twice in a row, giving up"
                );
                return GatewayReply::text(StatusCode::BAD_GATEWAY, "No backend available\n");
            }

            if !self.registry.backend_alive(&backend.name, backend.port) {
                info!(
                    backend = %backend.name,
                    port = backend.port,
                    "backend is marked as dead, retiring it"
                );
                self.registry.remove_backend(&backend.name, backend.port);
                self.core.counter.remove_backend(&backend.name, backend.port);
                previous_backend = Some(backend);
                continue;
            }

            let resource = match rewrite_resource(&service, &backend, &forwarded.uri) {
                Rewrite::Resource(resource) => resource,
                Rewrite::Contradiction => {
                    warn!(
                        uri = %forwarded.uri,
                        prefix = %service.prefix,
                        backend = %backend.name,
                        "request resource matches neither the service prefix nor the host alias"
                    );
                    return GatewayReply::text(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Request routing failed\n",
                    );
                }
            };

            match self.core.forward(&forwarded, &backend, &resource) {
                ForwardOutcome::Success(mut streamer) => {
                    self.registry
                        .signal_backend_connection(&backend.name, backend.port);
                    streamer.retain_request_guard(guard);
                    return GatewayReply {
                        status: StatusCode::OK,
                        headers: Vec::new(),
                        body: ReplyBody::Stream(Box::new(streamer)),
                    };
                }
                ForwardOutcome::RemoteDenied => {
                    denies += 1;
                    if denies > MAX_DENY_RETRIES {
                        warn!(uri = %forwarded.uri, "deny-retry budget exhausted");
                        return GatewayReply::text(
                            StatusCode::BAD_GATEWAY,
                            "No backend available\n",
                        );
                    }
                    info!(uri = %forwarded.uri, "resending request");
                    std::thread::sleep(retry_jitter());
                    previous_backend = Some(backend);
                    continue;
                }
                ForwardOutcome::RemoteHostFailed => {
                    // A crashed backend may have been crashed by this
                    // very request, so it is not retried.
                    warn!(
                        backend = %backend.name,
                        port = backend.port,
                        "backend connection failed, retiring the backend"
                    );
                    self.registry.remove_backend(&backend.name, backend.port);
                    self.core.counter.remove_backend(&backend.name, backend.port);
                    return GatewayReply::text(StatusCode::BAD_GATEWAY, "Backend failed\n");
                }
            }
        }
    }
}

impl RequestHandler for Router {
    fn handle(&self, request: &ClientRequest) -> GatewayReply {
        self.transport(request)
    }
}

fn retry_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(10..=50))
}

/// Adds the forwarding headers and pins `Connection: close` (the
/// gateway does not pipeline backend requests).
fn rewrite_headers(request: &mut ClientRequest) {
    // The cache-probe header is gateway-internal; clients must not
    // smuggle it through.
    request.headers.remove("x-request-etag");
    if !request.headers.contains_key("x-forwarded-for") {
        let client = request.client_ip.to_string();
        if let Ok(value) = HeaderValue::from_str(&client) {
            request
                .headers
                .insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    if !request.headers.contains_key("x-forwarded-proto") {
        let proto = if request.encrypted { "https" } else { "http" };
        request.headers.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static(proto),
        );
    }
    request.headers.insert(
        http::header::CONNECTION,
        HeaderValue::from_static("close"),
    );
}

/// Maps the client resource onto the backend resource, honoring the
/// `/backend-name` aliasing form.
fn rewrite_resource(service: &Service, backend: &Backend, uri: &str) -> Rewrite {
    let (path, query) = match uri.find('?') {
        Some(idx) => (&uri[..idx], Some(&uri[idx..])),
        None => (uri, None),
    };
    let host_prefix = format!("/{}", backend.name);

    let rewritten = if service.defines_prefix {
        let path = if path.starts_with(&service.prefix) {
            path.to_string()
        } else if let Some(rest) = path.strip_prefix(&format!("{host_prefix}/")) {
            format!("/{rest}")
        } else {
            path.to_string()
        };
        if !path.starts_with(&service.prefix) {
            return Rewrite::Contradiction;
        }
        path
    } else if path == service.prefix {
        path.to_string()
    } else if path == format!("{host_prefix}{}", service.prefix) {
        service.prefix.clone()
    } else {
        return Rewrite::Contradiction;
    };

    match query {
        Some(query) => Rewrite::Resource(format!("{rewritten}{query}")),
        None => Rewrite::Resource(rewritten),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Version};
    use std::net::{IpAddr, Ipv4Addr};

    fn service(prefix: &str, defines_prefix: bool) -> Service {
        Service {
            prefix: prefix.to_string(),
            defines_prefix,
        }
    }

    fn backend(name: &str) -> Backend {
        Backend::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
    }

    fn resource(service: &Service, backend: &Backend, uri: &str) -> Option<String> {
        match rewrite_resource(service, backend, uri) {
            Rewrite::Resource(resource) => Some(resource),
            Rewrite::Contradiction => None,
        }
    }

    #[test]
    fn prefix_service_forwards_direct_match() {
        let svc = service("/timeseries", true);
        let be = backend("alpha");
        assert_eq!(
            resource(&svc, &be, "/timeseries?q=1").as_deref(),
            Some("/timeseries?q=1")
        );
        assert_eq!(
            resource(&svc, &be, "/timeseries/sub").as_deref(),
            Some("/timeseries/sub")
        );
    }

    #[test]
    fn prefix_service_strips_host_alias() {
        let svc = service("/data", true);
        let be = backend("alpha");
        assert_eq!(
            resource(&svc, &be, "/alpha/data?x=1").as_deref(),
            Some("/data?x=1")
        );
    }

    #[test]
    fn prefix_service_rejects_foreign_path() {
        let svc = service("/data", true);
        let be = backend("alpha");
        assert!(resource(&svc, &be, "/elsewhere").is_none());
        assert!(resource(&svc, &be, "/alpha/elsewhere").is_none());
    }

    #[test]
    fn exact_service_forwards_exact_match_only() {
        let svc = service("/data", false);
        let be = backend("alpha");
        assert_eq!(resource(&svc, &be, "/data").as_deref(), Some("/data"));
        assert_eq!(
            resource(&svc, &be, "/alpha/data?x=1").as_deref(),
            Some("/data?x=1")
        );
        assert!(resource(&svc, &be, "/data/sub").is_none());
        assert!(resource(&svc, &be, "/beta/data").is_none());
    }

    fn request() -> ClientRequest {
        ClientRequest {
            method: Method::GET,
            uri: "/x".to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            encrypted: false,
        }
    }

    #[test]
    fn header_rewrite_strips_probe_header() {
        let mut req = request();
        req.headers.insert(
            HeaderName::from_static("x-request-etag"),
            HeaderValue::from_static("true"),
        );
        rewrite_headers(&mut req);
        assert!(!req.headers.contains_key("x-request-etag"));
    }

    #[test]
    fn header_rewrite_adds_forwarding_headers() {
        let mut req = request();
        rewrite_headers(&mut req);

        assert_eq!(
            req.headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9"
        );
        assert_eq!(req.headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(req.headers.get("connection").unwrap(), "close");
    }

    #[test]
    fn header_rewrite_keeps_existing_forwarding_headers() {
        let mut req = request();
        req.headers.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("198.51.100.1"),
        );
        req.headers.insert(
            HeaderName::from_static("x-forwarded-proto"),
            HeaderValue::from_static("https"),
        );
        rewrite_headers(&mut req);

        assert_eq!(
            req.headers.get("x-forwarded-for").unwrap(),
            "198.51.100.1"
        );
        assert_eq!(req.headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn header_rewrite_uses_encryption_for_proto() {
        let mut req = request();
        req.encrypted = true;
        rewrite_headers(&mut req);
        assert_eq!(req.headers.get("x-forwarded-proto").unwrap(), "https");
    }
}
