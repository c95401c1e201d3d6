//! Admin plane: `/admin?what=<verb>` plus the `/` health endpoint.

pub mod auth;
pub mod fanout;
pub mod format;
pub mod grid;
pub mod pause;
pub mod qengine;

use crate::config::GatewayConfig;
use crate::proxy::core::ProxyCore;
use crate::proxy::wire::ContentEncoding;
use crate::registry::ServiceRegistry;
use crate::traits::{ClientRequest, GatewayReply, ReplyBody, RequestHandler};
use self::format::{OutputFormat, Table};
use self::pause::PauseState;
use bytes::Bytes;
use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const RESPONSE_EXPIRES_SECS: u64 = 60;
/// Longest `X-Frontend-Error` value we will emit.
const MAX_ERROR_HEADER_CHARS: usize = 300;

const VERBS: &[&str] = &[
    "activebackends",
    "activerequests",
    "backends",
    "cachestats",
    "clusterinfo",
    "continue",
    "gridgenerations",
    "gridgenerationsqd",
    "list",
    "pause",
    "qengine",
];

enum AdminError {
    BadRequest(String),
    Unauthorized,
    NotImplemented(String),
}

pub struct AdminPlane {
    core: Arc<ProxyCore>,
    registry: Arc<dyn ServiceRegistry>,
    credentials: Option<(String, String)>,
    realm: String,
}

impl AdminPlane {
    pub fn new(
        core: Arc<ProxyCore>,
        registry: Arc<dyn ServiceRegistry>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            core,
            registry,
            credentials: config.admin_credentials(),
            realm: config
                .admin
                .realm
                .clone()
                .unwrap_or_else(|| "gateway-admin".to_string()),
        }
    }

    fn dispatch(
        &self,
        request: &ClientRequest,
        format: OutputFormat,
    ) -> Result<String, AdminError> {
        let what = request.param("what").unwrap_or_default();
        if what.is_empty() {
            return Err(AdminError::NotImplemented(
                "No request specified".to_string(),
            ));
        }

        match what.as_str() {
            "clusterinfo" => Ok(self.registry.cluster_status()),
            "backends" => Ok(self.backends_table(request, format)),
            "qengine" => self.qengine(request, format),
            "gridgenerations" => Ok(self.grid_generations("gridgenerations", format)),
            "gridgenerationsqd" => Ok(self.grid_generations("gridgenerationsqd", format)),
            "activerequests" => Ok(self.active_requests(format)),
            "activebackends" => Ok(self.active_backends(format)),
            "cachestats" => Ok(self.cache_stats(format)),
            "pause" => self.pause(request),
            "continue" => self.resume(request),
            "list" => Ok(self.list(format)),
            other => Err(AdminError::NotImplemented(format!(
                "Unknown request: '{other}'"
            ))),
        }
    }

    fn backends_table(&self, request: &ClientRequest, format: OutputFormat) -> String {
        let service = request.param("service");
        let backends = self.registry.backend_list(service.as_deref());

        let mut table = Table::new(&["Backend", "IP", "Port"]);
        for backend in backends {
            table.push(vec![
                backend.name,
                backend.ip.to_string(),
                backend.port.to_string(),
            ]);
        }
        table.render(format)
    }

    fn qengine(
        &self,
        request: &ClientRequest,
        format: OutputFormat,
    ) -> Result<String, AdminError> {
        match request.param("type").as_deref() {
            None | Some("name") => {}
            Some(other) => {
                return Err(AdminError::BadRequest(format!(
                    "Invalid input type {other}"
                )))
            }
        }

        let backends = self.registry.backend_list(None);
        let bodies = fanout::collect(&backends, "qengine", "json");

        let mut listings = Vec::new();
        for body in bodies {
            let files = qengine::parse_listing(&body.body)
                .map_err(AdminError::BadRequest)?;
            listings.push((body.backend, files));
        }
        let contents = qengine::cluster_contents(listings);

        let params: Vec<String> = request
            .param("param")
            .map(|input| {
                input
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if params.is_empty() {
            let mut table = Table::new(&["Producer", "Path", "OriginTime", "MinTime", "MaxTime"]);
            for (producer, files) in &contents {
                let Some(latest) = files.last() else {
                    warn!(producer = %producer, "producer has no content");
                    continue;
                };
                table.push(vec![
                    producer.clone(),
                    latest.path.clone(),
                    latest.origin_time.clone(),
                    latest.min_time.clone(),
                    latest.max_time.clone(),
                ]);
            }
            return Ok(table.render(format));
        }

        // Only producers whose newest file carries every requested
        // parameter qualify.
        let mut matching = Vec::new();
        for files in contents.values() {
            let Some(latest) = files.last() else {
                continue;
            };
            if params.iter().all(|param| latest.has_parameter(param)) {
                matching.push(latest.clone());
            }
        }
        matching.sort_by(|a, b| {
            (&b.origin_time, &b.path).cmp(&(&a.origin_time, &a.path))
        });

        let mut table = Table::new(&["Producer", "Path", "OriginTime"]);
        for file in matching {
            table.push(vec![file.producer, file.path, file.origin_time]);
        }
        Ok(table.render(format))
    }

    fn grid_generations(&self, verb: &str, format: OutputFormat) -> String {
        let backends = self.registry.backend_list(None);
        let bodies = fanout::collect(&backends, verb, "text");
        let listings = bodies
            .iter()
            .map(|body| grid::parse_lines(&body.body))
            .collect();

        let mut table = Table::new(&["Producer", "Geometry", "Generation"]);
        for generation in grid::cluster_generations(listings) {
            table.push(vec![
                generation.producer,
                generation.geometry,
                generation.generation,
            ]);
        }
        table.render(format)
    }

    fn active_requests(&self, format: OutputFormat) -> String {
        let mut table = Table::new(&["Id", "Time", "Duration", "ClientIP", "RequestString"]);
        for info in self.core.active_requests.snapshot() {
            table.push(vec![
                info.id.to_string(),
                httpdate::fmt_http_date(info.started_at),
                format!("{:.3}", info.started.elapsed().as_secs_f64()),
                info.client_ip.to_string(),
                info.uri.clone(),
            ]);
        }
        table.render(format)
    }

    fn active_backends(&self, format: OutputFormat) -> String {
        let mut table = Table::new(&["Backend", "Port", "Requests"]);
        for ((host, port), count) in self.core.counter.snapshot() {
            table.push(vec![host, port.to_string(), count.to_string()]);
        }
        table.render(format)
    }

    fn cache_stats(&self, format: OutputFormat) -> String {
        let uptime = self.core.uptime_secs();
        let mut table = Table::new(&[
            "Cache",
            "MaxSize",
            "Size",
            "Hits",
            "Misses",
            "Inserts",
            "HitRate",
            "HitsPerSec",
            "MissesPerSec",
            "InsertsPerSec",
        ]);
        for (name, encoding) in [
            ("compressed", ContentEncoding::Gzip),
            ("uncompressed", ContentEncoding::Identity),
        ] {
            let stats = self.core.cache(encoding).stats();
            let lookups = stats.hits + stats.misses;
            let hit_rate = if lookups == 0 {
                0.0
            } else {
                stats.hits as f64 / lookups as f64
            };
            table.push(vec![
                name.to_string(),
                stats.maxsize.to_string(),
                stats.size.to_string(),
                stats.hits.to_string(),
                stats.misses.to_string(),
                stats.inserts.to_string(),
                format!("{hit_rate:.3}"),
                format!("{:.3}", stats.hits as f64 / uptime),
                format!("{:.3}", stats.misses as f64 / uptime),
                format!("{:.3}", stats.inserts as f64 / uptime),
            ]);
        }
        table.render(format)
    }

    fn pause(&self, request: &ClientRequest) -> Result<String, AdminError> {
        self.check_auth(request)?;
        let deadline = parse_deadline(request)?;
        self.core.pause.pause(deadline);
        match deadline {
            Some(_) => {
                info!("gateway paused with deadline");
                Ok("Paused until deadline\n".to_string())
            }
            None => {
                info!("gateway paused");
                Ok("Paused\n".to_string())
            }
        }
    }

    fn resume(&self, request: &ClientRequest) -> Result<String, AdminError> {
        self.check_auth(request)?;
        let repause = parse_deadline(request)?;
        self.core.pause.resume(repause);
        match repause {
            Some(_) => {
                info!("gateway resumed with future repause");
                Ok("Continuing, repause armed\n".to_string())
            }
            None => {
                info!("gateway resumed");
                Ok("Continuing\n".to_string())
            }
        }
    }

    fn list(&self, format: OutputFormat) -> String {
        let mut table = Table::new(&["Verb"]);
        for verb in VERBS {
            table.push(vec![verb.to_string()]);
        }
        table.render(format)
    }

    fn check_auth(&self, request: &ClientRequest) -> Result<(), AdminError> {
        let Some((user, password)) = self.credentials.as_ref() else {
            // Without configured credentials the privileged verbs stay
            // locked.
            return Err(AdminError::Unauthorized);
        };
        if auth::authorized(request, user, password) {
            Ok(())
        } else {
            Err(AdminError::Unauthorized)
        }
    }
}

fn parse_deadline(request: &ClientRequest) -> Result<Option<SystemTime>, AdminError> {
    if let Some(duration) = request.param("duration") {
        let seconds: u64 = duration
            .parse()
            .map_err(|_| AdminError::BadRequest(format!("invalid duration '{duration}'")))?;
        return Ok(Some(SystemTime::now() + Duration::from_secs(seconds)));
    }
    if let Some(time) = request.param("time") {
        let epoch: u64 = time
            .parse()
            .map_err(|_| AdminError::BadRequest(format!("invalid time '{time}'")))?;
        return Ok(Some(UNIX_EPOCH + Duration::from_secs(epoch)));
    }
    Ok(None)
}

impl RequestHandler for AdminPlane {
    fn handle(&self, request: &ClientRequest) -> GatewayReply {
        let format = match OutputFormat::parse(request.param("format").as_deref()) {
            Ok(format) => format,
            Err(message) => {
                return error_reply(StatusCode::BAD_REQUEST, &message, Some(&message))
            }
        };

        match self.dispatch(request, format) {
            Ok(body) => {
                let body = match format {
                    OutputFormat::Debug => format!(
                        "<html><head><title>Gateway Admin</title></head><body>{body}</body></html>"
                    ),
                    OutputFormat::Json => body,
                };
                let now = SystemTime::now();
                GatewayReply {
                    status: StatusCode::OK,
                    headers: vec![
                        ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
                        ("Content-Type".to_string(), format.mime_type().to_string()),
                        (
                            "Cache-Control".to_string(),
                            format!("public, max-age={RESPONSE_EXPIRES_SECS}"),
                        ),
                        (
                            "Expires".to_string(),
                            httpdate::fmt_http_date(
                                now + Duration::from_secs(RESPONSE_EXPIRES_SECS),
                            ),
                        ),
                        ("Last-Modified".to_string(), httpdate::fmt_http_date(now)),
                    ],
                    body: ReplyBody::Full(Bytes::from(body)),
                }
            }
            Err(AdminError::Unauthorized) => {
                let mut reply = error_reply(
                    StatusCode::UNAUTHORIZED,
                    "Authentication required",
                    Some("Authentication required"),
                );
                reply.headers.push((
                    "WWW-Authenticate".to_string(),
                    format!("Basic realm=\"{}\"", self.realm),
                ));
                reply
            }
            Err(AdminError::BadRequest(message)) => {
                error_reply(StatusCode::BAD_REQUEST, &message, Some(&message))
            }
            Err(AdminError::NotImplemented(message)) => {
                error_reply(StatusCode::NOT_IMPLEMENTED, &message, None)
            }
        }
    }
}

fn error_reply(status: StatusCode, body: &str, error_header: Option<&str>) -> GatewayReply {
    let mut reply = GatewayReply::text(status, format!("{body}\n"));
    reply
        .headers
        .push(("Access-Control-Allow-Origin".to_string(), "*".to_string()));
    if let Some(message) = error_header {
        reply
            .headers
            .push(("X-Frontend-Error".to_string(), flatten_error(message)));
    }
    reply
}

/// One line, bounded length; carried in `X-Frontend-Error`.
fn flatten_error(message: &str) -> String {
    message
        .replace(['\r', '\n'], " ")
        .chars()
        .take(MAX_ERROR_HEADER_CHARS)
        .collect()
}

/// The `/` handler external health checks probe.
pub struct HealthEndpoint {
    pause: Arc<PauseState>,
}

impl HealthEndpoint {
    pub fn new(pause: Arc<PauseState>) -> Self {
        Self { pause }
    }
}

impl RequestHandler for HealthEndpoint {
    fn handle(&self, _request: &ClientRequest) -> GatewayReply {
        GatewayReply::text(StatusCode::OK, self.pause.health_body())
    }
}
