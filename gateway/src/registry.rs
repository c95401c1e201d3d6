//! Service-discovery contract.
//!
//! The authoritative backend inventory lives in an external discovery
//! engine; the gateway consumes it through [`ServiceRegistry`]. The
//! in-memory [`StaticRegistry`] backs tests and standalone deployments
//! where the inventory is fixed at startup.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::debug;

/// An addressable upstream HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Backend {
    pub fn new(name: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            name: name.into(),
            ip,
            port,
        }
    }
}

/// A routable URI prefix. When `defines_prefix` is set, any path under
/// the prefix is served; otherwise only the exact path matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub prefix: String,
    pub defines_prefix: bool,
}

pub trait ServiceRegistry: Send + Sync {
    /// Resolves the service responsible for `path`, considering the
    /// `/backend-name/...` aliasing form.
    fn service_for(&self, path: &str) -> Option<Service>;

    /// Selects a backend currently offering `service`.
    fn backend_for(&self, service: &Service) -> Option<Backend>;

    fn backend_alive(&self, host: &str, port: u16) -> bool;

    fn remove_backend(&self, host: &str, port: u16);

    /// Throttle bookkeeping: one request was handed to this backend.
    fn signal_backend_connection(&self, host: &str, port: u16);

    /// Backends, optionally restricted to those serving `service`.
    fn backend_list(&self, service: Option<&str>) -> Vec<Backend>;

    /// Human-readable dump for the admin `clusterinfo` verb.
    fn cluster_status(&self) -> String;
}

/// Fixed service table with round-robin backend selection.
pub struct StaticRegistry {
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    services: Vec<ServiceEntry>,
    dead: HashSet<(String, u16)>,
    connections_signalled: u64,
}

struct ServiceEntry {
    service: Service,
    backends: Vec<Backend>,
    cursor: usize,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                services: Vec::new(),
                dead: HashSet::new(),
                connections_signalled: 0,
            }),
        }
    }

    pub fn add_service(&self, prefix: &str, defines_prefix: bool, backends: Vec<Backend>) {
        let mut state = self.inner.lock().expect("registry lock");
        state.services.push(ServiceEntry {
            service: Service {
                prefix: prefix.to_string(),
                defines_prefix,
            },
            backends,
            cursor: 0,
        });
    }

    /// Marks a backend dead without removing it; the router removes it
    /// on the next liveness check.
    pub fn mark_dead(&self, host: &str, port: u16) {
        let mut state = self.inner.lock().expect("registry lock");
        state.dead.insert((host.to_string(), port));
    }

    pub fn contains_backend(&self, host: &str, port: u16) -> bool {
        let state = self.inner.lock().expect("registry lock");
        state
            .services
            .iter()
            .any(|entry| entry.backends.iter().any(|b| b.name == host && b.port == port))
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(service: &Service, path: &str) -> bool {
    if service.defines_prefix {
        path.starts_with(&service.prefix)
    } else {
        path == service.prefix
    }
}

impl ServiceRegistry for StaticRegistry {
    fn service_for(&self, path: &str) -> Option<Service> {
        let state = self.inner.lock().expect("registry lock");

        if let Some(entry) = state.services.iter().find(|e| matches(&e.service, path)) {
            return Some(entry.service.clone());
        }

        // A leading path segment may be a backend-name alias; retry
        // with it stripped.
        let rest = path.strip_prefix('/')?;
        let idx = rest.find('/')?;
        let stripped = &rest[idx..];
        state
            .services
            .iter()
            .find(|e| matches(&e.service, stripped))
            .map(|e| e.service.clone())
    }

    fn backend_for(&self, service: &Service) -> Option<Backend> {
        let mut state = self.inner.lock().expect("registry lock");
        let entry = state
            .services
            .iter_mut()
            .find(|e| e.service == *service)?;
        if entry.backends.is_empty() {
            return None;
        }
        let idx = entry.cursor % entry.backends.len();
        entry.cursor = entry.cursor.wrapping_add(1);
        Some(entry.backends[idx].clone())
    }

    fn backend_alive(&self, host: &str, port: u16) -> bool {
        let state = self.inner.lock().expect("registry lock");
        !state.dead.contains(&(host.to_string(), port))
    }

    fn remove_backend(&self, host: &str, port: u16) {
        let mut state = self.inner.lock().expect("registry lock");
        for entry in &mut state.services {
            entry.backends.retain(|b| !(b.name == host && b.port == port));
            if entry.cursor >= entry.backends.len() {
                entry.cursor = 0;
            }
        }
        debug!(host, port, "backend removed from registry");
    }

    fn signal_backend_connection(&self, _host: &str, _port: u16) {
        let mut state = self.inner.lock().expect("registry lock");
        state.connections_signalled += 1;
    }

    fn backend_list(&self, service: Option<&str>) -> Vec<Backend> {
        let state = self.inner.lock().expect("registry lock");
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in &state.services {
            if let Some(filter) = service {
                if entry.service.prefix != filter {
                    continue;
                }
            }
            for backend in &entry.backends {
                if seen.insert((backend.name.clone(), backend.port)) {
                    out.push(backend.clone());
                }
            }
        }
        out
    }

    fn cluster_status(&self) -> String {
        let state = self.inner.lock().expect("registry lock");
        let mut out = String::new();
        for entry in &state.services {
            let _ = writeln!(
                out,
                "{} (prefix={})",
                entry.service.prefix, entry.service.defines_prefix
            );
            for backend in &entry.backends {
                let dead = state.dead.contains(&(backend.name.clone(), backend.port));
                let _ = writeln!(
                    out,
                    "  {} {}:{}{}",
                    backend.name,
                    backend.ip,
                    backend.port,
                    if dead { " (dead)" } else { "" }
                );
            }
        }
        let _ = writeln!(out, "connections signalled: {}", state.connections_signalled);
        out
    }
}
