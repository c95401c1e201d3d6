//! In-flight request bookkeeping.
//!
//! `BackendRequestCounter` tracks how many conversations are open per
//! backend; `ActiveRequests` tracks the client requests currently in
//! flight through the gateway. Both hand out drop guards so the
//! decrement side cannot be forgotten, whatever path a request dies
//! on.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracing::debug;

#[derive(Default)]
pub struct BackendRequestCounter {
    counts: Mutex<HashMap<(String, u16), usize>>,
}

impl BackendRequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(self: &Arc<Self>, host: &str, port: u16) -> BackendRequestGuard {
        {
            let mut counts = self.counts.lock().expect("counter lock");
            *counts.entry((host.to_string(), port)).or_insert(0) += 1;
        }
        BackendRequestGuard {
            counter: Arc::clone(self),
            host: host.to_string(),
            port,
        }
    }

    fn stop(&self, host: &str, port: u16) {
        let mut counts = self.counts.lock().expect("counter lock");
        if let Some(count) = counts.get_mut(&(host.to_string(), port)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&(host.to_string(), port));
            }
        }
    }

    /// Drops all counts for a backend that has been retired.
    pub fn remove_backend(&self, host: &str, port: u16) {
        let mut counts = self.counts.lock().expect("counter lock");
        counts.remove(&(host.to_string(), port));
    }

    pub fn in_flight(&self, host: &str, port: u16) -> usize {
        let counts = self.counts.lock().expect("counter lock");
        counts.get(&(host.to_string(), port)).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<((String, u16), usize)> {
        let counts = self.counts.lock().expect("counter lock");
        let mut entries: Vec<_> = counts
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect();
        entries.sort();
        entries
    }
}

/// Decrements the backend count when the conversation ends, however it
/// ends.
pub struct BackendRequestGuard {
    counter: Arc<BackendRequestCounter>,
    host: String,
    port: u16,
}

impl Drop for BackendRequestGuard {
    fn drop(&mut self) {
        self.counter.stop(&self.host, self.port);
    }
}

#[derive(Debug, Clone)]
pub struct ActiveRequestInfo {
    pub id: u64,
    pub started: Instant,
    pub started_at: SystemTime,
    pub client_ip: IpAddr,
    pub uri: String,
}

#[derive(Default)]
pub struct ActiveRequests {
    next_id: AtomicU64,
    inner: Mutex<HashMap<u64, ActiveRequestInfo>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, client_ip: IpAddr, uri: &str) -> ActiveRequestGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ActiveRequestInfo {
            id,
            started: Instant::now(),
            started_at: SystemTime::now(),
            client_ip,
            uri: uri.to_string(),
        };
        {
            let mut inner = self.inner.lock().expect("active requests lock");
            inner.insert(id, info);
        }
        debug!(id, uri, "request registered");
        ActiveRequestGuard {
            requests: Arc::clone(self),
            id,
        }
    }

    pub fn snapshot(&self) -> Vec<ActiveRequestInfo> {
        let inner = self.inner.lock().expect("active requests lock");
        let mut entries: Vec<_> = inner.values().cloned().collect();
        entries.sort_by_key(|info| info.id);
        entries
    }

    fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock().expect("active requests lock");
        inner.remove(&id);
    }
}

pub struct ActiveRequestGuard {
    requests: Arc<ActiveRequests>,
    id: u64,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.requests.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn counter_pairs_start_and_stop() {
        let counter = Arc::new(BackendRequestCounter::new());

        let guard_a = counter.start("alpha", 8080);
        let guard_b = counter.start("alpha", 8080);
        assert_eq!(counter.in_flight("alpha", 8080), 2);

        drop(guard_a);
        assert_eq!(counter.in_flight("alpha", 8080), 1);
        drop(guard_b);
        assert_eq!(counter.in_flight("alpha", 8080), 0);
        assert!(counter.snapshot().is_empty());
    }

    #[test]
    fn remove_backend_purges_counts() {
        let counter = Arc::new(BackendRequestCounter::new());
        let guard = counter.start("alpha", 8080);
        counter.remove_backend("alpha", 8080);
        assert_eq!(counter.in_flight("alpha", 8080), 0);

        // Late guard drop must not underflow or resurrect the entry.
        drop(guard);
        assert_eq!(counter.in_flight("alpha", 8080), 0);
    }

    #[test]
    fn active_requests_track_registration_window() {
        let requests = Arc::new(ActiveRequests::new());
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let guard = requests.register(ip, "/timeseries?q=1");
        let snapshot = requests.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].uri, "/timeseries?q=1");
        assert_eq!(snapshot[0].client_ip, ip);

        drop(guard);
        assert!(requests.snapshot().is_empty());
    }
}
