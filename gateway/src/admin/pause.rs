//! Gateway pause state.
//!
//! While paused, the health endpoint answers with a body that lacks
//! the product banner, so external health checks probing for the
//! banner word take the node out of rotation. A deadline can be
//! attached in either direction: a paused gateway may auto-resume, a
//! running one may auto-pause (the `continue` verb's "future repause"
//! form). Deadlines are checked lazily on query and self-clear.

use std::sync::RwLock;
use std::time::SystemTime;

pub const HEALTH_BANNER: &str = "Cluster Gateway Server\n";
pub const HEALTH_PAUSED: &str = "Gateway paused\n";

#[derive(Debug, Clone, Copy)]
struct PauseInner {
    paused: bool,
    /// When set: the moment the current state flips to its opposite.
    deadline: Option<SystemTime>,
}

pub struct PauseState {
    inner: RwLock<PauseInner>,
}

impl PauseState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PauseInner {
                paused: false,
                deadline: None,
            }),
        }
    }

    pub fn pause(&self, until: Option<SystemTime>) {
        let mut inner = self.inner.write().expect("pause lock");
        inner.paused = true;
        inner.deadline = until;
    }

    /// Resumes. With `repause_at`, the gateway pauses itself again
    /// once that moment passes.
    pub fn resume(&self, repause_at: Option<SystemTime>) {
        let mut inner = self.inner.write().expect("pause lock");
        inner.paused = false;
        inner.deadline = repause_at;
    }

    pub fn is_paused(&self) -> bool {
        {
            let inner = self.inner.read().expect("pause lock");
            match inner.deadline {
                Some(deadline) if SystemTime::now() >= deadline => {}
                _ => return inner.paused,
            }
        }

        // Expired deadline: flip state under the write lock,
        // re-checking because another writer may have won the race.
        let mut inner = self.inner.write().expect("pause lock");
        if let Some(deadline) = inner.deadline {
            if SystemTime::now() >= deadline {
                inner.paused = !inner.paused;
                inner.deadline = None;
            }
        }
        inner.paused
    }

    pub fn health_body(&self) -> &'static str {
        if self.is_paused() {
            HEALTH_PAUSED
        } else {
            HEALTH_BANNER
        }
    }
}

impl Default for PauseState {
    fn default() -> Self {
        Self::new()
    }
}
