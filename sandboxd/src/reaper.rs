//! Deferred release of sandbox resources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error};

use crate::sandbox::SandboxHandle;

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    released: AtomicU64,
    failed: AtomicU64,
}

fn incr(a: &AtomicU64) {
    a.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaperStats {
    pub scheduled: u64,
    pub released: u64,
    pub failed: u64,
}

impl ReaperStats {
    /// Handles scheduled but not yet released or failed.
    pub fn pending(&self) -> u64 {
        self.scheduled
            .saturating_sub(self.released)
            .saturating_sub(self.failed)
    }
}

/// Releases sandbox handles a grace period after their response was produced.
///
/// Scheduling is fire-and-forget; a failed release is logged and counted, and
/// never reaches the client whose request produced the handle.
#[derive(Debug, Clone)]
pub struct Reaper {
    grace: Duration,
    counters: Arc<Counters>,
}

impl Reaper {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, handle: SandboxHandle) {
        incr(&self.counters.scheduled);
        let grace = self.grace;
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let id = handle.id();
            match handle.release().await {
                Ok(()) => {
                    incr(&counters.released);
                    debug!(execution_id = %id, "sandbox released");
                }
                Err(e) => {
                    incr(&counters.failed);
                    error!(execution_id = %id, error = %e, "failed to release sandbox");
                }
            }
        });
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            scheduled: self.counters.scheduled.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
