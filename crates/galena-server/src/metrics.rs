//! Operation counters surfaced through `GetStatus`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-node operation counters.
#[derive(Debug)]
pub struct ServerMetrics {
    started: Instant,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    cmd_delete: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            cmd_delete: AtomicU64::new(0),
        }
    }

    pub fn count_get(&self) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_set(&self) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_delete(&self) {
        self.cmd_delete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cmd_get(&self) -> u64 {
        self.cmd_get.load(Ordering::Relaxed)
    }

    pub fn cmd_set(&self) -> u64 {
        self.cmd_set.load(Ordering::Relaxed)
    }

    pub fn cmd_delete(&self) -> u64 {
        self.cmd_delete.load(Ordering::Relaxed)
    }

    /// Seconds since the node started.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = ServerMetrics::new();
        metrics.count_get();
        metrics.count_get();
        metrics.count_set();
        assert_eq!(metrics.cmd_get(), 2);
        assert_eq!(metrics.cmd_set(), 1);
        assert_eq!(metrics.cmd_delete(), 0);
    }
}
