//! Gateway counters
//!
//! Tracks routing outcomes, auth failures, and backend lifecycle events.
//! Counters are relaxed atomics; the snapshot is what `/gateway/stats`
//! serves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Gateway-wide counters
pub struct GatewayStats {
    started_at: Instant,
    /// Requests forwarded to a live backend
    proxied_requests: AtomicU64,
    /// Requests for a name with no descriptor
    rejected_unknown: AtomicU64,
    /// Requests for a backend that was registered but not running
    rejected_not_running: AtomicU64,
    /// Forward attempts that failed inside the backend endpoint
    forward_errors: AtomicU64,
    /// Requests rejected by the auth gate
    auth_failures: AtomicU64,
    /// Successful backend starts
    backends_started: AtomicU64,
    /// Graceful backend stops
    backends_stopped: AtomicU64,
    /// Backend lifecycle failures
    backends_failed: AtomicU64,
    /// Teardowns abandoned after the grace period
    forced_stops: AtomicU64,
    /// Per-backend forwarded request counts
    backend_requests: DashMap<String, AtomicU64>,
}

impl GatewayStats {
    /// Create a zeroed counter set
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            proxied_requests: AtomicU64::new(0),
            rejected_unknown: AtomicU64::new(0),
            rejected_not_running: AtomicU64::new(0),
            forward_errors: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            backends_started: AtomicU64::new(0),
            backends_stopped: AtomicU64::new(0),
            backends_failed: AtomicU64::new(0),
            forced_stops: AtomicU64::new(0),
            backend_requests: DashMap::new(),
        }
    }

    /// Record a request forwarded to a live backend
    pub fn record_proxied(&self, backend: &str) {
        self.proxied_requests.fetch_add(1, Ordering::Relaxed);
        self.backend_requests
            .entry(backend.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request for an unknown backend name
    pub fn record_unknown(&self) {
        self.rejected_unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request for a backend that is not running
    pub fn record_not_running(&self) {
        self.rejected_not_running.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a forward failure
    pub fn record_forward_error(&self) {
        self.forward_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an auth rejection
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful backend start
    pub fn record_started(&self) {
        self.backends_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a graceful backend stop
    pub fn record_stopped(&self) {
        self.backends_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a backend lifecycle failure
    pub fn record_failed(&self) {
        self.backends_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a teardown abandoned after the grace period
    pub fn record_forced_stop(&self) {
        self.forced_stops.fetch_add(1, Ordering::Relaxed);
    }

    /// Forwarded request count for one backend
    #[must_use]
    pub fn backend_requests(&self, backend: &str) -> u64 {
        self.backend_requests
            .get(backend)
            .map_or(0, |entry| entry.load(Ordering::Relaxed))
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_backend: Vec<BackendRequestCount> = self
            .backend_requests
            .iter()
            .map(|entry| BackendRequestCount {
                backend: entry.key().clone(),
                requests: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        per_backend.sort_by(|a, b| a.backend.cmp(&b.backend));

        StatsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            proxied_requests: self.proxied_requests.load(Ordering::Relaxed),
            rejected_unknown: self.rejected_unknown.load(Ordering::Relaxed),
            rejected_not_running: self.rejected_not_running.load(Ordering::Relaxed),
            forward_errors: self.forward_errors.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            backends_started: self.backends_started.load(Ordering::Relaxed),
            backends_stopped: self.backends_stopped.load(Ordering::Relaxed),
            backends_failed: self.backends_failed.load(Ordering::Relaxed),
            forced_stops: self.forced_stops.load(Ordering::Relaxed),
            per_backend,
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of the gateway counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Seconds since the counters were created
    pub uptime_secs: u64,
    /// Requests forwarded to a live backend
    pub proxied_requests: u64,
    /// Requests for an unknown backend name
    pub rejected_unknown: u64,
    /// Requests for a registered but non-running backend
    pub rejected_not_running: u64,
    /// Forward attempts that failed
    pub forward_errors: u64,
    /// Requests rejected by the auth gate
    pub auth_failures: u64,
    /// Successful backend starts
    pub backends_started: u64,
    /// Graceful backend stops
    pub backends_stopped: u64,
    /// Backend lifecycle failures
    pub backends_failed: u64,
    /// Teardowns abandoned after the grace period
    pub forced_stops: u64,
    /// Per-backend forwarded request counts, ordered by name
    pub per_backend: Vec<BackendRequestCount>,
}

/// Forwarded request count for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRequestCount {
    /// Backend name
    pub backend: String,
    /// Requests forwarded
    pub requests: u64,
}
