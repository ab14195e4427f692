//! Backend registry: the single source of truth for what exists and its status
//!
//! One descriptor per backend name, held in a concurrent map. Mutations go
//! through closure-scoped per-entry updates (no lock is ever held across an
//! await), and the router's [`BackendRegistry::resolve`] is a single atomic
//! read, which is what makes add/replace/remove observable without touching
//! the route table.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::runtime::{BackendDeclaration, BackendInstance};

/// Backend lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Registered, instance not yet built
    Loaded,
    /// Instance built, lifecycle not yet entered
    Mounted,
    /// Lifecycle entered; requests are forwarded
    Running,
    /// Teardown in progress
    Stopping,
    /// Lifecycle exited (or force-marked after the grace period)
    Stopped,
    /// Between a restart's teardown and its start
    Restarting,
    /// Instance build failed at mount time
    MountFailed,
    /// Lifecycle enter/exit or rebuild failed
    Failed,
}

impl BackendStatus {
    /// Whether requests may be forwarded
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether this is an error state (keeps `last_error` intact)
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, Self::Failed | Self::MountFailed)
    }

    /// Snake-case name, as serialized
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Mounted => "mounted",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Restarting => "restarting",
            Self::MountFailed => "mount_failed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry's record of one backend
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    /// Unique name; routing key and persistence key
    pub name: String,
    /// Declaration the instance is (re)built from
    pub declaration: BackendDeclaration,
    /// Current lifecycle status
    pub status: BackendStatus,
    /// Detail of the last failure; cleared on transition to a non-error state
    pub last_error: Option<String>,
    /// Currently built instance; `None` when there is nothing to route to
    pub instance: Option<Arc<BackendInstance>>,
}

impl BackendDescriptor {
    /// Fresh descriptor in `loaded` state
    #[must_use]
    pub fn new(name: impl Into<String>, declaration: BackendDeclaration) -> Self {
        Self {
            name: name.into(),
            declaration,
            status: BackendStatus::Loaded,
            last_error: None,
            instance: None,
        }
    }

    /// Whether the auth gate should protect this backend's endpoints
    #[must_use]
    pub fn require_auth(&self) -> bool {
        self.declaration.require_auth
    }

    /// Transition to a non-error status, clearing any stale failure detail
    pub fn set_status(&mut self, status: BackendStatus) {
        self.status = status;
        if !status.is_error() {
            self.last_error = None;
        }
    }

    /// Transition to an error status with detail
    pub fn set_failed(&mut self, status: BackendStatus, error: impl Into<String>) {
        debug_assert!(status.is_error());
        self.status = status;
        self.last_error = Some(error.into());
    }

    /// Monitoring snapshot of this descriptor
    #[must_use]
    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            name: self.name.clone(),
            status: self.status,
            kind: self.declaration.kind().to_string(),
            error: self.last_error.clone(),
            proto_endpoint: format!("/proto/{}", self.name),
            stream_endpoint: format!("/stream/{}", self.name),
        }
    }
}

/// Serializable status snapshot of one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSnapshot {
    /// Backend name
    pub name: String,
    /// Current status
    pub status: BackendStatus,
    /// Transport kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Failure detail, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Gateway-side protocol path
    pub proto_endpoint: String,
    /// Gateway-side stream path
    pub stream_endpoint: String,
}

/// Outcome of resolving a backend name for one request
pub enum RouteDecision {
    /// No descriptor for this name
    Unknown,
    /// Descriptor exists but is not running
    NotRunning(BackendStatus),
    /// Live instance to forward to
    Live(Arc<BackendInstance>),
}

/// Concurrent name to descriptor map
pub struct BackendRegistry {
    backends: DashMap<String, BackendDescriptor>,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// Insert or replace the descriptor under its name
    pub fn insert(&self, descriptor: BackendDescriptor) {
        self.backends.insert(descriptor.name.clone(), descriptor);
    }

    /// Clone out the descriptor for a name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<BackendDescriptor> {
        self.backends.get(name).map(|d| d.clone())
    }

    /// Current status for a name
    #[must_use]
    pub fn status(&self, name: &str) -> Option<BackendStatus> {
        self.backends.get(name).map(|d| d.status)
    }

    /// Whether a descriptor exists for this name
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Remove and return the descriptor for a name
    pub fn remove(&self, name: &str) -> Option<BackendDescriptor> {
        self.backends.remove(name).map(|(_, d)| d)
    }

    /// Atomically mutate one descriptor. The closure runs under the entry
    /// lock and must not block. Returns false when the name is unknown.
    pub fn update<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut BackendDescriptor),
    {
        match self.backends.get_mut(name) {
            Some(mut entry) => {
                f(&mut entry);
                true
            }
            None => false,
        }
    }

    /// Resolve a name for one inbound request (single atomic read)
    #[must_use]
    pub fn resolve(&self, name: &str) -> RouteDecision {
        let Some(entry) = self.backends.get(name) else {
            return RouteDecision::Unknown;
        };
        if entry.status.is_running() {
            if let Some(instance) = &entry.instance {
                return RouteDecision::Live(Arc::clone(instance));
            }
        }
        RouteDecision::NotRunning(entry.status)
    }

    /// All registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Monitoring snapshot of every backend, ordered by name
    #[must_use]
    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut snapshots: Vec<BackendSnapshot> =
            self.backends.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Number of registered backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
