//! Gateway manager
//!
//! Thin coordinator over registry, supervisor, runtime and store. All
//! mutating operations for one backend name serialize on a per-name async
//! lock; operations on different names run independently. The registry is
//! never locked across an await, so the router keeps resolving while a
//! backend is being rebuilt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::{BackendDescriptor, BackendRegistry, BackendSnapshot, BackendStatus};
use crate::runtime::{BackendDeclaration, BackendRuntime};
use crate::stats::GatewayStats;
use crate::store::ConfigStore;
use crate::supervisor::Supervisor;
use crate::{Error, Result};

/// Longest accepted backend name
const MAX_NAME_LEN: usize = 64;

/// Validate a backend name: 1-64 characters, letters, digits, `-` and `_`
///
/// # Errors
///
/// Returns an error when the name is empty, too long, or contains other
/// characters.
pub fn validate_backend_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Declaration(format!(
            "Invalid backend name '{name}' (1-{MAX_NAME_LEN} characters: letters, digits, '-', '_')"
        )))
    }
}

/// Orchestrates the lifecycle of every managed backend
pub struct GatewayManager {
    registry: Arc<BackendRegistry>,
    supervisor: Supervisor,
    runtime: Arc<dyn BackendRuntime>,
    store: Arc<dyn ConfigStore>,
    stats: Arc<GatewayStats>,
    /// Per-name operation locks; held across the suspension points of one
    /// add/start/stop/restart/remove
    ops: DashMap<String, Arc<Mutex<()>>>,
    /// Set once the HTTP listener is accepting traffic
    serving: AtomicBool,
}

impl GatewayManager {
    /// Create a manager over shared registry, runtime and store
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        runtime: Arc<dyn BackendRuntime>,
        store: Arc<dyn ConfigStore>,
        stats: Arc<GatewayStats>,
        stop_grace: Duration,
    ) -> Self {
        let supervisor = Supervisor::new(Arc::clone(&registry), Arc::clone(&stats), stop_grace);
        Self {
            registry,
            supervisor,
            runtime,
            store,
            stats,
            ops: DashMap::new(),
            serving: AtomicBool::new(false),
        }
    }

    /// The shared registry
    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// The shared counters
    #[must_use]
    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Whether the gateway is accepting traffic
    #[must_use]
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Flip the serving flag (set right before the accept loop starts)
    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    fn op_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.ops
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    // ========================================================================
    // Boot-time bulk operations
    // ========================================================================

    /// Populate the registry from the store. Called once at construction
    /// time; a store that cannot be read is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    pub fn preload(&self) -> Result<usize> {
        let persisted = self.store.load_all()?;
        let mut loaded = 0;
        for (name, declaration) in persisted {
            if let Err(e) = validate_backend_name(&name) {
                warn!(backend = %name, error = %e, "Skipping persisted backend with invalid name");
                continue;
            }
            self.registry
                .insert(BackendDescriptor::new(name, declaration));
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "Loaded persisted backends");
        }
        Ok(loaded)
    }

    /// Build an instance for every enabled `loaded` backend. Failures land
    /// in `mount_failed` and never abort the boot. Returns the mount count.
    pub async fn mount_all(&self) -> usize {
        let mut mounted = 0;
        for name in self.registry.names() {
            let Some(descriptor) = self.registry.get(&name) else {
                continue;
            };
            if descriptor.status != BackendStatus::Loaded {
                continue;
            }
            if !descriptor.declaration.enabled {
                debug!(backend = %name, "Skipping disabled backend");
                continue;
            }
            if self.mount(&name).await.is_ok() {
                mounted += 1;
            }
        }
        mounted
    }

    /// Start every `mounted` backend concurrently. Per-name failures are
    /// logged and counted; the gateway keeps booting regardless. Returns
    /// (started, failed).
    pub async fn start_all(&self) -> (usize, usize) {
        let names: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|n| self.registry.status(n) == Some(BackendStatus::Mounted))
            .collect();

        let startups = names.iter().map(|name| async move {
            let result = self.start(name).await;
            (name.as_str(), result)
        });
        let results = futures::future::join_all(startups).await;

        let mut started = 0;
        let mut failed = 0;
        for (name, result) in results {
            match result {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(backend = %name, error = %e, "Startup failed for backend");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            warn!(started, failed, "Backend startup finished with failures");
        } else if started > 0 {
            info!(started, "All backends started");
        }
        (started, failed)
    }

    /// Stop every running backend under one overall deadline
    pub async fn shutdown_all(&self, deadline: Duration) {
        self.set_serving(false);
        self.supervisor.shutdown_all(deadline).await;
    }

    // ========================================================================
    // Per-name operations
    // ========================================================================

    /// Register a new backend. While the gateway is serving this also
    /// builds, persists and starts it; before that, the declaration is
    /// persisted and left `loaded` for the boot sequence.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid name or declaration, a duplicate
    /// name, or a store failure. Mount and start failures are *not* errors
    /// here: the backend stays registered and the returned snapshot carries
    /// its status.
    pub async fn add(
        &self,
        name: &str,
        declaration: BackendDeclaration,
    ) -> Result<BackendSnapshot> {
        validate_backend_name(name)?;
        declaration.validate()?;

        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        if self.registry.contains(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.registry
            .insert(BackendDescriptor::new(name, declaration.clone()));

        let serve_now = self.is_serving() && declaration.enabled;
        if serve_now {
            // Build failures land in mount_failed and are reported via the
            // snapshot, not as an add error
            let _ = self.mount(name).await;
        }

        if let Err(e) = self.store.save(name, &declaration) {
            // Nothing is supervised yet; unwind the registration so memory
            // and disk stay consistent
            self.registry.remove(name);
            return Err(e);
        }
        info!(backend = %name, kind = declaration.kind(), "Backend added");

        if serve_now && self.registry.status(name) == Some(BackendStatus::Mounted) {
            if let Err(e) = self.start_locked(name).await {
                warn!(backend = %name, error = %e, "Newly added backend failed to start");
            }
        }

        self.snapshot_of(name)
    }

    /// Start a backend. No-op success when already running.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown name, a disabled or `mount_failed`
    /// backend, a build failure, or a lifecycle entry failure.
    pub async fn start(&self, name: &str) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.start_locked(name).await
    }

    /// Stop a backend. No-op success when it is not running.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown name.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    /// Restart a backend, optionally swapping in a new declaration.
    ///
    /// The old instance is torn down before the new one is built; when the
    /// rebuild fails the backend lands in `failed` and the old instance is
    /// not resurrected. The persisted declaration is only replaced after a
    /// successful build.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid replacement declaration (before any
    /// mutation), an unknown name, a build failure, a store failure, or a
    /// lifecycle entry failure.
    pub async fn restart(
        &self,
        name: &str,
        new_declaration: Option<BackendDeclaration>,
    ) -> Result<BackendSnapshot> {
        if let Some(declaration) = &new_declaration {
            declaration.validate()?;
        }

        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let Some(descriptor) = self.registry.get(name) else {
            return Err(Error::NotFound(name.to_string()));
        };
        info!(backend = %name, "Restarting backend");

        if descriptor.status.is_running() {
            self.registry
                .update(name, |d| d.set_status(BackendStatus::Stopping));
            let had_task = self.supervisor.stop(name).await?;
            if !had_task {
                self.settle_stopping(name);
            }
        }

        let replace = new_declaration.is_some();
        let declaration = new_declaration.unwrap_or(descriptor.declaration);

        if !declaration.enabled {
            // A disabled declaration is persisted but not brought back up
            if replace {
                self.store.replace(name, &declaration)?;
            }
            self.registry.update(name, |d| {
                d.declaration = declaration.clone();
                d.instance = None;
                d.set_status(BackendStatus::Stopped);
            });
            info!(backend = %name, "Backend disabled by restart");
            return self.snapshot_of(name);
        }

        self.registry
            .update(name, |d| d.set_status(BackendStatus::Restarting));

        match self.runtime.build(name, &declaration).await {
            Ok(instance) => {
                if replace {
                    self.store.replace(name, &declaration)?;
                }
                self.registry.update(name, |d| {
                    d.declaration = declaration.clone();
                    d.instance = Some(Arc::new(instance));
                    d.set_status(BackendStatus::Mounted);
                });
                self.start_locked(name).await?;
                self.snapshot_of(name)
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "Rebuild failed during restart");
                self.registry.update(name, |d| {
                    d.instance = None;
                    d.set_failed(
                        BackendStatus::Failed,
                        format!("restart failed after stop; previous instance discarded: {e}"),
                    );
                });
                Err(e)
            }
        }
    }

    /// Stop and delete a backend, including its persisted declaration.
    /// Removing a nonexistent name succeeds and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be written.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        if !self.registry.contains(name) {
            // Clear any stale persisted entry so the outcome is the same
            // either way
            self.store.remove(name)?;
            self.ops.remove(name);
            return Ok(false);
        }

        self.stop_locked(name).await?;
        self.registry.remove(name);
        self.store.remove(name)?;
        // The name is gone; its operation lock goes with it. A waiter that
        // already cloned the Arc still serializes behind this guard.
        self.ops.remove(name);
        info!(backend = %name, "Backend removed");
        Ok(true)
    }

    // ========================================================================
    // Internals (callers hold the per-name op lock)
    // ========================================================================

    async fn start_locked(&self, name: &str) -> Result<()> {
        let Some(descriptor) = self.registry.get(name) else {
            return Err(Error::NotFound(name.to_string()));
        };
        match descriptor.status {
            BackendStatus::Running => return Ok(()),
            BackendStatus::MountFailed => {
                return Err(Error::Build(format!(
                    "Backend '{name}' failed to mount; restart it to rebuild"
                )));
            }
            _ => {}
        }
        if !descriptor.declaration.enabled {
            return Err(Error::Declaration(format!("Backend '{name}' is disabled")));
        }

        // Stopped and failed backends have no instance left; rebuild one
        let instance = match descriptor.instance {
            Some(instance) if instance.has_lifecycle() => instance,
            _ => {
                self.mount(name).await?;
                self.registry
                    .get(name)
                    .and_then(|d| d.instance)
                    .ok_or_else(|| {
                        Error::Internal(format!("Backend '{name}' has no instance after mount"))
                    })?
            }
        };

        let lifecycle = instance.take_lifecycle().ok_or_else(|| {
            Error::Internal(format!("Backend '{name}' instance was already driven"))
        })?;
        self.supervisor.start(name, lifecycle).await
    }

    async fn stop_locked(&self, name: &str) -> Result<()> {
        let Some(status) = self.registry.status(name) else {
            return Err(Error::NotFound(name.to_string()));
        };
        if !status.is_running() {
            debug!(backend = %name, status = %status, "Stop requested for non-running backend");
            return Ok(());
        }

        self.registry
            .update(name, |d| d.set_status(BackendStatus::Stopping));
        let had_task = self.supervisor.stop(name).await?;
        if !had_task {
            self.settle_stopping(name);
        }
        Ok(())
    }

    async fn mount(&self, name: &str) -> Result<()> {
        let Some(descriptor) = self.registry.get(name) else {
            return Err(Error::NotFound(name.to_string()));
        };
        match self.runtime.build(name, &descriptor.declaration).await {
            Ok(instance) => {
                self.registry.update(name, |d| {
                    d.instance = Some(Arc::new(instance));
                    d.set_status(BackendStatus::Mounted);
                });
                debug!(backend = %name, "Backend mounted");
                Ok(())
            }
            Err(e) => {
                warn!(backend = %name, error = %e, "Backend mount failed");
                self.registry.update(name, |d| {
                    d.instance = None;
                    d.set_failed(BackendStatus::MountFailed, e.to_string());
                });
                Err(e)
            }
        }
    }

    /// The supervised task normally flips `stopping` to a terminal status;
    /// when it was already gone, settle the descriptor here.
    fn settle_stopping(&self, name: &str) {
        self.registry.update(name, |d| {
            if d.status == BackendStatus::Stopping {
                d.set_status(BackendStatus::Stopped);
                d.instance = None;
            }
        });
    }

    fn snapshot_of(&self, name: &str) -> Result<BackendSnapshot> {
        self.registry
            .get(name)
            .map(|d| d.snapshot())
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}
