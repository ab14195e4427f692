//! Lifecycle supervisor
//!
//! One spawned task per running backend. The task enters the instance's
//! lifecycle handle, reports readiness back to the caller, flips the
//! registry to `running`, then parks until cancelled. Teardown runs under a
//! bounded grace period; a backend that ignores it is force-marked stopped
//! and the forced stop is logged and counted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{BackendRegistry, BackendStatus};
use crate::runtime::Lifecycle;
use crate::stats::GatewayStats;
use crate::{Error, Result};

/// Extra headroom over the teardown grace before a stuck task is aborted
const STOP_GRACE_SLACK: Duration = Duration::from_secs(1);

struct SupervisedTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the supervised task for every running backend
pub struct Supervisor {
    registry: Arc<BackendRegistry>,
    stats: Arc<GatewayStats>,
    tasks: DashMap<String, SupervisedTask>,
    stop_grace: Duration,
}

impl Supervisor {
    /// Create a supervisor over the shared registry
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        stats: Arc<GatewayStats>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            tasks: DashMap::new(),
            stop_grace,
        }
    }

    /// Number of currently supervised backends
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn the supervised task for a backend and wait for startup.
    ///
    /// Returns once the lifecycle has been entered (registry flipped to
    /// `running`) or entry failed (registry flipped to `failed`).
    ///
    /// # Errors
    ///
    /// Returns an error when lifecycle entry fails or the task dies before
    /// reporting readiness.
    pub async fn start(&self, name: &str, lifecycle: Box<dyn Lifecycle>) -> Result<()> {
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(Self::run(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            name.to_string(),
            lifecycle,
            cancel.clone(),
            ready_tx,
            self.stop_grace,
        ));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.tasks
                    .insert(name.to_string(), SupervisedTask { cancel, handle });
                Ok(())
            }
            Ok(Err(message)) => {
                // The task has already recorded the failure and is finishing
                let _ = handle.await;
                Err(Error::Lifecycle(message))
            }
            Err(_) => {
                // Task died (panicked) before signalling readiness
                self.registry.update(name, |d| {
                    d.set_failed(
                        BackendStatus::Failed,
                        "lifecycle task terminated before reporting readiness",
                    );
                    d.instance = None;
                });
                self.stats.record_failed();
                Err(Error::Lifecycle(format!(
                    "Backend '{name}' lifecycle task died during startup"
                )))
            }
        }
    }

    /// Cancel the supervised task for a name and wait for teardown.
    ///
    /// Returns `Ok(false)` when no task was supervised under this name.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps room for stores that must
    /// release external resources on stop.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let Some((_, task)) = self.tasks.remove(name) else {
            return Ok(false);
        };

        task.cancel.cancel();
        let mut handle = task.handle;
        let deadline = self.stop_grace + STOP_GRACE_SLACK;

        match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                warn!(backend = %name, error = %e, "Supervised task panicked during teardown");
                self.registry.update(name, |d| {
                    d.set_failed(
                        BackendStatus::Failed,
                        format!("supervised task panicked during teardown: {e}"),
                    );
                    d.instance = None;
                });
                self.stats.record_failed();
                Ok(true)
            }
            Err(_) => {
                // The task's own grace timeout should have fired first; a
                // task still alive here is stuck and gets aborted.
                warn!(backend = %name, "Supervised task ignored teardown deadline; aborting");
                handle.abort();
                self.registry.update(name, |d| {
                    d.set_status(BackendStatus::Stopped);
                    d.instance = None;
                });
                self.stats.record_forced_stop();
                Ok(true)
            }
        }
    }

    /// Cancel every supervised task and wait for all of them under one
    /// overall deadline. Stragglers are aborted and counted as forced stops.
    pub async fn shutdown_all(&self, deadline: Duration) {
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        if names.is_empty() {
            return;
        }
        info!(count = names.len(), "Stopping all backends");

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, task)) = self.tasks.remove(&name) {
                task.cancel.cancel();
                handles.push((name, task.handle));
            }
        }

        let drain = futures::future::join_all(handles.iter_mut().map(|(_, h)| h));
        match tokio::time::timeout(deadline, drain).await {
            Ok(results) => {
                for ((name, _), result) in handles.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(backend = %name, error = %e, "Supervised task panicked during shutdown");
                    }
                }
                info!("All backends stopped");
            }
            Err(_) => {
                for (name, handle) in &handles {
                    if handle.is_finished() {
                        continue;
                    }
                    warn!(backend = %name, "Shutdown deadline exceeded; aborting backend task");
                    handle.abort();
                    self.registry.update(name, |d| {
                        d.set_status(BackendStatus::Stopped);
                        d.instance = None;
                    });
                    self.stats.record_forced_stop();
                }
            }
        }
    }

    async fn run(
        registry: Arc<BackendRegistry>,
        stats: Arc<GatewayStats>,
        name: String,
        mut lifecycle: Box<dyn Lifecycle>,
        cancel: CancellationToken,
        ready: oneshot::Sender<std::result::Result<(), String>>,
        stop_grace: Duration,
    ) {
        let entered = tokio::select! {
            () = cancel.cancelled() => {
                debug!(backend = %name, "Cancelled before lifecycle entry");
                let _ = ready.send(Err("cancelled before startup".to_string()));
                return;
            }
            result = lifecycle.enter() => result,
        };

        if let Err(e) = entered {
            warn!(backend = %name, error = %e, "Backend failed to start");
            registry.update(&name, |d| {
                d.set_failed(BackendStatus::Failed, e.to_string());
                d.instance = None;
            });
            stats.record_failed();
            let _ = ready.send(Err(e.to_string()));
            return;
        }

        registry.update(&name, |d| d.set_status(BackendStatus::Running));
        stats.record_started();
        info!(backend = %name, "Backend running");
        let _ = ready.send(Ok(()));

        cancel.cancelled().await;
        debug!(backend = %name, "Tearing down backend");

        match tokio::time::timeout(stop_grace, lifecycle.exit()).await {
            Ok(Ok(())) => {
                registry.update(&name, |d| {
                    d.set_status(BackendStatus::Stopped);
                    d.instance = None;
                });
                stats.record_stopped();
                info!(backend = %name, "Backend stopped");
            }
            Ok(Err(e)) => {
                warn!(backend = %name, error = %e, "Backend teardown failed");
                registry.update(&name, |d| {
                    d.set_failed(BackendStatus::Failed, e.to_string());
                    d.instance = None;
                });
                stats.record_failed();
            }
            Err(_) => {
                warn!(
                    backend = %name,
                    grace_secs = stop_grace.as_secs(),
                    "Backend ignored teardown grace period; forcing stop"
                );
                registry.update(&name, |d| {
                    d.set_status(BackendStatus::Stopped);
                    d.instance = None;
                });
                stats.record_forced_stop();
            }
        }
    }
}
