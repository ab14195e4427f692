//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::AuthState;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::manager::GatewayManager;
use crate::registry::BackendRegistry;
use crate::runtime::StandardRuntime;
use crate::stats::GatewayStats;
use crate::store::{ConfigStore, JsonFileStore};
use crate::{Error, Result};

/// The assembled gateway: config store, manager and HTTP surface
pub struct Gateway {
    config: Config,
    manager: Arc<GatewayManager>,
    auth: Arc<AuthState>,
    store: Arc<JsonFileStore>,
    first_run: bool,
}

impl Gateway {
    /// Open the config store, build the manager and preload persisted
    /// backends.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or read, or when the
    /// outbound HTTP client cannot be built. Both are fatal at startup.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(JsonFileStore::open(config.store.resolved_path())?);
        let first_run = if config.auth.enabled {
            store.ensure_default_keys()?
        } else {
            false
        };

        let registry = Arc::new(BackendRegistry::new());
        let stats = Arc::new(GatewayStats::new());
        let runtime = Arc::new(StandardRuntime::new(&config.runtime)?);
        let manager = Arc::new(GatewayManager::new(
            Arc::clone(&registry),
            runtime,
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::clone(&stats),
            config.supervisor.stop_grace,
        ));

        let preloaded = manager.preload()?;
        info!(
            backends = preloaded,
            store = %store.path().display(),
            "Loaded config store"
        );

        let auth = Arc::new(AuthState::new(
            &config.auth,
            Arc::clone(&store),
            Arc::clone(&registry),
            stats,
        ));

        Ok(Self {
            config,
            manager,
            auth,
            store,
            first_run,
        })
    }

    /// Run the gateway until SIGINT/SIGTERM, then drain the backends
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let state = Arc::new(AppState {
            manager: Arc::clone(&self.manager),
            auth: Arc::clone(&self.auth),
            store: Arc::clone(&self.store),
        });
        let app = create_router(state, self.config.server.max_body_size);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("GANGWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = self.config.server.port, "Listening");
        if self.config.auth.enabled {
            let keys = self.store.snapshot().security.api_keys.len();
            info!(keys, header = %self.auth.header_name(), "AUTHENTICATION enabled");
            if self.first_run {
                warn!("First-run keys generated; GET /gateway/auth/first-run-keys to retrieve them (answers once)");
            }
        } else {
            warn!("AUTHENTICATION disabled - gateway is open to all requests");
        }
        info!("Endpoints:");
        info!("  /proto/{{name}}     (protocol)");
        info!("  /stream/{{name}}    (events)");
        info!("  /gateway/backends (management)");
        info!("============================================================");

        // Mount what the store declared, open the doors, then bring the
        // backends up without blocking the accept loop
        self.manager.mount_all().await;
        self.manager.set_serving(true);

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            let (started, failed) = manager.start_all().await;
            info!(started, failed, "Backend startup finished");
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Draining backends");
        self.manager
            .shutdown_all(self.config.server.shutdown_timeout)
            .await;

        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
