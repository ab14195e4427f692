//! Gangway Library
//!
//! Single-port gateway that fronts a dynamic fleet of backend protocol
//! servers: subprocesses speaking line-delimited JSON on stdio and remote
//! HTTP/SSE servers alike.
//!
//! # Features
//!
//! - **Dynamic fleet**: add, start, stop, restart and remove backends over a
//!   management API, persisted across restarts in a JSON config store
//! - **Multi-transport**: stdio subprocesses, SSE and streamable HTTP remotes
//!   behind one uniform pair of routes per backend
//! - **Streaming**: backend notifications fan out to clients as SSE
//! - **Authentication**: API keys with read/write permissions, per-backend
//!   opt-out, public path allowlist
//! - **Operable**: per-backend health, gateway stats, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod registry;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod supervisor;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
