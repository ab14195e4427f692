//! Backend Runtime boundary
//!
//! A runtime turns a [`BackendDeclaration`] into a [`BackendInstance`]: two
//! request-handling entry points (protocol + stream) and a single-use
//! lifecycle handle the supervisor drives. The gateway core treats all of
//! this as a black box; [`StandardRuntime`] is the bundled implementation.

pub mod http;
pub mod stdio;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RuntimeConfig;
use crate::{Error, Result};

// ============================================================================
// Declarations
// ============================================================================

/// Transport-specific half of a backend declaration, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportDecl {
    /// Subprocess speaking line-delimited JSON on stdio
    Stdio {
        /// Program to execute
        command: String,
        /// Arguments passed to the program
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables for the child process
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server whose declared URL is the event stream
    Sse {
        /// Event-stream URL
        url: String,
        /// Protocol-call URL; defaults to `url`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proto_url: Option<String>,
        /// Headers appended to every forwarded request (values support
        /// `${VAR}` / `${VAR:-default}` expansion at build time)
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Remote server whose declared URL is the protocol endpoint
    StreamableHttp {
        /// Protocol URL
        url: String,
        /// Event-stream URL; defaults to `url`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_url: Option<String>,
        /// Headers appended to every forwarded request (values support
        /// `${VAR}` / `${VAR:-default}` expansion at build time)
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// A backend declaration: transport kind + connection parameters, plus the
/// common knobs every backend carries. Opaque to the gateway core beyond
/// validation; the runtime factory consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDeclaration {
    /// Transport configuration
    #[serde(flatten)]
    pub transport: TransportDecl,
    /// Registered at boot but neither mounted nor started when false
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-request forward timeout in seconds (1..=300)
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// When false, the auth gate treats this backend's endpoints as public
    #[serde(default = "default_true")]
    pub require_auth: bool,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl BackendDeclaration {
    /// Transport kind as it appears in snapshots and the store document
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.transport {
            TransportDecl::Stdio { .. } => "stdio",
            TransportDecl::Sse { .. } => "sse",
            TransportDecl::StreamableHttp { .. } => "streamable-http",
        }
    }

    /// Per-request forward timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Structural validation, run before any registry mutation
    pub fn validate(&self) -> Result<()> {
        if !(1..=300).contains(&self.timeout) {
            return Err(Error::Declaration(format!(
                "timeout must be between 1 and 300 seconds, got {}",
                self.timeout
            )));
        }
        match &self.transport {
            TransportDecl::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::Declaration("stdio command is empty".to_string()));
                }
            }
            TransportDecl::Sse { url, proto_url, .. } => {
                validate_http_url(url)?;
                if let Some(u) = proto_url {
                    validate_http_url(u)?;
                }
            }
            TransportDecl::StreamableHttp { url, stream_url, .. } => {
                validate_http_url(url)?;
                if let Some(u) = stream_url {
                    validate_http_url(u)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_http_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| Error::Declaration(format!("invalid url '{raw}': {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::Declaration(format!(
            "unsupported url scheme '{}' in '{raw}'",
            url.scheme()
        )));
    }
    Ok(())
}

// ============================================================================
// Runtime traits
// ============================================================================

/// A request-handling entry point of a live backend instance.
///
/// Receives mount-relative requests: the gateway rewrites the URI so the
/// instance sees `/ping` for `GET /proto/{name}/ping`.
#[async_trait]
pub trait BackendEndpoint: Send + Sync {
    /// Forward one request and return the backend's response
    async fn handle(&self, request: Request) -> Result<Response>;
}

/// Single-use enter/exit handle driving one instance's liveness.
///
/// `enter` is called exactly once by the supervised task; `exit` is called at
/// most once afterwards, under the stop grace period.
#[async_trait]
pub trait Lifecycle: Send {
    /// Bring the instance up
    async fn enter(&mut self) -> Result<()>;
    /// Tear the instance down
    async fn exit(&mut self) -> Result<()>;
}

/// Factory producing instances from declarations
#[async_trait]
pub trait BackendRuntime: Send + Sync {
    /// Construct a fresh instance for `name`.
    ///
    /// Construction is cheap; connecting and spawning belong in the returned
    /// lifecycle handle.
    async fn build(&self, name: &str, declaration: &BackendDeclaration)
    -> Result<BackendInstance>;
}

/// One built backend instance: the two entry points the router forwards to,
/// plus the lifecycle handle the supervisor takes exclusive ownership of.
pub struct BackendInstance {
    proto: Arc<dyn BackendEndpoint>,
    stream: Arc<dyn BackendEndpoint>,
    lifecycle: Mutex<Option<Box<dyn Lifecycle>>>,
}

impl BackendInstance {
    /// Assemble an instance from its parts
    #[must_use]
    pub fn new(
        proto: Arc<dyn BackendEndpoint>,
        stream: Arc<dyn BackendEndpoint>,
        lifecycle: Box<dyn Lifecycle>,
    ) -> Self {
        Self {
            proto,
            stream,
            lifecycle: Mutex::new(Some(lifecycle)),
        }
    }

    /// Entry point for `/proto/{name}` requests
    #[must_use]
    pub fn proto_endpoint(&self) -> Arc<dyn BackendEndpoint> {
        Arc::clone(&self.proto)
    }

    /// Entry point for `/stream/{name}` requests
    #[must_use]
    pub fn stream_endpoint(&self) -> Arc<dyn BackendEndpoint> {
        Arc::clone(&self.stream)
    }

    /// Take exclusive ownership of the lifecycle handle.
    /// Returns `None` once the handle has been consumed by a supervised task.
    pub fn take_lifecycle(&self) -> Option<Box<dyn Lifecycle>> {
        self.lifecycle.lock().take()
    }

    /// Whether the lifecycle handle is still available
    #[must_use]
    pub fn has_lifecycle(&self) -> bool {
        self.lifecycle.lock().is_some()
    }
}

impl std::fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendInstance")
            .field("lifecycle_available", &self.has_lifecycle())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Bundled runtime
// ============================================================================

/// The bundled runtime: URL-backed instances forward over HTTP, `stdio`
/// declarations get the subprocess bridge.
pub struct StandardRuntime {
    client: reqwest::Client,
    config: RuntimeConfig,
}

impl StandardRuntime {
    /// Build the runtime and its shared HTTP client
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl BackendRuntime for StandardRuntime {
    async fn build(
        &self,
        name: &str,
        declaration: &BackendDeclaration,
    ) -> Result<BackendInstance> {
        match &declaration.transport {
            TransportDecl::Stdio { .. } => stdio::build_instance(name, declaration),
            TransportDecl::Sse { .. } | TransportDecl::StreamableHttp { .. } => {
                http::build_instance(&self.client, &self.config, name, declaration)
            }
        }
    }
}
