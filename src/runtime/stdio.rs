//! Stdio backend runtime (subprocess)
//!
//! A `stdio` backend is a child process speaking line-delimited JSON on its
//! standard streams. The lifecycle owns the process; the proto endpoint
//! correlates POSTed messages with reply lines by their `id`, and the stream
//! endpoint fans id-less lines out to SSE subscribers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, warn};

use super::{BackendDeclaration, BackendEndpoint, BackendInstance, Lifecycle, TransportDecl};
use crate::{Error, Result};

/// How long `exit` waits for the child after closing stdin before killing it
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Buffered notifications per stream subscriber before it is marked lagged
const NOTIFICATION_BUFFER: usize = 256;

/// Keep-alive interval for notification streams
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Build the subprocess instance for a `stdio` declaration.
///
/// # Errors
///
/// Returns an error for non-`stdio` declarations. Spawn failures surface
/// later, when the lifecycle enters.
pub(super) fn build_instance(name: &str, declaration: &BackendDeclaration) -> Result<BackendInstance> {
    let TransportDecl::Stdio { command, args, env } = &declaration.transport else {
        return Err(Error::Build(format!(
            "Backend '{name}' is not a stdio declaration"
        )));
    };

    let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
    let shared = Arc::new(StdioShared {
        name: name.to_string(),
        pending: DashMap::new(),
        writer: Mutex::new(None),
        notifications,
    });

    let proto = Arc::new(StdioProtoEndpoint {
        shared: Arc::clone(&shared),
        timeout: declaration.request_timeout(),
    });
    let stream = Arc::new(StdioStreamEndpoint {
        shared: Arc::clone(&shared),
    });
    let lifecycle = Box::new(StdioLifecycle {
        command: command.clone(),
        args: args.clone(),
        env: env.clone(),
        shared,
        child: None,
    });

    Ok(BackendInstance::new(proto, stream, lifecycle))
}

/// State shared between the lifecycle and both endpoints
struct StdioShared {
    name: String,
    /// Requests waiting for a reply line, keyed by serialized `id`
    pending: DashMap<String, oneshot::Sender<Value>>,
    writer: Mutex<Option<ChildStdin>>,
    notifications: broadcast::Sender<Value>,
}

impl StdioShared {
    /// Route one stdout line: replies go to their pending request, id-less
    /// lines are notifications
    fn route_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(backend = %self.name, error = %e, "Discarding unparseable stdout line");
                return;
            }
        };
        match value.get("id") {
            Some(id) if !id.is_null() => {
                let key = id.to_string();
                if let Some((_, sender)) = self.pending.remove(&key) {
                    let _ = sender.send(value);
                } else {
                    debug!(backend = %self.name, id = %key, "Reply without a pending request");
                }
            }
            _ => {
                let _ = self.notifications.send(value);
            }
        }
    }

    async fn write_line(&self, message: &Value) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stdin) = writer.as_mut() else {
            return Err(Error::Forward(format!(
                "Backend '{}' has no open stdin",
                self.name
            )));
        };
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::Forward(format!("Failed to write to backend '{}': {e}", self.name)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Forward(format!("Failed to flush to backend '{}': {e}", self.name)))?;
        Ok(())
    }
}

/// Owns the child process between `enter` and `exit`
struct StdioLifecycle {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    shared: Arc<StdioShared>,
    child: Option<Child>,
}

#[async_trait]
impl Lifecycle for StdioLifecycle {
    async fn enter(&mut self) -> Result<()> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Lifecycle(format!("Failed to spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Lifecycle("Child has no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Lifecycle("Child has no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Lifecycle("Child has no stderr pipe".to_string()))?;

        *self.shared.writer.lock().await = Some(stdin);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                shared.route_line(&line);
            }
            // EOF means the child is gone; waiting callers should fail now
            // rather than sit out their timeouts
            shared.pending.clear();
            debug!(backend = %shared.name, "Stdout reader ended");
        });

        // Keep stderr drained so the child can never block on a full pipe
        let name = self.shared.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(backend = %name, "stderr: {line}");
            }
        });

        debug!(
            backend = %self.shared.name,
            command = %self.command,
            pid = ?child.id(),
            "Spawned backend process"
        );
        self.child = Some(child);
        Ok(())
    }

    async fn exit(&mut self) -> Result<()> {
        // Dropping stdin tells a well-behaved child to leave
        self.shared.writer.lock().await.take();
        self.shared.pending.clear();

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(backend = %self.shared.name, status = %status, "Backend process exited");
                }
                Ok(Err(e)) => {
                    warn!(backend = %self.shared.name, error = %e, "Failed to reap backend process");
                }
                Err(_) => {
                    warn!(backend = %self.shared.name, "Backend process ignored stdin close; killing it");
                    if let Err(e) = child.kill().await {
                        warn!(backend = %self.shared.name, error = %e, "Failed to kill backend process");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Accepts POSTed JSON and correlates replies by `id`
struct StdioProtoEndpoint {
    shared: Arc<StdioShared>,
    timeout: Duration,
}

#[async_trait]
impl BackendEndpoint for StdioProtoEndpoint {
    async fn handle(&self, request: Request) -> Result<Response> {
        if request.method() != Method::POST {
            let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST"));
            return Ok(response);
        }

        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| Error::Forward(format!("Failed to read request body: {e}")))?;
        let message: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::Forward(format!("Request body is not valid JSON: {e}")))?;

        let Some(id) = message.get("id").filter(|id| !id.is_null()).cloned() else {
            // Notifications get no reply line
            self.shared.write_line(&message).await?;
            return Ok(StatusCode::ACCEPTED.into_response());
        };

        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key.clone(), tx);

        if let Err(e) = self.shared.write_line(&message).await {
            self.shared.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(Json(reply).into_response()),
            Ok(Err(_)) => Err(Error::Forward(format!(
                "Backend '{}' closed before replying",
                self.shared.name
            ))),
            Err(_) => {
                self.shared.pending.remove(&key);
                Err(Error::Forward(format!(
                    "Backend '{}' did not reply within {}s",
                    self.shared.name,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

/// Serves the child's notifications as an SSE stream
struct StdioStreamEndpoint {
    shared: Arc<StdioShared>,
}

#[async_trait]
impl BackendEndpoint for StdioStreamEndpoint {
    async fn handle(&self, _request: Request) -> Result<Response> {
        let mut rx = self.shared.notifications.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        yield Ok::<_, std::convert::Infallible>(
                            Event::default().data(notification.to_string()),
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Ok(Event::default()
                            .event("lagged")
                            .data(serde_json::json!({ "missed": n }).to_string()));
                    }
                }
            }
        };
        Ok(Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"))
            .into_response())
    }
}
