//! HTTP backend runtime
//!
//! Forwarding endpoints for `sse` and `streamable-http` declarations. A
//! mount-relative request is rewritten onto the declared base URL with
//! hop-by-hop headers stripped and the declaration's headers appended; the
//! response is streamed back verbatim, so SSE passthrough needs no special
//! handling. The declared timeout bounds time-to-response-headers only;
//! streamed bodies flow for as long as the peer keeps them open.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use axum::response::Response;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use super::{BackendDeclaration, BackendEndpoint, BackendInstance, Lifecycle, TransportDecl};
use crate::config::RuntimeConfig;
use crate::{Error, Result};

/// Build the forwarding instance for an `sse` or `streamable-http`
/// declaration.
///
/// # Errors
///
/// Returns an error for a `stdio` declaration or for declared headers that
/// do not form valid header names/values after expansion.
pub(super) fn build_instance(
    client: &Client,
    config: &RuntimeConfig,
    name: &str,
    declaration: &BackendDeclaration,
) -> Result<BackendInstance> {
    let (proto_url, stream_url, declared_headers) = match &declaration.transport {
        TransportDecl::Sse {
            url,
            proto_url,
            headers,
        } => (
            proto_url.clone().unwrap_or_else(|| url.clone()),
            url.clone(),
            headers,
        ),
        TransportDecl::StreamableHttp {
            url,
            stream_url,
            headers,
        } => (
            url.clone(),
            stream_url.clone().unwrap_or_else(|| url.clone()),
            headers,
        ),
        TransportDecl::Stdio { .. } => {
            return Err(Error::Build(format!(
                "Backend '{name}' is not an HTTP declaration"
            )));
        }
    };

    let headers = resolve_headers(declared_headers)?;
    let timeout = declaration.request_timeout();

    let proto = Arc::new(HttpEndpoint {
        client: client.clone(),
        base: proto_url.clone(),
        headers: headers.clone(),
        timeout,
    });
    let stream = Arc::new(HttpEndpoint {
        client: client.clone(),
        base: stream_url,
        headers: headers.clone(),
        timeout,
    });
    let lifecycle = Box::new(HttpLifecycle {
        client: client.clone(),
        name: name.to_string(),
        probe_url: proto_url,
        headers,
        timeout,
        probe: config.probe_on_start,
    });

    Ok(BackendInstance::new(proto, stream, lifecycle))
}

/// Forwards mount-relative requests onto one declared base URL
struct HttpEndpoint {
    client: Client,
    base: String,
    headers: HeaderMap,
    timeout: Duration,
}

#[async_trait]
impl BackendEndpoint for HttpEndpoint {
    async fn handle(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();
        let target = join_url(&self.base, parts.uri.path(), parts.uri.query());

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        // Request bodies are buffered (the router bounds their size);
        // response bodies stream through untouched
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::Forward(format!("Failed to read request body: {e}")))?;

        debug!(method = %parts.method, target = %target, "Forwarding request");
        let send = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(body)
            .send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| {
                Error::Forward(format!(
                    "No response from {target} within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Forward(format!("Request to {target} failed: {e}")))?;

        let status = response.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name) {
                continue;
            }
            response_headers.append(name.clone(), value.clone());
        }

        let mut forwarded = Response::new(Body::from_stream(response.bytes_stream()));
        *forwarded.status_mut() = status;
        *forwarded.headers_mut() = response_headers;
        Ok(forwarded)
    }
}

/// Startup is a reachability probe; there is nothing to tear down
struct HttpLifecycle {
    client: Client,
    name: String,
    probe_url: String,
    headers: HeaderMap,
    timeout: Duration,
    probe: bool,
}

#[async_trait]
impl Lifecycle for HttpLifecycle {
    async fn enter(&mut self) -> Result<()> {
        if !self.probe {
            return Ok(());
        }
        // Any HTTP status counts as reachable; only a transport failure is a
        // startup error
        let probe = self
            .client
            .get(&self.probe_url)
            .headers(self.headers.clone())
            .send();
        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(response)) => {
                debug!(
                    backend = %self.name,
                    status = %response.status(),
                    "Reachability probe ok"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Lifecycle(format!(
                "Backend at {} is unreachable: {e}",
                self.probe_url
            ))),
            Err(_) => Err(Error::Lifecycle(format!(
                "Backend at {} did not answer the reachability probe within {}s",
                self.probe_url,
                self.timeout.as_secs()
            ))),
        }
    }

    async fn exit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Append a mount-relative path and query to a declared base URL
fn join_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    if path == "/" {
        // Bare-prefix request: hit the base itself, preserving a deliberate
        // trailing slash
        if base.ends_with('/') {
            url.push('/');
        }
    } else {
        url.push_str(path);
    }
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Headers that must not cross a proxy hop (RFC 9110 §7.6.1)
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Matches `${VAR}` and `${VAR:-default}` references; compiled once
static ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap());

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment. Unset variables without a default expand to the empty string.
fn expand_env(value: &str) -> String {
    ENV_REFERENCE
        .replace_all(value, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(v) => v,
                Err(_) => caps.get(2).map_or(String::new(), |d| d.as_str().to_string()),
            }
        })
        .into_owned()
}

fn resolve_headers(declared: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in declared {
        let expanded = expand_env(value);
        let name: HeaderName = key
            .parse()
            .map_err(|_| Error::Build(format!("Invalid declared header name: '{key}'")))?;
        let value: HeaderValue = expanded
            .parse()
            .map_err(|_| Error::Build(format!("Invalid value for declared header '{key}'")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
