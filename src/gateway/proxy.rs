//! Proxy router for backend endpoints
//!
//! Permanent wildcard routes under `/proto/{name}` and `/stream/{name}`
//! resolve the descriptor from the registry on every request; the route
//! table itself never changes as backends come and go. The instance sees
//! paths relative to its mount (`/` for the bare prefix).

use std::sync::Arc;

use axum::Json;
use axum::RequestExt;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use super::router::AppState;
use crate::Error;
use crate::registry::RouteDecision;

/// Which of the instance's two entry points a route targets
#[derive(Debug, Clone, Copy)]
enum TargetEndpoint {
    Proto,
    Stream,
}

pub(super) async fn proto_root(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    forward(&state, &name, "/", request, TargetEndpoint::Proto).await
}

pub(super) async fn proto_rest(
    State(state): State<Arc<AppState>>,
    Path((name, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    forward(&state, &name, &format!("/{rest}"), request, TargetEndpoint::Proto).await
}

pub(super) async fn stream_root(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    forward(&state, &name, "/", request, TargetEndpoint::Stream).await
}

pub(super) async fn stream_rest(
    State(state): State<Arc<AppState>>,
    Path((name, rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    forward(&state, &name, &format!("/{rest}"), request, TargetEndpoint::Stream).await
}

#[tracing::instrument(
    skip(state, request, name),
    fields(
        backend = %name,
        method = %request.method(),
        request_id = %Uuid::new_v4()
    )
)]
async fn forward(
    state: &AppState,
    name: &str,
    mount_relative: &str,
    request: Request,
    target: TargetEndpoint,
) -> Response {
    let stats = state.manager.stats();

    // Fresh registry read per request; the decision is one atomic step
    let instance = match state.manager.registry().resolve(name) {
        RouteDecision::Unknown => {
            stats.record_unknown();
            return (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": format!("Unknown backend: '{name}'"),
                    "backend": name,
                })),
            )
                .into_response();
        }
        RouteDecision::NotRunning(status) => {
            stats.record_not_running();
            let err = Error::NotRunning {
                name: name.to_string(),
                status,
            };
            return (
                err.http_status(),
                Json(json!({
                    "error": err.to_string(),
                    "backend": name,
                    "status": status,
                })),
            )
                .into_response();
        }
        RouteDecision::Live(instance) => instance,
    };

    // Rewrite the URI to the mount-relative remainder, keeping the query
    let target_uri = match request.uri().query() {
        Some(query) => format!("{mount_relative}?{query}"),
        None => mount_relative.to_string(),
    };
    let uri: Uri = match target_uri.parse() {
        Ok(uri) => uri,
        Err(e) => {
            stats.record_forward_error();
            error!(error = %e, "Failed to rewrite request URI");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "Failed to rewrite request URI",
                    "backend": name,
                })),
            )
                .into_response();
        }
    };

    // The body limit extension only applies to extractors; endpoints that
    // buffer need the limited body directly
    let mut request = request.with_limited_body();
    *request.uri_mut() = uri;

    debug!("Proxying request");

    let endpoint = match target {
        TargetEndpoint::Proto => instance.proto_endpoint(),
        TargetEndpoint::Stream => instance.stream_endpoint(),
    };
    match endpoint.handle(request).await {
        Ok(response) => {
            stats.record_proxied(name);
            response
        }
        Err(e) => {
            stats.record_forward_error();
            error!(error = %e, "Forwarding failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": e.to_string(),
                    "backend": name,
                })),
            )
                .into_response()
        }
    }
}
