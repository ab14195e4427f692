//! HTTP router and management handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};

use super::auth::{AuthState, AuthenticatedClient, auth_middleware};
use super::proxy;
use crate::Error;
use crate::manager::GatewayManager;
use crate::runtime::BackendDeclaration;
use crate::store::JsonFileStore;

/// Shared application state
pub struct AppState {
    /// Orchestrator owning registry, supervisor, runtime and store
    pub manager: Arc<GatewayManager>,
    /// Auth gate state
    pub auth: Arc<AuthState>,
    /// Config store, also owner of the security state
    pub store: Arc<JsonFileStore>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    let auth = Arc::clone(&state.auth);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        // Permanent proxy routes; per-name resolution happens per request
        .route("/proto/{name}", any(proxy::proto_root))
        .route("/proto/{name}/{*rest}", any(proxy::proto_rest))
        .route("/stream/{name}", any(proxy::stream_root))
        .route("/stream/{name}/{*rest}", any(proxy::stream_rest))
        // Management surface
        .route(
            "/gateway/backends",
            get(list_backends_handler).post(add_backend_handler),
        )
        .route(
            "/gateway/backends/{name}",
            get(get_backend_handler).delete(remove_backend_handler),
        )
        .route("/gateway/backends/{name}/health", get(backend_health_handler))
        .route("/gateway/backends/{name}/start", post(start_backend_handler))
        .route("/gateway/backends/{name}/stop", post(stop_backend_handler))
        .route(
            "/gateway/backends/{name}/restart",
            post(restart_backend_handler),
        )
        // Auth surface
        .route("/gateway/auth/verify", post(verify_handler))
        .route("/gateway/auth/config", get(auth_config_handler))
        .route("/gateway/auth/first-run-keys", get(first_run_keys_handler))
        .route("/gateway/auth/info", get(auth_info_handler))
        .route("/gateway/stats", get(stats_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(max_body_size))
        .with_state(state)
}

/// Service banner
async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "gangway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "proto": "/proto/{name}",
            "stream": "/stream/{name}",
            "management": "/gateway/backends",
            "health": "/health",
        },
    }))
}

/// Gateway liveness; always 200 while the process serves
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots = state.manager.registry().snapshot();
    let running = snapshots.iter().filter(|s| s.status.is_running()).count();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "backends": { "total": snapshots.len(), "running": running },
    }))
}

// ============================================================================
// Backend management
// ============================================================================

async fn list_backends_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots = state.manager.registry().snapshot();
    let total = snapshots.len();
    let backends: serde_json::Map<String, Value> = snapshots
        .into_iter()
        .map(|s| {
            let name = s.name.clone();
            (name, serde_json::to_value(&s).unwrap_or_default())
        })
        .collect();
    Json(json!({ "backends": backends, "total": total }))
}

async fn add_backend_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let (name, declaration) = match parse_add_body(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return (e.http_status(), Json(json!({ "error": e.to_string() }))).into_response();
        }
    };
    match state.manager.add(&name, declaration).await {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(e) => backend_error(&name, &e),
    }
}

async fn get_backend_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.registry().get(&name) {
        Some(descriptor) => Json(descriptor.snapshot()).into_response(),
        None => backend_error(&name, &Error::NotFound(name.clone())),
    }
}

async fn remove_backend_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.remove(&name).await {
        Ok(removed) => Json(json!({ "backend": name, "removed": removed })).into_response(),
        Err(e) => backend_error(&name, &e),
    }
}

async fn backend_health_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let Some(descriptor) = state.manager.registry().get(&name) else {
        return backend_error(&name, &Error::NotFound(name.clone()));
    };
    let snapshot = descriptor.snapshot();
    let healthy = snapshot.status.is_running();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let mut body = serde_json::to_value(&snapshot).unwrap_or_else(|_| json!({}));
    if let Some(map) = body.as_object_mut() {
        map.insert("backend".to_string(), json!(name));
        map.insert("healthy".to_string(), json!(healthy));
    }
    (code, Json(body)).into_response()
}

async fn start_backend_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.start(&name).await {
        Ok(()) => status_body(&state, &name),
        Err(e) => backend_error(&name, &e),
    }
}

async fn stop_backend_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.stop(&name).await {
        Ok(()) => status_body(&state, &name),
        Err(e) => backend_error(&name, &e),
    }
}

async fn restart_backend_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let new_declaration = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<BackendDeclaration>(&body) {
            Ok(declaration) => Some(declaration),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": format!("Invalid declaration: {e}"),
                        "backend": name,
                    })),
                )
                    .into_response();
            }
        }
    };
    match state.manager.restart(&name, new_declaration).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => backend_error(&name, &e),
    }
}

// ============================================================================
// Auth surface
// ============================================================================

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header_name = state.auth.header_name();
    let presented = headers
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok());
    match presented.and_then(|p| state.auth.verify(p)) {
        Some(client) => (
            StatusCode::OK,
            Json(json!({
                "valid": true,
                "name": client.name,
                "permission": client.permission,
            })),
        ),
        None => (StatusCode::UNAUTHORIZED, Json(json!({ "valid": false }))),
    }
}

async fn auth_config_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "auth_enabled": state.auth.is_enabled(),
        "header_name": state.auth.header_name(),
    }))
}

/// One-shot reveal of the generated bootstrap keys
async fn first_run_keys_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.take_first_run_keys() {
        Some(keys) => (
            StatusCode::OK,
            Json(json!({
                "message": "Store these keys now; they will not be shown again",
                "keys": keys,
            })),
        )
            .into_response(),
        None => (
            StatusCode::GONE,
            Json(json!({ "error": "First-run keys already retrieved" })),
        )
            .into_response(),
    }
}

async fn auth_info_handler(client: Option<Extension<AuthenticatedClient>>) -> Response {
    match client {
        Some(Extension(client)) => Json(json!({
            "name": client.name,
            "permission": client.permission,
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.stats().snapshot())
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_add_body(mut body: Value) -> crate::Result<(String, BackendDeclaration)> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| Error::Declaration("Request body must include a 'name'".to_string()))?;
    if let Some(map) = body.as_object_mut() {
        map.remove("name");
    }
    let declaration: BackendDeclaration = serde_json::from_value(body)
        .map_err(|e| Error::Declaration(format!("Invalid declaration: {e}")))?;
    Ok((name, declaration))
}

fn backend_error(name: &str, error: &Error) -> Response {
    (
        error.http_status(),
        Json(json!({ "error": error.to_string(), "backend": name })),
    )
        .into_response()
}

fn status_body(state: &AppState, name: &str) -> Response {
    let status = state.manager.registry().status(name);
    Json(json!({ "backend": name, "status": status })).into_response()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn add_body_splits_name_from_declaration() {
        let (name, declaration) = parse_add_body(json!({
            "name": "files",
            "type": "stdio",
            "command": "file-server",
            "args": ["--root", "/srv"],
        }))
        .unwrap();
        assert_eq!(name, "files");
        assert_eq!(declaration.kind(), "stdio");
    }

    #[test]
    fn add_body_without_name_is_rejected() {
        let err = parse_add_body(json!({ "type": "stdio", "command": "file-server" })).unwrap_err();
        assert!(matches!(err, Error::Declaration(_)));
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn add_body_with_malformed_declaration_is_rejected() {
        let err = parse_add_body(json!({ "name": "files", "type": "teleport" })).unwrap_err();
        assert!(matches!(err, Error::Declaration(_)));
    }
}
