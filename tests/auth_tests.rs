//! End-to-end authentication tests
//!
//! Runs the full router with a seeded key store and checks the gate from a
//! client's point of view: credential handling, permission levels, public
//! paths, per-backend opt-out, and the first-run key handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::CONTENT_TYPE};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use gangway::Result;
use gangway::config::AuthConfig;
use gangway::gateway::{AppState, AuthState, create_router};
use gangway::manager::GatewayManager;
use gangway::registry::BackendRegistry;
use gangway::runtime::{
    BackendDeclaration, BackendEndpoint, BackendInstance, BackendRuntime, Lifecycle,
};
use gangway::stats::GatewayStats;
use gangway::store::{ConfigStore, JsonFileStore};

const HEADER: &str = "Gangway-Key";
const ADMIN_KEY: &str = "admin-key-0001";
const READER_KEY: &str = "reader-key-0001";
const DORMANT_KEY: &str = "dormant-key-0001";
const EXPIRED_KEY: &str = "expired-key-0001";

// ============================================================================
// Harness
// ============================================================================

struct MarkerEndpoint {
    role: &'static str,
}

#[async_trait]
impl BackendEndpoint for MarkerEndpoint {
    async fn handle(&self, _request: axum::extract::Request) -> Result<axum::response::Response> {
        Ok(axum::response::Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"role": self.role}).to_string()))
            .unwrap())
    }
}

struct NoopLifecycle;

#[async_trait]
impl Lifecycle for NoopLifecycle {
    async fn enter(&mut self) -> Result<()> {
        Ok(())
    }
    async fn exit(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MarkerRuntime;

#[async_trait]
impl BackendRuntime for MarkerRuntime {
    async fn build(
        &self,
        _name: &str,
        _declaration: &BackendDeclaration,
    ) -> Result<BackendInstance> {
        Ok(BackendInstance::new(
            Arc::new(MarkerEndpoint { role: "proto" }),
            Arc::new(MarkerEndpoint { role: "stream" }),
            Box::new(NoopLifecycle),
        ))
    }
}

fn seeded_store(dir: &TempDir) -> Arc<JsonFileStore> {
    let path = dir.path().join("gangway.json");
    let document = json!({
        "backends": {},
        "security": {
            "header_name": HEADER,
            "api_keys": [
                {"key": ADMIN_KEY, "name": "admin", "permission": "write"},
                {"key": READER_KEY, "name": "reader", "permission": "read"},
                {"key": DORMANT_KEY, "name": "dormant", "permission": "write", "enabled": false},
                {"key": EXPIRED_KEY, "name": "expired", "permission": "write",
                 "expires_at": "2020-01-01T00:00:00Z"}
            ]
        }
    });
    std::fs::write(&path, document.to_string()).unwrap();
    Arc::new(JsonFileStore::open(path).unwrap())
}

struct Harness {
    _dir: TempDir,
    router: Router,
    store: Arc<JsonFileStore>,
}

fn harness_with(enabled: bool, store: impl FnOnce(&TempDir) -> Arc<JsonFileStore>) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let registry = Arc::new(BackendRegistry::new());
    let stats = Arc::new(GatewayStats::new());
    let manager = Arc::new(GatewayManager::new(
        Arc::clone(&registry),
        Arc::new(MarkerRuntime),
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::clone(&stats),
        Duration::from_secs(1),
    ));
    manager.set_serving(true);
    let auth = Arc::new(AuthState::new(
        &AuthConfig {
            enabled,
            ..AuthConfig::default()
        },
        Arc::clone(&store),
        registry,
        stats,
    ));
    let state = Arc::new(AppState {
        manager,
        auth,
        store: Arc::clone(&store),
    });
    let router = create_router(state, 1024 * 1024);
    Harness {
        _dir: dir,
        router,
        store,
    }
}

fn harness() -> Harness {
    harness_with(true, seeded_store)
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    key: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header(HEADER, key);
    }
    let body = match body {
        Some(v) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn add_body(name: &str, require_auth: bool) -> Value {
    json!({
        "name": name,
        "type": "streamable-http",
        "url": "http://127.0.0.1:9901/",
        "require_auth": require_auth
    })
}

// ============================================================================
// Credential handling
// ============================================================================

#[tokio::test]
async fn missing_credential_is_unauthorized() {
    let h = harness();

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/gateway/backends")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // The challenge names the header clients must present
    assert_eq!(
        response.headers()["www-authenticate"].to_str().unwrap(),
        HEADER
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "Missing credential");
}

#[tokio::test]
async fn bad_keys_are_rejected_without_detail() {
    let h = harness();

    for key in ["no-such-key", DORMANT_KEY, EXPIRED_KEY] {
        let (status, body) = send(&h.router, "GET", "/gateway/backends", Some(key), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "key {key}");
        // Unknown, disabled and expired keys all get the same answer
        assert_eq!(body["error"], "Invalid credential", "key {key}");
    }
}

#[tokio::test]
async fn rejections_are_counted() {
    let h = harness();

    send(&h.router, "GET", "/gateway/backends", None, None).await;
    send(&h.router, "GET", "/gateway/backends", Some("wrong"), None).await;
    send(
        &h.router,
        "POST",
        "/gateway/backends",
        Some(READER_KEY),
        Some(add_body("echo", true)),
    )
    .await;

    let (status, body) = send(&h.router, "GET", "/gateway/stats", Some(READER_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth_failures"], 3);
}

// ============================================================================
// Permission levels
// ============================================================================

#[tokio::test]
async fn read_keys_observe_but_never_mutate() {
    let h = harness();
    let (status, _) = send(
        &h.router,
        "POST",
        "/gateway/backends",
        Some(ADMIN_KEY),
        Some(add_body("echo", true)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Reads pass
    let (status, body) = send(&h.router, "GET", "/gateway/backends", Some(READER_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    let (status, _) = send(
        &h.router,
        "GET",
        "/gateway/backends/echo/health",
        Some(READER_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Forwarding is a read, whatever the HTTP method
    let (status, body) = send(&h.router, "POST", "/proto/echo", Some(READER_KEY), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "proto");

    // Mutations do not
    for (method, uri) in [
        ("POST", "/gateway/backends/echo/stop"),
        ("POST", "/gateway/backends/echo/start"),
        ("POST", "/gateway/backends/echo/restart"),
        ("DELETE", "/gateway/backends/echo"),
    ] {
        let (status, body) = send(&h.router, method, uri, Some(READER_KEY), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(body["error"], "Insufficient permission");
    }

    // The backend never saw the refused stop
    let (_, body) = send(&h.router, "GET", "/gateway/backends/echo", Some(READER_KEY), None).await;
    assert_eq!(body["status"], "running");
}

#[tokio::test]
async fn write_keys_manage_the_fleet() {
    let h = harness();

    let (status, _) = send(
        &h.router,
        "POST",
        "/gateway/backends",
        Some(ADMIN_KEY),
        Some(add_body("echo", true)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &h.router,
        "POST",
        "/gateway/backends/echo/stop",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (status, body) = send(
        &h.router,
        "DELETE",
        "/gateway/backends/echo",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);
}

// ============================================================================
// Public surface
// ============================================================================

#[tokio::test]
async fn public_paths_need_no_credential() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "gangway");

    let (status, _) = send(&h.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.router, "GET", "/gateway/auth/config", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth_enabled"], true);
    assert_eq!(body["header_name"], HEADER);
}

#[tokio::test]
async fn verify_endpoint_reports_credential_standing() {
    let h = harness();

    let (status, body) = send(
        &h.router,
        "POST",
        "/gateway/auth/verify",
        Some(ADMIN_KEY),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["name"], "admin");
    assert_eq!(body["permission"], "write");

    let (status, body) = send(&h.router, "POST", "/gateway/auth/verify", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);

    let (status, body) = send(&h.router, "POST", "/gateway/auth/verify", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn whoami_reflects_the_presented_key() {
    let h = harness();

    let (status, body) = send(&h.router, "GET", "/gateway/auth/info", Some(ADMIN_KEY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "admin");
    assert_eq!(body["permission"], "write");

    let (_, body) = send(&h.router, "GET", "/gateway/auth/info", Some(READER_KEY), None).await;
    assert_eq!(body["name"], "reader");
    assert_eq!(body["permission"], "read");

    let (status, _) = send(&h.router, "GET", "/gateway/auth/info", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_run_keys_answer_exactly_once() {
    let h = harness_with(true, |dir| {
        let store = Arc::new(JsonFileStore::open(dir.path().join("gangway.json")).unwrap());
        assert!(store.ensure_default_keys().unwrap());
        store
    });

    let (status, body) = send(&h.router, "GET", "/gateway/auth/first-run-keys", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"].as_array().unwrap().len(), 2);
    assert!(body["message"].as_str().unwrap().contains("not be shown again"));

    // The generated admin key actually works
    let admin_key = body["keys"][0]["key"].as_str().unwrap().to_string();
    let (status, _) = send(
        &h.router,
        "GET",
        "/gateway/backends",
        Some(&admin_key),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Second retrieval is gone
    let (status, _) = send(&h.router, "GET", "/gateway/auth/first-run-keys", None, None).await;
    assert_eq!(status, StatusCode::GONE);
}

// ============================================================================
// Per-backend opt-out and the disabled gate
// ============================================================================

#[tokio::test]
async fn opted_out_backends_forward_without_credentials() {
    let h = harness();
    send(
        &h.router,
        "POST",
        "/gateway/backends",
        Some(ADMIN_KEY),
        Some(add_body("open", false)),
    )
    .await;
    send(
        &h.router,
        "POST",
        "/gateway/backends",
        Some(ADMIN_KEY),
        Some(add_body("locked", true)),
    )
    .await;

    // The opted-out backend is reachable anonymously, on both entry points
    let (status, body) = send(&h.router, "GET", "/proto/open", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "proto");
    let (status, body) = send(&h.router, "GET", "/stream/open/events", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "stream");

    // Its management surface is not part of the opt-out
    let (status, _) = send(&h.router, "GET", "/gateway/backends/open", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Other backends keep the gate
    let (status, _) = send(&h.router, "GET", "/proto/locked", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn disabled_gate_admits_anonymous_writes() {
    let h = harness_with(false, seeded_store);

    let (status, _) = send(
        &h.router,
        "POST",
        "/gateway/backends",
        None,
        Some(add_body("echo", true)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&h.router, "GET", "/gateway/auth/config", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth_enabled"], false);

    // The anonymous identity carries write permission
    let (status, body) = send(&h.router, "GET", "/gateway/auth/info", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["permission"], "write");

    // Keys in the store are ignored but harmless
    assert_eq!(h.store.snapshot().security.api_keys.len(), 4);
}
