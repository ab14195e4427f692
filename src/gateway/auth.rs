//! Authentication gate
//!
//! Runs as axum middleware in front of every route. Order of decisions:
//! public-path allowlist, per-backend `require_auth = false` override, then
//! credential header lookup against the store's live security configuration
//! and a permission check resolved from ordered per-path rules. Rejections
//! are deliberately generic so callers cannot probe which keys exist.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::registry::BackendRegistry;
use crate::stats::GatewayStats;
use crate::store::{JsonFileStore, Permission};

/// One allowlist entry. A configured pattern ending in `/` matches as a
/// prefix; the bare `/` and everything else match exactly.
#[derive(Debug, Clone)]
enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    fn parse(raw: &str) -> Self {
        if raw != "/" && raw.ends_with('/') {
            Self::Prefix(raw.to_string())
        } else {
            Self::Exact(raw.to_string())
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(pattern) => path == pattern,
            Self::Prefix(pattern) => path.starts_with(pattern.as_str()),
        }
    }
}

/// Ordered path rules resolving the permission a request needs; first match
/// wins, then the method convention applies
struct PermissionRules {
    rules: Vec<(Regex, Permission)>,
}

impl PermissionRules {
    fn new() -> Self {
        #[allow(clippy::unwrap_used)]
        let rules = vec![
            (
                Regex::new(r"^/gateway/backends/[^/]+/(start|stop|restart)$").unwrap(),
                Permission::Write,
            ),
            (
                Regex::new(r"^/gateway/backends/[^/]+/health$").unwrap(),
                Permission::Read,
            ),
            (Regex::new("^/proto/").unwrap(), Permission::Read),
            (Regex::new("^/stream/").unwrap(), Permission::Read),
        ];
        Self { rules }
    }

    fn required(&self, method: &Method, path: &str) -> Permission {
        for (pattern, permission) in &self.rules {
            if pattern.is_match(path) {
                return *permission;
            }
        }
        if matches!(*method, Method::GET | Method::HEAD) {
            Permission::Read
        } else {
            Permission::Write
        }
    }
}

/// Identity resolved by the gate, attached to request extensions
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedClient {
    /// Key label, or `anonymous`/`public` for ungated requests
    pub name: String,
    /// Granted access level
    pub permission: Permission,
}

impl AuthenticatedClient {
    fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            permission: Permission::Write,
        }
    }

    fn public() -> Self {
        Self {
            name: "public".to_string(),
            permission: Permission::Read,
        }
    }
}

/// Everything the gate needs per request
pub struct AuthState {
    enabled: bool,
    public_paths: Vec<PathPattern>,
    rules: PermissionRules,
    store: Arc<JsonFileStore>,
    registry: Arc<BackendRegistry>,
    stats: Arc<GatewayStats>,
}

impl AuthState {
    /// Build the gate state from static config plus the live store and
    /// registry
    #[must_use]
    pub fn new(
        config: &AuthConfig,
        store: Arc<JsonFileStore>,
        registry: Arc<BackendRegistry>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            public_paths: config
                .public_paths
                .iter()
                .map(|p| PathPattern::parse(p))
                .collect(),
            rules: PermissionRules::new(),
            store,
            registry,
            stats,
        }
    }

    /// Whether the gate is enforcing credentials at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The credential header name from the live security configuration
    #[must_use]
    pub fn header_name(&self) -> String {
        self.store.snapshot().security.header_name.clone()
    }

    /// Match a presented credential against usable keys
    #[must_use]
    pub fn verify(&self, presented: &str) -> Option<AuthenticatedClient> {
        let document = self.store.snapshot();
        document
            .security
            .verify(presented)
            .map(|key| AuthenticatedClient {
                name: key.name.clone(),
                permission: key.permission,
            })
    }

    fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p.matches(path))
    }

    /// Per-backend override: `/proto/{name}` and `/stream/{name}` requests
    /// bypass the gate when the live descriptor opts out of auth. Unknown
    /// names never bypass.
    fn backend_is_public(&self, path: &str) -> bool {
        let rest = path
            .strip_prefix("/proto/")
            .or_else(|| path.strip_prefix("/stream/"));
        let Some(rest) = rest else {
            return false;
        };
        let name = rest.split('/').next().unwrap_or_default();
        !name.is_empty()
            && self
                .registry
                .get(name)
                .is_some_and(|descriptor| !descriptor.require_auth())
    }
}

/// Gate middleware, installed with `middleware::from_fn_with_state`
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        request
            .extensions_mut()
            .insert(AuthenticatedClient::anonymous());
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();

    if auth.is_public_path(&path) || auth.backend_is_public(&path) {
        debug!(path = %path, "Public path, skipping auth");
        request
            .extensions_mut()
            .insert(AuthenticatedClient::public());
        return next.run(request).await;
    }

    let header_name = auth.header_name();
    let presented = request
        .headers()
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok());

    let Some(presented) = presented else {
        warn!(path = %path, "Missing credential header");
        auth.stats.record_auth_failure();
        return unauthorized_response(&header_name, "Missing credential");
    };

    let Some(client) = auth.verify(presented) else {
        warn!(path = %path, "Credential rejected");
        auth.stats.record_auth_failure();
        return unauthorized_response(&header_name, "Invalid credential");
    };

    let required = auth.rules.required(request.method(), &path);
    if !client.permission.satisfies(required) {
        warn!(
            client = %client.name,
            path = %path,
            required = %required,
            "Insufficient permission"
        );
        auth.stats.record_auth_failure();
        return forbidden_response();
    }

    debug!(client = %client.name, path = %path, "Authenticated request");
    request.extensions_mut().insert(client);
    next.run(request).await
}

fn unauthorized_response(header_name: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, header_name.to_string())],
        Json(json!({ "error": message })),
    )
        .into_response()
}

fn forbidden_response() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "Insufficient permission" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::registry::BackendDescriptor;
    use crate::runtime::BackendDeclaration;

    fn decl(value: serde_json::Value) -> BackendDeclaration {
        serde_json::from_value(value).unwrap()
    }

    fn state_with_store(document: serde_json::Value) -> (TempDir, AuthState) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");
        std::fs::write(&path, document.to_string()).unwrap();
        let store = Arc::new(JsonFileStore::open(&path).unwrap());
        let state = AuthState::new(
            &AuthConfig::default(),
            store,
            Arc::new(BackendRegistry::new()),
            Arc::new(GatewayStats::new()),
        );
        (dir, state)
    }

    // =====================================================================
    // Path patterns
    // =====================================================================

    #[test]
    fn trailing_slash_matches_as_prefix() {
        let pattern = PathPattern::parse("/ui/");
        assert!(pattern.matches("/ui/"));
        assert!(pattern.matches("/ui/index.html"));
        assert!(!pattern.matches("/ui"));
    }

    #[test]
    fn bare_root_matches_exactly() {
        let pattern = PathPattern::parse("/");
        assert!(pattern.matches("/"));
        assert!(!pattern.matches("/gateway/backends"));
    }

    #[test]
    fn plain_pattern_matches_exactly() {
        let pattern = PathPattern::parse("/health");
        assert!(pattern.matches("/health"));
        assert!(!pattern.matches("/health/deep"));
        assert!(!pattern.matches("/healthz"));
    }

    #[test]
    fn default_allowlist_covers_the_public_routes() {
        let (_dir, state) = state_with_store(json!({}));
        for path in [
            "/",
            "/health",
            "/gateway/auth/verify",
            "/gateway/auth/config",
            "/gateway/auth/first-run-keys",
            "/ui/app.js",
            "/static/logo.svg",
        ] {
            assert!(state.is_public_path(path), "{path}");
        }
        for path in ["/gateway/backends", "/gateway/auth/info", "/proto/files"] {
            assert!(!state.is_public_path(path), "{path}");
        }
    }

    // =====================================================================
    // Permission rules
    // =====================================================================

    #[test]
    fn lifecycle_actions_require_write() {
        let rules = PermissionRules::new();
        for action in ["start", "stop", "restart"] {
            assert_eq!(
                rules.required(&Method::POST, &format!("/gateway/backends/files/{action}")),
                Permission::Write,
                "{action}"
            );
        }
    }

    #[test]
    fn reads_and_forwarding_require_read() {
        let rules = PermissionRules::new();
        assert_eq!(
            rules.required(&Method::GET, "/gateway/backends/files/health"),
            Permission::Read
        );
        assert_eq!(
            rules.required(&Method::POST, "/proto/files/tools/list"),
            Permission::Read
        );
        assert_eq!(rules.required(&Method::GET, "/stream/files"), Permission::Read);
        assert_eq!(rules.required(&Method::GET, "/gateway/backends"), Permission::Read);
        assert_eq!(rules.required(&Method::HEAD, "/gateway/stats"), Permission::Read);
    }

    #[test]
    fn mutating_methods_fall_back_to_write() {
        let rules = PermissionRules::new();
        assert_eq!(rules.required(&Method::POST, "/gateway/backends"), Permission::Write);
        assert_eq!(
            rules.required(&Method::DELETE, "/gateway/backends/files"),
            Permission::Write
        );
    }

    // =====================================================================
    // Credential verification
    // =====================================================================

    #[test]
    fn verify_resolves_identity_from_the_store() {
        let (_dir, state) = state_with_store(json!({
            "security": {
                "header_name": "Gangway-Key",
                "api_keys": [
                    { "key": "writer-key-1", "name": "Deploy", "permission": "write" },
                    { "key": "reader-key-1", "name": "Monitor", "permission": "read",
                      "enabled": false },
                ]
            }
        }));

        let client = state.verify("writer-key-1").unwrap();
        assert_eq!(client.name, "Deploy");
        assert_eq!(client.permission, Permission::Write);

        // Disabled and unknown keys resolve to nothing
        assert!(state.verify("reader-key-1").is_none());
        assert!(state.verify("no-such-key").is_none());
    }

    #[test]
    fn header_name_tracks_the_store() {
        let (_dir, state) = state_with_store(json!({
            "security": { "header_name": "X-Gangway-Token", "api_keys": [] }
        }));
        assert_eq!(state.header_name(), "X-Gangway-Token");
    }

    // =====================================================================
    // Per-backend override
    // =====================================================================

    #[test]
    fn opted_out_backend_bypasses_the_gate() {
        let (_dir, state) = state_with_store(json!({}));
        state.registry.insert(BackendDescriptor::new(
            "open",
            decl(json!({
                "type": "streamable-http",
                "url": "http://localhost:9001/rpc",
                "require_auth": false
            })),
        ));
        state.registry.insert(BackendDescriptor::new(
            "gated",
            decl(json!({ "type": "streamable-http", "url": "http://localhost:9002/rpc" })),
        ));

        assert!(state.backend_is_public("/proto/open"));
        assert!(state.backend_is_public("/stream/open/events"));
        assert!(!state.backend_is_public("/proto/gated"));
        assert!(!state.backend_is_public("/proto/unknown"));
        assert!(!state.backend_is_public("/gateway/backends"));
        assert!(!state.backend_is_public("/proto/"));
    }
}
