//! Persistent gateway configuration
//!
//! One JSON document on disk holds the declared backends and the security
//! state (credential header name plus API keys). Reads are served from an
//! in-memory snapshot behind a swap-on-write `Arc`; every mutation rewrites
//! the whole file under the write lock, so the snapshot never disagrees with
//! what a successful write left on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime::BackendDeclaration;
use crate::{Error, Result};

/// Header clients present their API key in, unless the store says otherwise
pub const DEFAULT_HEADER_NAME: &str = "Gangway-Key";

/// Shortest credential value a stored key may carry
pub const MIN_KEY_LEN: usize = 8;

/// Generated default keys are this long
const GENERATED_KEY_LEN: usize = 32;

// ============================================================================
// Security state
// ============================================================================

/// Access level granted by an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Status reads and request forwarding
    Read,
    /// Read plus mutating management operations
    Write,
}

impl Permission {
    /// Whether this level satisfies a required level (write covers read)
    #[must_use]
    pub fn satisfies(self, required: Permission) -> bool {
        match required {
            Permission::Read => true,
            Permission::Write => self == Permission::Write,
        }
    }

    /// Lowercase name, as serialized
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One API key record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// The credential value clients present (at least 8 characters)
    pub key: String,
    /// Human-readable label
    pub name: String,
    /// Access level
    pub permission: Permission,
    /// Disabled keys are rejected without deleting the record
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Returns `true` if the key has passed its expiry time
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() >= exp)
    }

    /// Enabled and not expired
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.is_expired()
    }
}

/// Security section of the store document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// HTTP header clients present their key in
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// All known keys
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

impl SecurityConfig {
    /// Match a presented credential against enabled, unexpired keys
    #[must_use]
    pub fn verify(&self, presented: &str) -> Option<&ApiKey> {
        self.api_keys
            .iter()
            .find(|k| k.key == presented && k.is_usable())
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            api_keys: Vec::new(),
        }
    }
}

fn default_header_name() -> String {
    DEFAULT_HEADER_NAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Validate one stored key record: the credential value must be at least
/// [`MIN_KEY_LEN`] characters and the label non-empty. A store carrying a
/// weaker record refuses to open rather than silently accepting the key.
///
/// # Errors
///
/// Returns an error when the key is too short or unlabeled.
pub fn validate_api_key(key: &ApiKey) -> Result<()> {
    if key.name.is_empty() {
        return Err(Error::Config(
            "API key records need a non-empty name".to_string(),
        ));
    }
    if key.key.len() < MIN_KEY_LEN {
        return Err(Error::Config(format!(
            "API key '{}' is too short (minimum {MIN_KEY_LEN} characters)",
            key.name
        )));
    }
    Ok(())
}

/// Validate a credential header name (letters, digits, `-` and `_` only)
///
/// # Errors
///
/// Returns an error when the name is empty or contains other characters.
pub fn validate_header_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid credential header name: '{name}'"
        )))
    }
}

// ============================================================================
// Store document and contract
// ============================================================================

/// The on-disk document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    /// Declared backends by name
    #[serde(default)]
    pub backends: BTreeMap<String, BackendDeclaration>,
    /// Credential configuration
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Persistence contract for backend declarations
///
/// The gateway holds exactly one store. Failures surface as errors and are
/// not retried.
pub trait ConfigStore: Send + Sync + 'static {
    /// All persisted declarations, keyed by backend name
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read.
    fn load_all(&self) -> Result<BTreeMap<String, BackendDeclaration>>;

    /// Persist a declaration under a name, overwriting any previous one
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be written.
    fn save(&self, name: &str, declaration: &BackendDeclaration) -> Result<()>;

    /// Remove a persisted declaration; removing an absent name is not an error
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be written.
    fn remove(&self, name: &str) -> Result<()>;

    /// Replace the declaration for a name that is already persisted
    ///
    /// # Errors
    ///
    /// Returns an error when the name is absent or the store cannot be
    /// written.
    fn replace(&self, name: &str, declaration: &BackendDeclaration) -> Result<()>;
}

// ============================================================================
// JSON file store
// ============================================================================

/// Single-file JSON store; the whole document is rewritten on every mutation
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    document: RwLock<Arc<StoreDocument>>,
    first_run_keys: Mutex<Option<Vec<ApiKey>>>,
}

impl JsonFileStore {
    /// Open the document at `path`, creating an empty one when missing
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed,
    /// when a new file cannot be written, or when the stored credential
    /// header name or an API key record is invalid.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                Error::Store(format!("Failed to read {}: {e}", path.display()))
            })?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Store(format!("Failed to parse {}: {e}", path.display()))
            })?
        } else {
            let document = StoreDocument::default();
            Self::persist(&path, &document)?;
            info!(path = %path.display(), "Created empty gateway store");
            document
        };

        validate_header_name(&document.security.header_name)?;
        for key in &document.security.api_keys {
            validate_api_key(key)?;
        }

        Ok(Self {
            path,
            document: RwLock::new(Arc::new(document)),
            first_run_keys: Mutex::new(None),
        })
    }

    /// Cheap snapshot of the current document
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreDocument> {
        Arc::clone(&self.document.read())
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generate a random alphanumeric API key
    #[must_use]
    pub fn generate_key() -> String {
        Alphanumeric.sample_string(&mut rand::rng(), GENERATED_KEY_LEN)
    }

    /// Create the default admin and read keys when no keys exist yet.
    ///
    /// Returns `true` when keys were generated. The generated keys are
    /// stashed for a single retrieval via
    /// [`JsonFileStore::take_first_run_keys`].
    ///
    /// # Errors
    ///
    /// Returns an error when the new keys cannot be persisted.
    pub fn ensure_default_keys(&self) -> Result<bool> {
        let mut guard = self.document.write();
        if !guard.security.api_keys.is_empty() {
            return Ok(false);
        }

        let now = Utc::now();
        let admin = ApiKey {
            key: Self::generate_key(),
            name: "Default Admin Key".to_string(),
            permission: Permission::Write,
            enabled: true,
            created_at: Some(now),
            expires_at: None,
        };
        let read = ApiKey {
            key: Self::generate_key(),
            name: "Default Read Key".to_string(),
            permission: Permission::Read,
            enabled: true,
            created_at: Some(now),
            expires_at: None,
        };

        let mut next = (**guard).clone();
        next.security.api_keys.push(admin.clone());
        next.security.api_keys.push(read.clone());
        Self::persist(&self.path, &next)?;
        *guard = Arc::new(next);
        drop(guard);

        *self.first_run_keys.lock() = Some(vec![admin, read]);
        warn!(
            path = %self.path.display(),
            "No API keys configured; generated default keys (retrieve once via /gateway/auth/first-run-keys)"
        );
        Ok(true)
    }

    /// One-shot retrieval of the keys generated at first run
    pub fn take_first_run_keys(&self) -> Option<Vec<ApiKey>> {
        self.first_run_keys.lock().take()
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreDocument) -> Result<()>,
    {
        let mut guard = self.document.write();
        let mut next = (**guard).clone();
        f(&mut next)?;
        Self::persist(&self.path, &next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn persist(path: &Path, document: &StoreDocument) -> Result<()> {
        let content = serde_json::to_string_pretty(document)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Store(format!(
                        "Failed to create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        fs::write(path, content)
            .map_err(|e| Error::Store(format!("Failed to write {}: {e}", path.display())))
    }
}

impl ConfigStore for JsonFileStore {
    fn load_all(&self) -> Result<BTreeMap<String, BackendDeclaration>> {
        Ok(self.document.read().backends.clone())
    }

    fn save(&self, name: &str, declaration: &BackendDeclaration) -> Result<()> {
        self.mutate(|doc| {
            doc.backends.insert(name.to_string(), declaration.clone());
            Ok(())
        })
    }

    fn remove(&self, name: &str) -> Result<()> {
        if !self.document.read().backends.contains_key(name) {
            return Ok(());
        }
        self.mutate(|doc| {
            doc.backends.remove(name);
            Ok(())
        })
    }

    fn replace(&self, name: &str, declaration: &BackendDeclaration) -> Result<()> {
        self.mutate(|doc| match doc.backends.get_mut(name) {
            Some(slot) => {
                *slot = declaration.clone();
                Ok(())
            }
            None => Err(Error::NotFound(name.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn decl(url: &str) -> BackendDeclaration {
        serde_json::from_value(json!({ "type": "streamable-http", "url": url })).unwrap()
    }

    fn make_key(key: &str, permission: Permission) -> ApiKey {
        ApiKey {
            key: key.to_string(),
            name: "test".to_string(),
            permission,
            enabled: true,
            created_at: Some(Utc::now()),
            expires_at: None,
        }
    }

    #[test]
    fn open_creates_empty_store() {
        // GIVEN: a path with no file behind it
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");

        // WHEN: we open the store
        let store = JsonFileStore::open(&path).unwrap();

        // THEN: the file exists and the document is empty with defaults
        assert!(path.exists());
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.snapshot().security.header_name, DEFAULT_HEADER_NAME);
    }

    #[test]
    fn save_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.save("echo", &decl("http://localhost:9001/")).unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let backends = store.load_all().unwrap();
        assert_eq!(backends.len(), 1);
        assert!(backends.contains_key("echo"));
        assert_eq!(backends["echo"].kind(), "streamable-http");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("gangway.json")).unwrap();

        // Removing an absent name is fine
        store.remove("ghost").unwrap();

        store.save("echo", &decl("http://localhost:9001/")).unwrap();
        store.remove("echo").unwrap();
        assert!(store.load_all().unwrap().is_empty());
        store.remove("echo").unwrap();
    }

    #[test]
    fn replace_requires_existing_name() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("gangway.json")).unwrap();

        let err = store
            .replace("ghost", &decl("http://localhost:9001/"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        store.save("echo", &decl("http://localhost:9001/")).unwrap();
        store
            .replace("echo", &decl("http://localhost:9002/"))
            .unwrap();

        let backends = store.load_all().unwrap();
        let value = serde_json::to_value(&backends["echo"]).unwrap();
        assert_eq!(value["url"], "http://localhost:9002/");
    }

    #[test]
    fn corrupt_file_fails_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");
        fs::write(&path, "{not json").unwrap();

        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn weak_key_records_fail_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");

        // A hand-edited store with a 3-char key must not load, let alone
        // authenticate
        fs::write(
            &path,
            json!({
                "security": {
                    "api_keys": [{ "key": "abc", "name": "tiny", "permission": "write" }]
                }
            })
            .to_string(),
        )
        .unwrap();
        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("too short"), "{err}");

        // An unlabeled record is rejected too
        fs::write(
            &path,
            json!({
                "security": {
                    "api_keys": [{ "key": "long-enough-key", "name": "", "permission": "read" }]
                }
            })
            .to_string(),
        )
        .unwrap();
        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("name"), "{err}");

        // Exactly the minimum length is accepted
        fs::write(
            &path,
            json!({
                "security": {
                    "api_keys": [{ "key": "12345678", "name": "ops", "permission": "read" }]
                }
            })
            .to_string(),
        )
        .unwrap();
        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.snapshot().security.verify("12345678").is_some());
    }

    #[test]
    fn ensure_default_keys_generates_once() {
        // GIVEN: a fresh store with no keys
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gangway.json");
        let store = JsonFileStore::open(&path).unwrap();

        // WHEN: we ensure default keys
        let generated = store.ensure_default_keys().unwrap();

        // THEN: an admin and a read key exist, persisted to disk
        assert!(generated);
        let keys = &store.snapshot().security.api_keys;
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].name, "Default Admin Key");
        assert_eq!(keys[0].permission, Permission::Write);
        assert_eq!(keys[1].name, "Default Read Key");
        assert_eq!(keys[1].permission, Permission::Read);
        assert!(keys.iter().all(|k| k.key.len() == 32));

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot().security.api_keys.len(), 2);

        // AND: a second call does nothing
        assert!(!store.ensure_default_keys().unwrap());
        assert_eq!(store.snapshot().security.api_keys.len(), 2);
    }

    #[test]
    fn first_run_keys_are_taken_once() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("gangway.json")).unwrap();

        // Nothing stashed before generation
        assert!(store.take_first_run_keys().is_none());

        store.ensure_default_keys().unwrap();
        let keys = store.take_first_run_keys().unwrap();
        assert_eq!(keys.len(), 2);

        // Second retrieval is empty
        assert!(store.take_first_run_keys().is_none());
    }

    #[test]
    fn verify_matches_usable_keys_only() {
        let mut security = SecurityConfig::default();
        security.api_keys.push(make_key("valid-key-1", Permission::Read));

        let mut disabled = make_key("disabled-key", Permission::Write);
        disabled.enabled = false;
        security.api_keys.push(disabled);

        let mut expired = make_key("expired-key", Permission::Write);
        expired.expires_at = Some(Utc::now() - Duration::hours(1));
        security.api_keys.push(expired);

        assert!(security.verify("valid-key-1").is_some());
        assert!(security.verify("disabled-key").is_none());
        assert!(security.verify("expired-key").is_none());
        assert!(security.verify("unknown-key").is_none());
    }

    #[test]
    fn key_expiry() {
        let mut key = make_key("some-key-1", Permission::Read);
        assert!(!key.is_expired());
        assert!(key.is_usable());

        key.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!key.is_expired());

        key.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(key.is_expired());
        assert!(!key.is_usable());
    }

    #[test]
    fn write_permission_satisfies_read() {
        assert!(Permission::Write.satisfies(Permission::Read));
        assert!(Permission::Write.satisfies(Permission::Write));
        assert!(Permission::Read.satisfies(Permission::Read));
        assert!(!Permission::Read.satisfies(Permission::Write));
    }

    #[test]
    fn header_name_validation() {
        validate_header_name("Gangway-Key").unwrap();
        validate_header_name("X-Api_Key2").unwrap();

        assert!(validate_header_name("").is_err());
        assert!(validate_header_name("Bad Header").is_err());
        assert!(validate_header_name("X:Key").is_err());
    }

    #[test]
    fn api_key_validation() {
        validate_api_key(&make_key("12345678", Permission::Read)).unwrap();

        assert!(validate_api_key(&make_key("abc", Permission::Write)).is_err());
        assert!(validate_api_key(&make_key("1234567", Permission::Read)).is_err());

        let mut unnamed = make_key("long-enough-key", Permission::Read);
        unnamed.name = String::new();
        assert!(validate_api_key(&unnamed).is_err());
    }

    #[test]
    fn generated_keys_are_alphanumeric() {
        let key = JsonFileStore::generate_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, JsonFileStore::generate_key());
    }

    #[test]
    fn document_parses_with_missing_sections() {
        // Hand-written files may omit the security block entirely
        let document: StoreDocument = serde_json::from_str("{}").unwrap();
        assert!(document.backends.is_empty());
        assert_eq!(document.security.header_name, DEFAULT_HEADER_NAME);

        let document: StoreDocument = serde_json::from_str(
            r#"{"backends": {"echo": {"type": "stdio", "command": "echo-server"}}}"#,
        )
        .unwrap();
        assert_eq!(document.backends.len(), 1);
        assert!(document.backends["echo"].enabled);
    }
}
