//! Per-user credential operations on top of a [`SecretBackend`].

use super::backend::{BackendError, SecretBackend};
use super::session::VaultAuth;
use super::{LocalBackend, StoredCredential, UserCredential, VaultBackend};
use crate::config::{SecretBackendKind, SecretsConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// A secret store failure the caller has to see.
///
/// An unconfigured or unreachable store is not an error; see [`SecretStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store kept rejecting the session after one re-authentication.
    #[error("secret store denied access after re-authentication")]
    PermissionDenied,

    /// The stored document for this user cannot be decoded.
    #[error("stored credential for user {user_id} is malformed: {reason}")]
    Malformed { user_id: String, reason: String },

    #[error("secret store error: {0}")]
    Backend(String),
}

/// Client for per-user provider credentials.
///
/// Without a backend the client is in unavailable mode: reads return `None`
/// and writes return `false`. A backend that is unreachable for one call
/// degrades that call the same way. Callers treat both exactly like "no
/// credential found".
pub struct SecretStore {
    backend: Option<Arc<dyn SecretBackend>>,
    path_prefix: String,
    provider: String,
}

impl SecretStore {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        path_prefix: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            backend: Some(backend),
            path_prefix: path_prefix.into().trim_matches('/').to_string(),
            provider: provider.into(),
        }
    }

    /// A store with no backend.
    pub fn unavailable() -> Self {
        Self {
            backend: None,
            path_prefix: String::new(),
            provider: String::new(),
        }
    }

    /// Builds the store described by `config`.
    ///
    /// Incomplete or unusable backend settings never fail startup; they are
    /// logged and the store runs in unavailable mode.
    pub fn from_config(config: &SecretsConfig) -> Self {
        let backend: Arc<dyn SecretBackend> = match config.backend {
            SecretBackendKind::None => {
                warn!("No secret backend configured, credential store unavailable");
                return Self::unavailable();
            }
            SecretBackendKind::Vault => {
                let vault = &config.vault;
                let Some(address) = vault.address.as_deref() else {
                    warn!("Vault backend selected without an address, credential store unavailable");
                    return Self::unavailable();
                };
                let auth = match (&vault.token, &vault.role_id, &vault.secret_id) {
                    (Some(token), _, _) => VaultAuth::Token(token.clone()),
                    (None, Some(role_id), Some(secret_id)) => VaultAuth::AppRole {
                        mount: vault.approle_mount.clone(),
                        role_id: role_id.clone(),
                        secret_id: secret_id.clone(),
                    },
                    _ => {
                        warn!("Vault backend has neither a token nor role credentials, credential store unavailable");
                        return Self::unavailable();
                    }
                };
                let method = auth.method();
                match VaultBackend::new(
                    address,
                    &vault.mount,
                    vault.namespace.clone(),
                    auth,
                    Duration::from_secs(vault.request_timeout_secs),
                ) {
                    Ok(backend) => {
                        info!(address = %address, mount = %vault.mount, auth = method, "Vault credential store configured");
                        Arc::new(backend)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to initialize Vault client, credential store unavailable");
                        return Self::unavailable();
                    }
                }
            }
            SecretBackendKind::Local => {
                let local = &config.local;
                let Some(key) = local.encryption_key.as_deref() else {
                    warn!("Local backend selected without an encryption key, credential store unavailable");
                    return Self::unavailable();
                };
                match LocalBackend::open(&local.db_path, key) {
                    Ok(backend) => {
                        info!(db_path = %local.db_path.display(), "Local credential store configured");
                        Arc::new(backend)
                    }
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "Failed to open local secrets database, credential store unavailable");
                        return Self::unavailable();
                    }
                }
            }
        };

        Self::new(backend, config.path_prefix.clone(), config.provider.clone())
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Path of a user's credential document.
    ///
    /// The user id is percent-encoded so it always forms exactly one path
    /// segment.
    pub fn credential_path(&self, user_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.path_prefix,
            urlencoding::encode(user_id),
            self.provider
        )
    }

    /// Creates or overwrites the credential for `credential.user_id`.
    ///
    /// Returns `Ok(false)` when the store is unavailable.
    pub async fn store_credential(&self, credential: &UserCredential) -> Result<bool, StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };

        let document = serde_json::to_value(StoredCredential {
            username: credential.external_username.clone(),
            password: credential.external_secret.clone(),
        })
        .map_err(|e| StoreError::Backend(format!("Failed to encode credential: {}", e)))?;

        let path = self.credential_path(&credential.user_id);
        match backend.write(&path, &document).await {
            Ok(()) => {
                info!(user_id = %credential.user_id, backend = backend.name(), "Stored provider credential");
                Ok(true)
            }
            Err(e) => degrade(&credential.user_id, "store", e).map(|()| false),
        }
    }

    /// Fetches the credential for `user_id`.
    ///
    /// `Ok(None)` covers both "never connected" and "store unavailable".
    pub async fn get_credential(&self, user_id: &str) -> Result<Option<UserCredential>, StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };

        let path = self.credential_path(user_id);
        let document = match backend.read(&path).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!(user_id = %user_id, "No provider credential stored");
                return Ok(None);
            }
            Err(e) => return degrade(user_id, "get", e).map(|()| None),
        };

        let stored: StoredCredential =
            serde_json::from_value(document).map_err(|e| StoreError::Malformed {
                user_id: user_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Some(UserCredential {
            user_id: user_id.to_string(),
            external_username: stored.username,
            external_secret: stored.password,
        }))
    }

    /// Removes the credential for `user_id`.
    ///
    /// Returns `Ok(false)` when nothing was removed or the store is
    /// unavailable.
    pub async fn delete_credential(&self, user_id: &str) -> Result<bool, StoreError> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };

        let path = self.credential_path(user_id);
        match backend.delete(&path).await {
            Ok(deleted) => {
                info!(user_id = %user_id, deleted, "Deleted provider credential");
                Ok(deleted)
            }
            Err(e) => degrade(user_id, "delete", e).map(|()| false),
        }
    }
}

/// Swallows availability failures, surfaces everything else.
fn degrade(user_id: &str, operation: &str, error: BackendError) -> Result<(), StoreError> {
    match error {
        BackendError::Unavailable(reason) => {
            warn!(
                user_id = %user_id,
                operation = operation,
                reason = %reason,
                "Secret store unreachable, treating as no credential"
            );
            Ok(())
        }
        BackendError::PermissionDenied => {
            error!(user_id = %user_id, operation = operation, "Secret store denied access");
            Err(StoreError::PermissionDenied)
        }
        BackendError::Other(reason) => {
            error!(user_id = %user_id, operation = operation, reason = %reason, "Secret store operation failed");
            Err(StoreError::Backend(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::{json, Value};

    fn local_store() -> SecretStore {
        let key = BASE64.encode([0u8; 32]);
        let backend = LocalBackend::open(":memory:", &key).unwrap();
        SecretStore::new(Arc::new(backend), "fitlink/users", "garmin")
    }

    /// Backend that fails every call with a fixed error kind.
    struct FailingBackend(fn() -> BackendError);

    #[async_trait]
    impl SecretBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn read(&self, _: &str) -> Result<Option<Value>, BackendError> {
            Err((self.0)())
        }
        async fn write(&self, _: &str, _: &Value) -> Result<(), BackendError> {
            Err((self.0)())
        }
        async fn delete(&self, _: &str) -> Result<bool, BackendError> {
            Err((self.0)())
        }
    }

    fn failing_store(error: fn() -> BackendError) -> SecretStore {
        SecretStore::new(Arc::new(FailingBackend(error)), "fitlink/users", "garmin")
    }

    #[tokio::test]
    async fn test_store_then_get_round_trips() {
        let store = local_store();
        let cred = UserCredential::new("user-a", "alice", "pw1");

        assert!(store.store_credential(&cred).await.unwrap());

        let found = store.get_credential("user-a").await.unwrap();
        assert_eq!(found, Some(cred));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_credential() {
        let store = local_store();
        store
            .store_credential(&UserCredential::new("user-a", "alice", "pw1"))
            .await
            .unwrap();
        store
            .store_credential(&UserCredential::new("user-a", "alice", "pw2"))
            .await
            .unwrap();

        let found = store.get_credential("user-a").await.unwrap().unwrap();
        assert_eq!(found.external_secret, "pw2");
    }

    #[tokio::test]
    async fn test_delete_then_get_is_none() {
        let store = local_store();
        store
            .store_credential(&UserCredential::new("user-a", "alice", "pw1"))
            .await
            .unwrap();

        assert!(store.delete_credential("user-a").await.unwrap());
        assert!(store.get_credential("user-a").await.unwrap().is_none());
        assert!(!store.delete_credential("user-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let store = local_store();
        store
            .store_credential(&UserCredential::new("user-a", "alice", "pw1"))
            .await
            .unwrap();

        assert!(store.get_credential("user-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades_silently() {
        let store = SecretStore::unavailable();
        assert!(!store.is_available());

        let cred = UserCredential::new("user-a", "alice", "pw1");
        assert!(!store.store_credential(&cred).await.unwrap());
        assert!(store.get_credential("user-a").await.unwrap().is_none());
        assert!(!store.delete_credential("user-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_silently() {
        let store = failing_store(|| BackendError::Unavailable("connection refused".to_string()));

        let cred = UserCredential::new("user-a", "alice", "pw1");
        assert!(!store.store_credential(&cred).await.unwrap());
        assert!(store.get_credential("user-a").await.unwrap().is_none());
        assert!(!store.delete_credential("user-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_as_store_failure() {
        let store = failing_store(|| BackendError::PermissionDenied);

        let err = store.get_credential("user-a").await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_malformed_document_is_reported() {
        let key = BASE64.encode([0u8; 32]);
        let backend = Arc::new(LocalBackend::open(":memory:", &key).unwrap());
        let store = SecretStore::new(backend.clone(), "fitlink/users", "garmin");

        backend
            .write(&store.credential_path("user-a"), &json!({ "token": 1 }))
            .await
            .unwrap();

        let err = store.get_credential("user-a").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn test_credential_path_encodes_user_id() {
        let store = local_store();
        assert_eq!(store.credential_path("user-a"), "fitlink/users/user-a/garmin");
        assert_eq!(
            store.credential_path("../admin"),
            "fitlink/users/..%2Fadmin/garmin"
        );
    }

    #[test]
    fn test_from_config_without_backend_is_unavailable() {
        let store = SecretStore::from_config(&SecretsConfig::default());
        assert!(!store.is_available());

        let mut config = SecretsConfig {
            backend: SecretBackendKind::Vault,
            ..SecretsConfig::default()
        };
        // Address but no auth
        config.vault.address = Some("http://127.0.0.1:8200".to_string());
        assert!(!SecretStore::from_config(&config).is_available());

        config.vault.token = Some("root".to_string());
        assert!(SecretStore::from_config(&config).is_available());
    }

    #[test]
    fn test_from_config_local_backend() {
        let mut config = SecretsConfig {
            backend: SecretBackendKind::Local,
            ..SecretsConfig::default()
        };
        config.local.db_path = ":memory:".into();
        assert!(!SecretStore::from_config(&config).is_available());

        config.local.encryption_key = Some(BASE64.encode([0u8; 32]));
        assert!(SecretStore::from_config(&config).is_available());
    }
}
