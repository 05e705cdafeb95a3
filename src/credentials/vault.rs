//! HTTP client for a Vault-compatible KV v2 secret service.
//!
//! Wire protocol:
//! - read:   `GET    {addr}/v1/{mount}/data/{path}` → `data.data`
//! - write:  `POST   {addr}/v1/{mount}/data/{path}` with `{"data": {...}}`
//! - delete: `DELETE {addr}/v1/{mount}/metadata/{path}` (all versions)
//! - login:  `POST   {addr}/v1/auth/{approle_mount}/login` → `auth.client_token`
//!
//! The session token travels in `X-Vault-Token`. A 401/403 on any operation
//! triggers exactly one re-authentication and one retry.

use super::backend::{BackendError, SecretBackend};
use super::session::{AuthAttempt, VaultAuth, VaultSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Role login response (only the fields we use)
#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: i64,
}

/// KV v2 read response. `data.data` is null for soft-deleted versions.
#[derive(Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    #[serde(default)]
    data: Option<Value>,
}

/// Secret backend talking to a remote Vault-compatible service.
///
/// The session token is shared by all operations on this client. It is read
/// under a shared lock and replaced under an exclusive one; renewal is
/// idempotent, so two operations racing to renew end up with one login.
pub struct VaultBackend {
    client: reqwest::Client,
    address: String,
    mount: String,
    namespace: Option<String>,
    auth: VaultAuth,
    session: RwLock<Option<VaultSession>>,
}

impl VaultBackend {
    /// Creates a client. No network traffic happens until the first operation.
    pub fn new(
        address: &str,
        mount: &str,
        namespace: Option<String>,
        auth: VaultAuth,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build secret service HTTP client")?;

        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            namespace,
            auth,
            session: RwLock::new(None),
        })
    }

    #[cfg(test)]
    fn with_cached_session(mut self, session: VaultSession) -> Self {
        self.session = RwLock::new(Some(session));
        self
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/v1/{}/data/{}", self.address, self.mount, path)
    }

    fn metadata_url(&self, path: &str) -> String {
        format!("{}/v1/{}/metadata/{}", self.address, self.mount, path)
    }

    fn request(&self, method: Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url).header(TOKEN_HEADER, token);
        match &self.namespace {
            Some(namespace) => builder.header(NAMESPACE_HEADER, namespace),
            None => builder,
        }
    }

    /// Returns a usable session token, logging in if there is none or the
    /// cached one has expired.
    async fn session_token(&self) -> Result<String, BackendError> {
        {
            let guard = self.session.read().await;
            if let Some(session) = guard.as_ref() {
                if session.is_fresh(Utc::now()) {
                    return Ok(session.token.clone());
                }
            }
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.is_fresh(Utc::now()) {
                return Ok(session.token.clone());
            }
        }

        debug!(method = self.auth.method(), "Secret service session missing or expired");
        let session = self.login().await?;
        let token = session.token.clone();
        *guard = Some(session);
        Ok(token)
    }

    /// Replaces a session token the service just rejected.
    async fn reauthenticate(&self, rejected: &str) -> Result<String, BackendError> {
        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref() {
            if session.token != rejected && session.is_fresh(Utc::now()) {
                // Already renewed by a concurrent operation
                return Ok(session.token.clone());
            }
        }

        let session = self.login().await?;
        let token = session.token.clone();
        *guard = Some(session);
        Ok(token)
    }

    async fn login(&self) -> Result<VaultSession, BackendError> {
        let (mount, role_id, secret_id) = match &self.auth {
            VaultAuth::Token(token) => return Ok(VaultSession::leased(token.clone(), 0, Utc::now())),
            VaultAuth::AppRole {
                mount,
                role_id,
                secret_id,
            } => (mount, role_id, secret_id),
        };

        let url = format!("{}/v1/auth/{}/login", self.address, mount.trim_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }));
        if let Some(namespace) = &self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }

        let response = request.send().await.map_err(transport_error)?;
        match response.status() {
            s if s.is_success() => {}
            // Vault answers a bad role/secret pair with 400
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(status = %response.status(), "Secret service rejected role login");
                return Err(BackendError::PermissionDenied);
            }
            s => check_status(s)?,
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("Failed to parse login response: {}", e)))?;

        info!(
            method = "approle",
            lease_secs = body.auth.lease_duration,
            "Secret service session established"
        );

        Ok(VaultSession::leased(
            body.auth.client_token,
            body.auth.lease_duration,
            Utc::now(),
        ))
    }

    /// Runs `op` with the current session token, re-authenticating at most
    /// once if the service answers permission-denied.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut attempt = AuthAttempt::FirstTry;
        let mut token = self.session_token().await?;

        loop {
            match op(token.clone()).await {
                Err(BackendError::PermissionDenied) => match attempt {
                    AuthAttempt::FirstTry => {
                        warn!("Secret service rejected session token, re-authenticating");
                        token = self.reauthenticate(&token).await?;
                        attempt = AuthAttempt::RetriedOnce;
                    }
                    AuthAttempt::RetriedOnce => return Err(BackendError::PermissionDenied),
                },
                result => return result,
            }
        }
    }

    async fn read_once(&self, url: &str, token: String) -> Result<Option<Value>, BackendError> {
        let response = self
            .request(Method::GET, url, &token)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response.status())?;

        let body: KvReadResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Other(format!("Failed to parse read response: {}", e)))?;

        Ok(body.data.data)
    }

    async fn write_once(&self, url: &str, token: String, document: &Value) -> Result<(), BackendError> {
        let response = self
            .request(Method::POST, url, &token)
            .json(&json!({ "data": document }))
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response.status())
    }

    async fn delete_once(&self, url: &str, token: String) -> Result<bool, BackendError> {
        let response = self
            .request(Method::DELETE, url, &token)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response.status())?;
        Ok(true)
    }
}

#[async_trait]
impl SecretBackend for VaultBackend {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, BackendError> {
        debug!(path = %path, "Reading secret");
        let url = self.data_url(path);
        self.with_session(|token| self.read_once(&url, token)).await
    }

    async fn write(&self, path: &str, document: &Value) -> Result<(), BackendError> {
        debug!(path = %path, "Writing secret");
        let url = self.data_url(path);
        self.with_session(|token| self.write_once(&url, token, document))
            .await
    }

    async fn delete(&self, path: &str) -> Result<bool, BackendError> {
        debug!(path = %path, "Deleting secret");
        let url = self.metadata_url(path);
        self.with_session(|token| self.delete_once(&url, token)).await
    }
}

fn check_status(status: StatusCode) -> Result<(), BackendError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BackendError::PermissionDenied),
        s if s.is_server_error() => Err(BackendError::Unavailable(format!("status {}", s))),
        s => Err(BackendError::Other(format!("unexpected status {}", s))),
    }
}

fn transport_error(error: reqwest::Error) -> BackendError {
    BackendError::Unavailable(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use mockito::{Matcher, Server};

    const SECRET_PATH: &str = "fitlink/users/alice/garmin";

    fn token_backend(url: &str, token: &str) -> VaultBackend {
        VaultBackend::new(
            url,
            "secret",
            None,
            VaultAuth::Token(token.to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn approle_backend(url: &str) -> VaultBackend {
        VaultBackend::new(
            url,
            "secret",
            None,
            VaultAuth::AppRole {
                mount: "approle".to_string(),
                role_id: "role-123".to_string(),
                secret_id: "secret-456".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn session(token: &str, expires_in_secs: i64) -> VaultSession {
        VaultSession {
            token: token.to_string(),
            lease_expiry: Some(Utc::now() + ChronoDuration::seconds(expires_in_secs)),
        }
    }

    fn credential_doc() -> Value {
        json!({ "username": "alice", "password": "pw1" })
    }

    #[tokio::test]
    async fn test_read_returns_document() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "root")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": {"data": {"username": "alice", "password": "pw1"},
                             "metadata": {"version": 3}}}"#,
            )
            .create_async()
            .await;

        let backend = token_backend(&server.url(), "root");
        let doc = backend.read(SECRET_PATH).await.unwrap().unwrap();
        assert_eq!(doc, credential_doc());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .with_status(404)
            .with_body(r#"{"errors": []}"#)
            .create_async()
            .await;

        let backend = token_backend(&server.url(), "root");
        assert!(backend.read(SECRET_PATH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_approle_login_is_cached_across_operations() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .match_body(Matcher::Json(
                json!({ "role_id": "role-123", "secret_id": "secret-456" }),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"auth": {"client_token": "fresh", "lease_duration": 3600}}"#)
            .expect(1)
            .create_async()
            .await;
        let write = server
            .mock("POST", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "fresh")
            .match_body(Matcher::Json(json!({ "data": credential_doc() })))
            .with_status(200)
            .with_body(r#"{"data": {"version": 1}}"#)
            .expect(2)
            .create_async()
            .await;

        let backend = approle_backend(&server.url());
        backend.write(SECRET_PATH, &credential_doc()).await.unwrap();
        backend.write(SECRET_PATH, &credential_doc()).await.unwrap();

        login.assert_async().await;
        write.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_session_reauthenticates_once() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"auth": {"client_token": "fresh", "lease_duration": 3600}}"#)
            .expect(1)
            .create_async()
            .await;
        let stale_write = server
            .mock("POST", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "stale")
            .with_status(403)
            .expect(0)
            .create_async()
            .await;
        let fresh_write = server
            .mock("POST", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "fresh")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let backend = approle_backend(&server.url()).with_cached_session(session("stale", -60));
        backend.write(SECRET_PATH, &credential_doc()).await.unwrap();

        login.assert_async().await;
        stale_write.assert_async().await;
        fresh_write.assert_async().await;
    }

    #[tokio::test]
    async fn test_permission_denied_retries_once_after_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"auth": {"client_token": "fresh", "lease_duration": 3600}}"#)
            .expect(1)
            .create_async()
            .await;
        let denied = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "revoked")
            .with_status(403)
            .with_body(r#"{"errors": ["permission denied"]}"#)
            .expect(1)
            .create_async()
            .await;
        let allowed = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"data": {"username": "alice", "password": "pw1"}}}"#)
            .expect(1)
            .create_async()
            .await;

        let backend = approle_backend(&server.url()).with_cached_session(session("revoked", 3600));
        let doc = backend.read(SECRET_PATH).await.unwrap();
        assert_eq!(doc, Some(credential_doc()));

        login.assert_async().await;
        denied.assert_async().await;
        allowed.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_denials_share_one_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"auth": {"client_token": "fresh", "lease_duration": 3600}}"#)
            .expect(1)
            .create_async()
            .await;
        let denied = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "revoked")
            .with_status(403)
            .expect(2)
            .create_async()
            .await;
        let allowed = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": {"data": {"username": "alice", "password": "pw1"}}}"#)
            .expect(2)
            .create_async()
            .await;

        let backend = approle_backend(&server.url()).with_cached_session(session("revoked", 3600));
        let (first, second) = tokio::join!(backend.read(SECRET_PATH), backend.read(SECRET_PATH));
        assert_eq!(first.unwrap(), Some(credential_doc()));
        assert_eq!(second.unwrap(), Some(credential_doc()));

        login.assert_async().await;
        denied.assert_async().await;
        allowed.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_denial_surfaces_as_permission_denied() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"auth": {"client_token": "fresh", "lease_duration": 3600}}"#)
            .expect(1)
            .create_async()
            .await;
        let denied = server
            .mock("DELETE", "/v1/secret/metadata/fitlink/users/alice/garmin")
            .with_status(403)
            .expect(2)
            .create_async()
            .await;

        let backend = approle_backend(&server.url()).with_cached_session(session("revoked", 3600));
        let err = backend.delete(SECRET_PATH).await.unwrap_err();
        assert!(matches!(err, BackendError::PermissionDenied));

        login.assert_async().await;
        denied.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_role_login_is_permission_denied() {
        let mut server = Server::new_async().await;
        let _login = server
            .mock("POST", "/v1/auth/approle/login")
            .with_status(400)
            .with_body(r#"{"errors": ["invalid role or secret ID"]}"#)
            .create_async()
            .await;

        let backend = approle_backend(&server.url());
        let err = backend.read(SECRET_PATH).await.unwrap_err();
        assert!(matches!(err, BackendError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_delete_targets_metadata() {
        let mut server = Server::new_async().await;
        let deleted = server
            .mock("DELETE", "/v1/secret/metadata/fitlink/users/alice/garmin")
            .match_header("x-vault-token", "root")
            .with_status(204)
            .create_async()
            .await;
        let _missing = server
            .mock("DELETE", "/v1/secret/metadata/fitlink/users/bob/garmin")
            .with_status(404)
            .create_async()
            .await;

        let backend = token_backend(&server.url(), "root");
        assert!(backend.delete(SECRET_PATH).await.unwrap());
        assert!(!backend.delete("fitlink/users/bob/garmin").await.unwrap());

        deleted.assert_async().await;
    }

    #[tokio::test]
    async fn test_namespace_header_is_sent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .match_header("x-vault-namespace", "team-a")
            .with_status(404)
            .create_async()
            .await;

        let backend = VaultBackend::new(
            &server.url(),
            "secret",
            Some("team-a".to_string()),
            VaultAuth::Token("root".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(backend.read(SECRET_PATH).await.unwrap().is_none());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/secret/data/fitlink/users/alice/garmin")
            .with_status(503)
            .with_body(r#"{"errors": ["Vault is sealed"]}"#)
            .create_async()
            .await;

        let backend = token_backend(&server.url(), "root");
        let err = backend.read(SECRET_PATH).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        // Nothing listens on port 1
        let backend = token_backend("http://127.0.0.1:1", "root");
        let err = backend.read(SECRET_PATH).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
