//! Path-scoped document storage behind the credential store.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a [`SecretBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The service rejected the session token, after the backend's own
    /// single re-authentication attempt.
    #[error("secret service denied access")]
    PermissionDenied,

    /// The service could not be reached or is temporarily unable to serve.
    #[error("secret service unavailable: {0}")]
    Unavailable(String),

    /// Any other failure (unexpected status, undecodable payload, local I/O).
    #[error("secret service error: {0}")]
    Other(String),
}

/// A key-value secret service addressed by path.
///
/// Documents are JSON objects. Implementations own their authentication;
/// callers never see session tokens.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Short backend name used in log fields.
    fn name(&self) -> &'static str;

    /// Reads the document at `path`. `Ok(None)` when nothing is stored.
    async fn read(&self, path: &str) -> Result<Option<Value>, BackendError>;

    /// Creates or overwrites the document at `path`.
    async fn write(&self, path: &str, document: &Value) -> Result<(), BackendError>;

    /// Removes the document at `path`.
    ///
    /// Returns `Ok(false)` when the backend knows nothing was stored there.
    async fn delete(&self, path: &str) -> Result<bool, BackendError>;
}
