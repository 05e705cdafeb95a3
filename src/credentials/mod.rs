//! Durable, encrypted storage of per-user provider credentials.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecretStore                        │
//! │  - store / get / delete per user         │
//! │  - degrades to "no credential" when the  │
//! │    backend is unconfigured/unreachable   │
//! └─────────────────────────────────────────┘
//!                    ↓
//! ┌──────────────────────┐ ┌────────────────────┐
//! │  VaultBackend        │ │  LocalBackend      │
//! │  - KV v2 over HTTP   │ │  - SQLite file     │
//! │  - token / approle   │ │  - AES-256-GCM     │
//! │  - single re-auth    │ │                    │
//! └──────────────────────┘ └────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use fitlink::credentials::{LocalBackend, SecretStore, UserCredential};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let key = std::env::var("FITLINK_ENCRYPTION_KEY")?;
//! let backend = LocalBackend::open("fitlink-secrets.db", &key)?;
//! let store = SecretStore::new(Arc::new(backend), "fitlink/users", "garmin");
//!
//! let cred = UserCredential::new("user-1", "alice@example.com", "pw1");
//! store.store_credential(&cred).await?;
//!
//! if let Some(found) = store.get_credential("user-1").await? {
//!     println!("Provider login: {}", found.external_username);
//! }
//!
//! store.delete_credential("user-1").await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

mod backend;
mod encryption;
mod local;
mod session;
mod store;
mod vault;

pub use backend::{BackendError, SecretBackend};
pub use encryption::MasterKey;
pub use local::LocalBackend;
pub use session::{VaultAuth, VaultSession};
pub use store::{SecretStore, StoreError};
pub use vault::VaultBackend;

/// A user's login for the external fitness provider.
///
/// At most one exists per user. Only the [`SecretStore`] persists it.
#[derive(Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub user_id: String,
    pub external_username: String,
    pub external_secret: String,
}

impl UserCredential {
    pub fn new(
        user_id: impl Into<String>,
        external_username: impl Into<String>,
        external_secret: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            external_username: external_username.into(),
            external_secret: external_secret.into(),
        }
    }
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("user_id", &self.user_id)
            .field("external_username", &self.external_username)
            .field("external_secret", &"<redacted>")
            .finish()
    }
}

/// Document layout inside the secret store.
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    username: String,
    password: String,
}
