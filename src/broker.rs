//! Public entry point: credential management plus on-demand token exchange.

use crate::config::FitlinkConfig;
use crate::credentials::{SecretStore, StoreError, UserCredential};
use crate::exchange::{BearerMaterial, ExchangeError, TokenExchanger};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful [`CredentialBroker::connect`].
#[derive(Debug)]
pub struct ConnectOutcome {
    /// Bearer material from the validating login.
    pub material: BearerMaterial,
    /// Whether the credential was persisted. `false` when the store is
    /// unavailable; the login itself still succeeded.
    pub stored: bool,
}

/// Brokers a user's provider credential into short-lived bearer material.
///
/// Cheap to clone; clones share the store client and the login limit.
#[derive(Clone)]
pub struct CredentialBroker {
    store: Arc<SecretStore>,
    exchanger: Arc<TokenExchanger>,
}

impl CredentialBroker {
    pub fn new(store: Arc<SecretStore>, config: &FitlinkConfig) -> Self {
        let exchanger = Arc::new(TokenExchanger::new(Arc::clone(&store), config));
        Self { store, exchanger }
    }

    /// Builds the store and exchanger described by `config`.
    pub fn from_config(config: &FitlinkConfig) -> Self {
        let store = Arc::new(SecretStore::from_config(&config.secrets));
        Self::new(store, config)
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    pub async fn store_credential(&self, credential: &UserCredential) -> Result<bool, StoreError> {
        self.store.store_credential(credential).await
    }

    pub async fn get_credential(&self, user_id: &str) -> Result<Option<UserCredential>, StoreError> {
        self.store.get_credential(user_id).await
    }

    pub async fn delete_credential(&self, user_id: &str) -> Result<bool, StoreError> {
        self.store.delete_credential(user_id).await
    }

    /// See [`TokenExchanger::exchange_tokens`].
    pub async fn exchange_tokens(
        &self,
        user_id: &str,
        supplied: Option<UserCredential>,
    ) -> Result<BearerMaterial, ExchangeError> {
        self.exchanger.exchange_tokens(user_id, supplied).await
    }

    /// Validates a provider login and, if it works, keeps it for later.
    ///
    /// Nothing is stored when the validating login fails.
    pub async fn connect(
        &self,
        user_id: &str,
        username: &str,
        secret: &str,
    ) -> Result<ConnectOutcome, ExchangeError> {
        let credential = UserCredential::new(user_id, username, secret);
        let material = self
            .exchanger
            .exchange_tokens(user_id, Some(credential.clone()))
            .await?;

        let stored = self.store.store_credential(&credential).await?;
        if stored {
            info!(user_id = %user_id, "Provider account connected");
        } else {
            warn!(user_id = %user_id, "Provider login valid but credential store unavailable");
        }

        Ok(ConnectOutcome { material, stored })
    }

    /// Forgets the user's provider credential. Returns whether one existed.
    pub async fn disconnect(&self, user_id: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete_credential(user_id).await?;
        info!(user_id = %user_id, removed, "Provider account disconnected");
        Ok(removed)
    }
}
