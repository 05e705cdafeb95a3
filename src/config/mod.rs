//! Runtime configuration.
//!
//! Loaded from an optional TOML file (every section and field has a default),
//! then overridden from environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete fitlink configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FitlinkConfig {
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

/// Which secret backend holds user credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackendKind {
    Vault,
    Local,
    /// No store; the client runs permanently in unavailable mode.
    #[default]
    None,
}

impl std::str::FromStr for SecretBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vault" => Ok(Self::Vault),
            "local" => Ok(Self::Local),
            "none" | "" => Ok(Self::None),
            other => Err(anyhow::anyhow!("Unknown secret backend '{}'", other)),
        }
    }
}

/// Secret store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub backend: SecretBackendKind,
    /// Credentials live at `{path_prefix}/{user_id}/{provider}`
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

fn default_path_prefix() -> String {
    "fitlink/users".to_string()
}

fn default_provider() -> String {
    "garmin".to_string()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretBackendKind::default(),
            path_prefix: default_path_prefix(),
            provider: default_provider(),
            vault: VaultConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

/// Remote secret service settings.
///
/// `token` takes precedence over `role_id`/`secret_id` when both are set.
#[derive(Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub secret_id: Option<String>,
    #[serde(default = "default_approle_mount")]
    pub approle_mount: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_approle_mount() -> String {
    "approle".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: None,
            mount: default_vault_mount(),
            namespace: None,
            token: None,
            role_id: None,
            secret_id: None,
            approle_mount: default_approle_mount(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("role_id", &self.role_id)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "<redacted>"))
            .field("approle_mount", &self.approle_mount)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Local encrypted backend settings
#[derive(Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_db")]
    pub db_path: PathBuf,
    /// Base64-encoded 32-byte master key
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_local_db() -> PathBuf {
    PathBuf::from("fitlink-secrets.db")
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            db_path: default_local_db(),
            encryption_key: None,
        }
    }
}

impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConfig")
            .field("db_path", &self.db_path)
            .field(
                "encryption_key",
                &self.encryption_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// External login program invocation
#[derive(Debug, Clone, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_login_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra variables for the login program. Sandbox and credential
    /// variables are applied after these and always win.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_username_env")]
    pub username_env: String,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_token_dir_env")]
    pub token_dir_env: String,
    #[serde(default = "default_token_blob_env")]
    pub token_blob_env: String,
}

fn default_login_program() -> String {
    "garmin-login".to_string()
}

fn default_username_env() -> String {
    "GARMIN_EMAIL".to_string()
}

fn default_secret_env() -> String {
    "GARMIN_PASSWORD".to_string()
}

fn default_token_dir_env() -> String {
    "GARMINTOKENS".to_string()
}

fn default_token_blob_env() -> String {
    "GARMINTOKENS_BASE64".to_string()
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            program: default_login_program(),
            args: Vec::new(),
            env: BTreeMap::new(),
            username_env: default_username_env(),
            secret_env: default_secret_env(),
            token_dir_env: default_token_dir_env(),
            token_blob_env: default_token_blob_env(),
        }
    }
}

/// Where per-attempt sandboxes are allocated
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxConfig {
    /// Defaults to `<system temp>/fitlink-sandboxes`
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fitlink-sandboxes"))
    }
}

/// Exchange timing and concurrency
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent_logins")]
    pub max_concurrent_logins: usize,
}

fn default_poll_interval() -> u64 {
    250
}

fn default_timeout() -> u64 {
    45
}

fn default_max_concurrent_logins() -> usize {
    8
}

impl ExchangeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            timeout_secs: default_timeout(),
            max_concurrent_logins: default_max_concurrent_logins(),
        }
    }
}

impl FitlinkConfig {
    /// Applies environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup` (variable name → value).
    ///
    /// Setting `VAULT_ADDR` selects the vault backend unless
    /// `FITLINK_SECRET_BACKEND` says otherwise.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault = &mut self.secrets.vault;
        if let Some(v) = lookup("VAULT_ADDR") {
            vault.address = Some(v);
            if self.secrets.backend == SecretBackendKind::None {
                self.secrets.backend = SecretBackendKind::Vault;
            }
        }
        if let Some(v) = lookup("VAULT_TOKEN") {
            vault.token = Some(v);
        }
        if let Some(v) = lookup("VAULT_NAMESPACE") {
            vault.namespace = Some(v);
        }
        if let Some(v) = lookup("VAULT_ROLE_ID") {
            vault.role_id = Some(v);
        }
        if let Some(v) = lookup("VAULT_SECRET_ID") {
            vault.secret_id = Some(v);
        }
        if let Some(v) = lookup("FITLINK_SECRET_BACKEND") {
            self.secrets.backend = v.parse()?;
        }
        if let Some(v) = lookup("FITLINK_LOCAL_DB") {
            self.secrets.local.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FITLINK_ENCRYPTION_KEY") {
            self.secrets.local.encryption_key = Some(v);
        }
        if let Some(v) = lookup("FITLINK_LOGIN_PROGRAM") {
            self.login.program = v;
        }
        if let Some(v) = lookup("FITLINK_SANDBOX_DIR") {
            self.sandbox.base_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FITLINK_EXCHANGE_TIMEOUT_SECS") {
            self.exchange.timeout_secs = v
                .parse()
                .context("FITLINK_EXCHANGE_TIMEOUT_SECS must be a number of seconds")?;
        }
        if let Some(v) = lookup("FITLINK_MAX_CONCURRENT_LOGINS") {
            self.exchange.max_concurrent_logins = v
                .parse()
                .context("FITLINK_MAX_CONCURRENT_LOGINS must be a positive integer")?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<FitlinkConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: FitlinkConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
