//! Authentication state for the remote secret service.

use chrono::{DateTime, Duration, Utc};

/// Renew leased tokens this long before they actually expire.
const RENEWAL_MARGIN_SECS: i64 = 30;

/// How the client authenticates to the secret service.
#[derive(Clone)]
pub enum VaultAuth {
    /// Operator-provisioned token; no login round-trip.
    Token(String),

    /// Role login exchanging a role id and secret id for a leased token.
    AppRole {
        mount: String,
        role_id: String,
        secret_id: String,
    },
}

impl VaultAuth {
    pub fn method(&self) -> &'static str {
        match self {
            VaultAuth::Token(_) => "token",
            VaultAuth::AppRole { .. } => "approle",
        }
    }
}

impl std::fmt::Debug for VaultAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultAuth::Token(_) => f.write_str("Token(<redacted>)"),
            VaultAuth::AppRole { mount, role_id, .. } => f
                .debug_struct("AppRole")
                .field("mount", mount)
                .field("role_id", role_id)
                .field("secret_id", &"<redacted>")
                .finish(),
        }
    }
}

/// A session token and the moment its lease runs out.
#[derive(Clone)]
pub struct VaultSession {
    pub token: String,
    /// `None` for tokens that never expire.
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl VaultSession {
    /// Builds a session from a login response. A lease of zero seconds means
    /// the token has no expiry.
    pub fn leased(token: String, lease_duration_secs: i64, now: DateTime<Utc>) -> Self {
        let lease_expiry = if lease_duration_secs > 0 {
            Some(now + Duration::seconds(lease_duration_secs))
        } else {
            None
        };
        Self {
            token,
            lease_expiry,
        }
    }

    /// Whether the token can still be used at `now`, renewal margin included.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expiry {
            Some(expiry) => now + Duration::seconds(RENEWAL_MARGIN_SECS) < expiry,
            None => true,
        }
    }
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("token", &"<redacted>")
            .field("lease_expiry", &self.lease_expiry)
            .finish()
    }
}

/// Guard for the one re-authentication allowed per operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthAttempt {
    FirstTry,
    RetriedOnce,
}
