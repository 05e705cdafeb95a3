// Public broker facade
pub mod broker;

// Configuration loading
pub mod config;

// Per-user credential storage
pub mod credentials;

// Sandboxed login and token extraction
pub mod exchange;

// Per-attempt scratch directories
pub mod sandbox;

pub use broker::{ConnectOutcome, CredentialBroker};
pub use credentials::UserCredential;
pub use exchange::{BearerMaterial, ExchangeError};
