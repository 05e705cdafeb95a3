//! On-demand token exchange.
//!
//! One exchange attempt turns a user's stored provider credential into fresh
//! bearer material by running the provider's login program in a throwaway
//! sandbox:
//!
//! ```text
//! Idle → SandboxCreated → LoginSpawned → ArtifactDetected ┐
//!                                      → TimedOut         ├→ CleanedUp → Done
//!                                      → ProcessError     ┘
//! ```
//!
//! Every outcome goes through the same cleanup routine: kill the login
//! program and anything it forked, read artifacts once, destroy the sandbox.
//! Nothing from an attempt is kept; a caller wanting a new token starts a new
//! attempt.

pub mod artifacts;
pub mod login;
pub mod poll;

pub use artifacts::{ArtifactShape, BearerMaterial};

use crate::config::{FitlinkConfig, LoginConfig};
use crate::credentials::{SecretStore, StoreError, UserCredential};
use crate::sandbox::Sandbox;
use artifacts::ArtifactLayout;
use chrono::{DateTime, Utc};
use login::OutputCapture;
use poll::{LoginSignal, PollSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Why an exchange attempt produced no bearer material.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Nothing stored or supplied for this user. The user has to reconnect.
    #[error("no provider credential for user {user_id}; reconnect the account")]
    CredentialNotFound { user_id: String },

    /// The login program wrote no tokens before the deadline.
    #[error("provider login produced no tokens within {timeout_secs}s")]
    LoginTimeout { timeout_secs: u64 },

    /// The login program finished (or could not be waited on) without tokens.
    #[error("provider login exited without producing tokens (exit code {exit_code:?})")]
    NoArtifactsProduced { exit_code: Option<i32> },

    #[error(transparent)]
    SecretStore(#[from] StoreError),

    #[error("failed to prepare login sandbox: {0}")]
    Sandbox(#[source] std::io::Error),

    #[error("failed to start provider login program: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ExchangeError {
    /// Whether starting a new attempt later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::LoginTimeout { .. } | ExchangeError::NoArtifactsProduced { .. }
        )
    }

    /// Whether the user has to connect their provider account again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, ExchangeError::CredentialNotFound { .. })
    }
}

/// Attempt state, used for structured logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    SandboxCreated,
    LoginSpawned,
    ArtifactDetected,
    TimedOut,
    ProcessError,
    CleanedUp,
    Done,
}

/// One exchange attempt. Lives only for the duration of the call.
#[derive(Debug)]
struct ExchangeAttempt {
    user_id: String,
    sandbox_path: PathBuf,
    started_at: DateTime<Utc>,
}

impl ExchangeAttempt {
    fn enter(&self, phase: Phase) {
        debug!(
            user_id = %self.user_id,
            sandbox = %self.sandbox_path.display(),
            phase = ?phase,
            "Exchange attempt transition"
        );
    }

    fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

/// A running login child and its output tail.
struct RunningLogin {
    child: Child,
    /// Also the process group id of everything the login program forked.
    pid: Option<u32>,
    output: OutputCapture,
}

/// Runs isolated provider logins and hands back bearer material.
///
/// Attempts for different users run concurrently with no coordination; the
/// only shared state is the secret store client and a semaphore bounding
/// how many login processes run at once.
pub struct TokenExchanger {
    store: Arc<SecretStore>,
    login: LoginConfig,
    sandbox_base: PathBuf,
    poll: PollSettings,
    permits: Semaphore,
}

impl TokenExchanger {
    pub fn new(store: Arc<SecretStore>, config: &FitlinkConfig) -> Self {
        Self {
            store,
            login: config.login.clone(),
            sandbox_base: config.sandbox.resolved_base_dir(),
            poll: PollSettings {
                interval: config.exchange.poll_interval(),
                timeout: config.exchange.timeout(),
            },
            permits: Semaphore::new(config.exchange.max_concurrent_logins.max(1)),
        }
    }

    /// Exchanges a user's provider credential for fresh bearer material.
    ///
    /// Uses `supplied` if given, otherwise the stored credential. Without
    /// either, returns [`ExchangeError::CredentialNotFound`] before touching
    /// the filesystem or spawning anything.
    ///
    /// The timeout covers waiting for a free login slot as well as the
    /// login itself; only cleanup runs past it.
    pub async fn exchange_tokens(
        &self,
        user_id: &str,
        supplied: Option<UserCredential>,
    ) -> Result<BearerMaterial, ExchangeError> {
        debug!(user_id = %user_id, phase = ?Phase::Idle, "Exchange requested");
        let credential = self.resolve_credential(user_id, supplied).await?;

        // The ceiling covers waiting for a login slot too
        let deadline = Instant::now() + self.poll.timeout;
        let _permit = match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            // Never closed, so acquire only fails if that changes
            Ok(permit) => permit.ok(),
            Err(_) => {
                warn!(user_id = %user_id, "No login slot became free before the deadline");
                return Err(ExchangeError::LoginTimeout {
                    timeout_secs: self.poll.timeout.as_secs(),
                });
            }
        };

        let sandbox = Sandbox::create(&self.sandbox_base, user_id)
            .await
            .map_err(ExchangeError::Sandbox)?;
        let attempt = ExchangeAttempt {
            user_id: user_id.to_string(),
            sandbox_path: sandbox.root_path().to_path_buf(),
            started_at: Utc::now(),
        };
        attempt.enter(Phase::SandboxCreated);

        let layout = ArtifactLayout::for_sandbox(&sandbox);
        let mut command = login::build_command(&self.login, &sandbox, &layout, &credential);

        let (running, signal) = match command.spawn() {
            Ok(mut child) => {
                attempt.enter(Phase::LoginSpawned);
                let output = OutputCapture::attach(&mut child);
                let pid = child.id();
                let settings = PollSettings {
                    timeout: deadline.saturating_duration_since(Instant::now()),
                    ..self.poll
                };
                let signal = poll::watch(&mut child, &layout, settings).await;
                (Some(RunningLogin { child, pid, output }), signal)
            }
            Err(e) => (None, LoginSignal::SpawnFailed(e)),
        };

        self.conclude(attempt, sandbox, layout, running, signal).await
    }

    async fn resolve_credential(
        &self,
        user_id: &str,
        supplied: Option<UserCredential>,
    ) -> Result<UserCredential, ExchangeError> {
        if let Some(credential) = supplied {
            return Ok(credential);
        }

        match self.store.get_credential(user_id).await? {
            Some(credential) => Ok(credential),
            None => {
                info!(user_id = %user_id, "No provider credential available, skipping login");
                Err(ExchangeError::CredentialNotFound {
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    /// Single convergence point for every outcome.
    async fn conclude(
        &self,
        attempt: ExchangeAttempt,
        sandbox: Sandbox,
        layout: ArtifactLayout,
        running: Option<RunningLogin>,
        signal: LoginSignal,
    ) -> Result<BearerMaterial, ExchangeError> {
        attempt.enter(match signal {
            LoginSignal::ArtifactsDetected => Phase::ArtifactDetected,
            LoginSignal::TimedOut => Phase::TimedOut,
            _ => Phase::ProcessError,
        });

        let diagnostics = match running {
            Some(mut running) => {
                if let Some(pid) = running.pid {
                    login::kill_process_group(pid);
                }
                terminate(&mut running.child).await;
                running.output.finish()
            }
            None => Vec::new(),
        };

        let material = layout.load().await;
        sandbox.destroy().await;
        attempt.enter(Phase::CleanedUp);

        let result = match (material, signal) {
            (Some(material), _) => Ok(material),
            (None, LoginSignal::TimedOut) => Err(ExchangeError::LoginTimeout {
                timeout_secs: self.poll.timeout.as_secs(),
            }),
            (None, LoginSignal::SpawnFailed(e)) => Err(ExchangeError::Spawn(e)),
            (None, LoginSignal::Exited(status)) => Err(ExchangeError::NoArtifactsProduced {
                exit_code: status.code(),
            }),
            (None, LoginSignal::WaitFailed(e)) => {
                warn!(user_id = %attempt.user_id, error = %e, "Failed to wait on login process");
                Err(ExchangeError::NoArtifactsProduced { exit_code: None })
            }
            (None, LoginSignal::ArtifactsDetected) => {
                Err(ExchangeError::NoArtifactsProduced { exit_code: None })
            }
        };

        match &result {
            Ok(material) => info!(
                user_id = %attempt.user_id,
                shape = ?material.shape(),
                elapsed_ms = attempt.elapsed_ms(),
                "Token exchange succeeded"
            ),
            Err(e) => {
                warn!(
                    user_id = %attempt.user_id,
                    error = %e,
                    elapsed_ms = attempt.elapsed_ms(),
                    "Token exchange failed"
                );
                for line in &diagnostics {
                    debug!(user_id = %attempt.user_id, output = %line, "Login program output");
                }
            }
        }
        attempt.enter(Phase::Done);

        result
    }
}

/// Force-terminates the child if it is still running and reaps it.
async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Login process already gone");
        return;
    }
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        warn!("Login process did not exit after kill");
    }
}
