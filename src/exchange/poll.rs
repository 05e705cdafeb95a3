//! Waits for the first of: artifacts on disk, the deadline, or process exit.

use super::artifacts::ArtifactLayout;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::MissedTickBehavior;

/// How a login attempt ended, as seen by the orchestrator.
#[derive(Debug)]
pub enum LoginSignal {
    /// A complete artifact set appeared; the child may still be running.
    ArtifactsDetected,
    /// The hard ceiling passed first.
    TimedOut,
    /// The child exited on its own.
    Exited(ExitStatus),
    /// Waiting on the child failed.
    WaitFailed(io::Error),
    /// The child could not be started at all.
    SpawnFailed(io::Error),
}

/// Poll interval and hard ceiling for one attempt
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Watches `child` and `layout` until the first signal.
///
/// Returns as soon as artifacts are complete, without waiting for the child
/// to exit. Never runs past `settings.timeout`.
pub async fn watch(child: &mut Child, layout: &ArtifactLayout, settings: PollSettings) -> LoginSignal {
    let deadline = tokio::time::sleep(settings.timeout);
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = &mut deadline => return LoginSignal::TimedOut,
            status = child.wait() => {
                return match status {
                    Ok(status) => LoginSignal::Exited(status),
                    Err(e) => LoginSignal::WaitFailed(e),
                };
            }
            _ = ticker.tick() => {
                if layout.is_complete().await {
                    return LoginSignal::ArtifactsDetected;
                }
            }
        }
    }
}
