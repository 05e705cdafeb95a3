//! Launching the external login program inside a sandbox.

use super::artifacts::ArtifactLayout;
use crate::config::LoginConfig;
use crate::credentials::UserCredential;
use crate::sandbox::Sandbox;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
#[cfg(unix)]
use tracing::warn;

/// Lines kept per stream for diagnostics.
const TAIL_LINES: usize = 20;

/// Builds the login command for one attempt.
///
/// Home, XDG and temp directories plus the token output variables all point
/// into `sandbox`. Credentials go into this child's environment only.
pub fn build_command(
    config: &LoginConfig,
    sandbox: &Sandbox,
    layout: &ArtifactLayout,
    credential: &UserCredential,
) -> Command {
    let root = sandbox.root_path();

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);
    cmd.current_dir(root);
    cmd.envs(&config.env);

    cmd.env("HOME", root);
    cmd.env("XDG_CONFIG_HOME", root.join(".config"));
    cmd.env("XDG_CACHE_HOME", root.join(".cache"));
    cmd.env("TMPDIR", root);
    cmd.env(&config.token_dir_env, &layout.token_dir);
    cmd.env(&config.token_blob_env, &layout.blob_path);
    cmd.env(&config.username_env, &credential.external_username);
    cmd.env(&config.secret_env, &credential.external_secret);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    // Own group, so anything the login program forks can be killed with it
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Sends SIGKILL to the process group led by `pid`.
///
/// Reaches workers the login program forked, even after the leader itself
/// has exited.
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "Failed to kill login process group");
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

/// Rolling tail of the child's output. Diagnostics only; never parsed.
pub struct OutputCapture {
    tails: Vec<Arc<Mutex<VecDeque<String>>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Takes the child's piped stdout/stderr and starts draining them.
    pub fn attach(child: &mut Child) -> Self {
        let mut capture = Self {
            tails: Vec::with_capacity(2),
            readers: Vec::with_capacity(2),
        };
        if let Some(stdout) = child.stdout.take() {
            capture.follow(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            capture.follow(stderr, "stderr");
        }
        capture
    }

    fn follow<R>(&mut self, stream: R, label: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES)));
        self.readers
            .push(tokio::spawn(drain(stream, label, Arc::clone(&tail))));
        self.tails.push(tail);
    }

    /// Stops reading and returns what was captured, stdout tail first.
    ///
    /// Readers are aborted rather than awaited; a grandchild holding the pipe
    /// open must not stall cleanup.
    pub fn finish(self) -> Vec<String> {
        for reader in &self.readers {
            reader.abort();
        }
        let mut lines = Vec::new();
        for tail in &self.tails {
            if let Ok(tail) = tail.lock() {
                lines.extend(tail.iter().cloned());
            }
        }
        lines
    }
}

async fn drain<R>(stream: R, label: &'static str, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(format!("[{}] {}", label, line));
        }
    }
}
