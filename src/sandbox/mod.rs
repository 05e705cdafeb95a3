//! Disposable per-attempt filesystem scope.
//!
//! Every exchange attempt gets its own freshly created directory tree. The
//! login program's home and token paths point only inside it, so concurrent
//! attempts cannot see each other's files. The tree is removed when the
//! attempt ends, whatever the outcome.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the pre-created token subdirectory inside a sandbox root.
pub const TOKEN_SUBDIR: &str = "tokens";

/// Longest user-id fragment used in a sandbox directory name.
const MAX_LABEL_LEN: usize = 32;

/// A uniquely named directory tree owned by one exchange attempt.
///
/// Call [`Sandbox::destroy`] on every exit path. If the owning future is
/// dropped first, `Drop` removes the tree synchronously instead.
#[derive(Debug)]
pub struct Sandbox {
    root_path: PathBuf,
    token_path: PathBuf,
    destroyed: bool,
}

impl Sandbox {
    /// Allocates `<base_dir>/<user label>-<uuid>` and its token subdirectory.
    ///
    /// The root is created with `create_dir`, so an existing path is never
    /// reused.
    pub async fn create(base_dir: &Path, user_id: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(base_dir).await?;

        let root_path = base_dir.join(format!("{}-{}", dir_label(user_id), Uuid::new_v4()));
        tokio::fs::create_dir(&root_path).await?;

        // From here on Drop cleans up if anything below fails
        let sandbox = Self {
            token_path: root_path.join(TOKEN_SUBDIR),
            root_path,
            destroyed: false,
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&sandbox.root_path, std::fs::Permissions::from_mode(0o700))
                .await?;
        }

        tokio::fs::create_dir(&sandbox.token_path).await?;

        debug!(root = %sandbox.root_path.display(), "Sandbox created");
        Ok(sandbox)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Recursively removes the sandbox. Failures are logged, never returned.
    pub async fn destroy(mut self) {
        self.destroyed = true;
        match tokio::fs::remove_dir_all(&self.root_path).await {
            Ok(()) => debug!(root = %self.root_path.display(), "Sandbox destroyed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                root = %self.root_path.display(),
                error = %e,
                "Failed to remove sandbox"
            ),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        match std::fs::remove_dir_all(&self.root_path) {
            Ok(()) => debug!(root = %self.root_path.display(), "Sandbox removed on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                root = %self.root_path.display(),
                error = %e,
                "Failed to remove sandbox on drop"
            ),
        }
    }
}

/// Filesystem-safe, length-bounded label derived from a user id.
fn dir_label(user_id: &str) -> String {
    let label: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_LABEL_LEN)
        .collect();
    if label.is_empty() {
        "user".to_string()
    } else {
        label
    }
}
