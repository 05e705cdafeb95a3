//! Token artifacts left behind by the login program.
//!
//! The login program writes either one pre-encoded base64 blob, or two token
//! documents in the token directory. Both shapes reduce to one base64 value
//! of the JSON array `[oauth1, oauth2]`.

use crate::sandbox::Sandbox;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Blob file, relative to the sandbox root.
pub const BLOB_FILE: &str = ".garminconnect_base64";

/// Token documents, relative to the token directory.
pub const OAUTH1_FILE: &str = "oauth1_token.json";
pub const OAUTH2_FILE: &str = "oauth2_token.json";

/// Which artifact shape the bearer material was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactShape {
    EncodedBlob,
    TokenDocuments,
}

/// Normalized, base64-encoded provider tokens.
///
/// Use immediately and discard. Never persisted by this crate; `Debug`
/// does not print the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerMaterial {
    encoded: String,
    shape: ArtifactShape,
}

impl BearerMaterial {
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn into_string(self) -> String {
        self.encoded
    }

    pub fn shape(&self) -> ArtifactShape {
        self.shape
    }

    /// Decoded token bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.encoded)
    }
}

impl std::fmt::Debug for BearerMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerMaterial")
            .field("shape", &self.shape)
            .field("len", &self.encoded.len())
            .finish()
    }
}

/// Where one sandbox's artifacts appear.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    pub blob_path: PathBuf,
    pub token_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn for_sandbox(sandbox: &Sandbox) -> Self {
        Self {
            blob_path: sandbox.root_path().join(BLOB_FILE),
            token_dir: sandbox.token_path().to_path_buf(),
        }
    }

    /// Whether a complete artifact set is on disk yet.
    ///
    /// Partially written files do not count. A blob must decode to the full
    /// token pair, not just to valid base64.
    pub async fn is_complete(&self) -> bool {
        self.load().await.is_some()
    }

    /// Reads and normalizes the artifacts. The blob wins if both shapes exist.
    pub async fn load(&self) -> Option<BearerMaterial> {
        if let Some(material) = read_blob(&self.blob_path).await {
            return Some(material);
        }
        read_documents(&self.token_dir).await
    }
}

async fn read_blob(path: &Path) -> Option<BearerMaterial> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let encoded = contents.trim();
    let decoded = BASE64.decode(encoded).ok()?;
    // A truncated blob can still be valid base64
    if !is_token_pair(&serde_json::from_slice::<Value>(&decoded).ok()?) {
        return None;
    }
    Some(BearerMaterial {
        encoded: encoded.to_string(),
        shape: ArtifactShape::EncodedBlob,
    })
}

async fn read_documents(token_dir: &Path) -> Option<BearerMaterial> {
    let oauth1 = read_json(&token_dir.join(OAUTH1_FILE)).await?;
    let oauth2 = read_json(&token_dir.join(OAUTH2_FILE)).await?;

    // Same layout the login program uses for its own blob: [oauth1, oauth2]
    let combined = serde_json::to_vec(&Value::Array(vec![oauth1, oauth2])).ok()?;
    Some(BearerMaterial {
        encoded: BASE64.encode(combined),
        shape: ArtifactShape::TokenDocuments,
    })
}

fn is_token_pair(value: &Value) -> bool {
    matches!(value, Value::Array(items) if items.len() == 2)
}

async fn read_json(path: &Path) -> Option<Value> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}
