//! Encrypted secret backend on a local SQLite file.
//!
//! Intended for single-host deployments and tests. Every document is sealed
//! with AES-256-GCM before it touches disk.

use super::backend::{BackendError, SecretBackend};
use super::encryption::MasterKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Encrypted document storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     id INTEGER PRIMARY KEY,
///     path TEXT NOT NULL UNIQUE,
///     ciphertext TEXT NOT NULL,   -- sealed JSON document
///     nonce TEXT NOT NULL,
///     created_at TEXT NOT NULL,   -- ISO 8601
///     updated_at TEXT NOT NULL    -- ISO 8601
/// );
/// ```
///
/// The UNIQUE path constraint is what keeps at most one document per path.
pub struct LocalBackend {
    conn: Mutex<Connection>,
    key: MasterKey,
}

impl LocalBackend {
    /// Opens (or creates) the database at `db_path`.
    ///
    /// `master_key` is the base64-encoded 32-byte key. `":memory:"` gives a
    /// throwaway store.
    pub fn open<P: AsRef<Path>>(db_path: P, master_key: &str) -> Result<Self> {
        let key = MasterKey::from_base64(master_key).context("Invalid master key")?;

        let conn = Connection::open(db_path).context("Failed to open secrets database")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                id INTEGER PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                ciphertext TEXT NOT NULL,
                nonce TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create secrets table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|_| BackendError::Other("secrets database lock poisoned".to_string()))
    }
}

#[async_trait]
impl SecretBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, BackendError> {
        let row: Option<(String, String)> = self
            .conn()?
            .query_row(
                "SELECT ciphertext, nonce FROM secrets WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sqlite_error)?;

        let Some((ciphertext, nonce)) = row else {
            return Ok(None);
        };

        let plaintext = self
            .key
            .open(&ciphertext, &nonce)
            .map_err(|e| BackendError::Other(format!("{:#}", e)))?;
        let document = serde_json::from_slice(&plaintext)
            .map_err(|e| BackendError::Other(format!("Stored document is not JSON: {}", e)))?;

        Ok(Some(document))
    }

    async fn write(&self, path: &str, document: &Value) -> Result<(), BackendError> {
        let plaintext = serde_json::to_vec(document)
            .map_err(|e| BackendError::Other(format!("Failed to serialize document: {}", e)))?;
        let (ciphertext, nonce) = self
            .key
            .seal(&plaintext)
            .map_err(|e| BackendError::Other(format!("{:#}", e)))?;
        let now = Utc::now().to_rfc3339();

        self.conn()?
            .execute(
                r#"
                INSERT INTO secrets (path, ciphertext, nonce, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(path) DO UPDATE SET
                    ciphertext = excluded.ciphertext,
                    nonce = excluded.nonce,
                    updated_at = excluded.updated_at
                "#,
                params![path, ciphertext, nonce, now],
            )
            .map_err(sqlite_error)?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, BackendError> {
        let rows_affected = self
            .conn()?
            .execute("DELETE FROM secrets WHERE path = ?1", params![path])
            .map_err(sqlite_error)?;

        Ok(rows_affected > 0)
    }
}

fn sqlite_error(error: rusqlite::Error) -> BackendError {
    BackendError::Other(format!("secrets database error: {}", error))
}
