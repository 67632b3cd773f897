//! SQLite Settings Store
//!
//! The proxy keeps its whole JSON configuration in one row of a
//! `settings(key, value)` table. The store reads that row and rewrites it
//! with one outbound's settings updated.

use crate::document::{rewrite_document, DocumentError, OutboundSettings};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Row holding the proxy's configuration template
pub const DEFAULT_SETTINGS_KEY: &str = "xrayTemplateConfig";

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Failed to query settings: {0}")]
    Query(String),

    #[error("Settings row '{0}' not found")]
    MissingRow(String),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Failed to write settings: {0}")]
    Write(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

/// Result of [`SettingsStore::apply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Dry run succeeded, nothing written
    Validated,
    /// Document rewritten
    Written { bytes: usize },
}

/// Settings table accessor
pub struct SettingsStore {
    conn: Connection,
    key: String,
}

impl SettingsStore {
    /// Open an existing database. A missing file is an error.
    pub fn open(path: &Path, key: impl Into<String>) -> Result<Self, StoreError> {
        debug!("Opening settings database at {:?}", path);

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            conn,
            key: key.into(),
        })
    }

    /// Settings row key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw document text
    pub fn read_document(&self) -> Result<String, StoreError> {
        Self::read_row(&self.conn, &self.key)
    }

    fn read_row(conn: &Connection, key: &str) -> Result<String, StoreError> {
        conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::MissingRow(key.to_string()))
    }

    /// Update the settings of outbound `tag`.
    ///
    /// With `simulate` the new document is computed and discarded. Otherwise
    /// the read, merge and write happen in one immediate transaction; the
    /// row is left untouched on any error.
    pub fn apply(
        &mut self,
        tag: &str,
        settings: &OutboundSettings,
        simulate: bool,
    ) -> Result<ApplyOutcome, StoreError> {
        if simulate {
            let raw = self.read_document()?;
            rewrite_document(&raw, tag, settings)?;
            debug!("Simulated update of outbound '{}'", tag);
            return Ok(ApplyOutcome::Validated);
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let raw = Self::read_row(&tx, &self.key)?;
        let text = rewrite_document(&raw, tag, settings)?;

        let changed = tx
            .execute("UPDATE settings SET value = ?1 WHERE key = ?2", [&text, &self.key])
            .map_err(|e| StoreError::Write(e.to_string()))?;
        if changed != 1 {
            return Err(StoreError::Write(format!(
                "expected to update 1 row for '{}', updated {}",
                self.key, changed
            )));
        }

        tx.commit().map_err(|e| StoreError::Write(e.to_string()))?;

        info!("Outbound '{}' updated in '{}' ({} bytes)", tag, self.key, text.len());
        Ok(ApplyOutcome::Written { bytes: text.len() })
    }
}
