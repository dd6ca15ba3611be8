//! Append-only log of committed uploads.
//!
//! One JSON object per line. The log is write-only from the server's point
//! of view: listings and existence checks always go to the filesystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::files::epoch_millis;

/// Errors that can occur while writing the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to encode the record.
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One committed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Commit time (Unix epoch milliseconds).
    pub timestamp_ms: u64,
    /// Account that uploaded the file.
    pub user: String,
    /// Final virtual path.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
}

impl AuditRecord {
    /// Record stamped with the current time.
    pub fn now(user: &str, path: &str, size: u64, sha256: &str) -> Self {
        Self {
            timestamp_ms: epoch_millis(std::time::SystemTime::now()),
            user: user.to_string(),
            path: path.to_string(),
            size,
            sha256: sha256.to_string(),
        }
    }
}

/// JSON Lines upload log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl AuditLog {
    /// Open (or create) the log for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append one record, logging instead of failing.
    pub async fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(&record).await {
            warn!(path = %record.path, error = %e, "Failed to write audit record");
        }
    }
}
