//! Collision-free naming for committed uploads.
//!
//! Names are claimed exclusively: a fully written staging file is
//! hard-linked to each candidate name in turn, and a link that fails with
//! `AlreadyExists` simply moves on to the next candidate. Two writers racing
//! for the same name can therefore never both get it, and nothing is ever
//! overwritten.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Default upper bound on candidate names tried per item.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10_000;

/// Errors produced while claiming a name.
#[derive(Debug, Error)]
pub enum NameError {
    /// Every candidate up to the attempt limit was taken.
    #[error("no free name for {name} after {attempts} attempts")]
    Exhausted {
        /// Requested base name.
        name: String,
        /// Attempts made.
        attempts: u32,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Split a file name into stem and extension at the last dot.
///
/// A leading dot does not start an extension, so `.env` has none.
pub fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
    }
}

/// The `n`th candidate for `name`: the name itself, then `stem (n).ext`.
pub fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match split_name(name) {
        (stem, Some(ext)) => format!("{stem} ({n}).{ext}"),
        (stem, None) => format!("{stem} ({n})"),
    }
}

/// Claims unused names in a directory.
#[derive(Debug, Clone)]
pub struct ConflictNamer {
    max_attempts: u32,
}

impl Default for ConflictNamer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ConflictNamer {
    /// Create a namer that gives up after `max_attempts` candidates.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Move `staged` to the first free candidate of `base_name` in
    /// `directory` and return the final path.
    ///
    /// `staged` must be a fully written file on the same filesystem as
    /// `directory`. On success it no longer exists under its staging name.
    pub async fn uniquify(
        &self,
        staged: &Path,
        directory: &Path,
        base_name: &str,
    ) -> Result<PathBuf, NameError> {
        for n in 0..self.max_attempts {
            let candidate = directory.join(candidate_name(base_name, n));

            match tokio::fs::hard_link(staged, &candidate).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(staged).await {
                        warn!(path = ?staged, error = %e, "Failed to remove staging link");
                    }
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(candidate = ?candidate, "Name taken, trying next");
                }
                Err(e) if links_unsupported(&e) => {
                    if self.claim_with_placeholder(staged, &candidate).await? {
                        return Ok(candidate);
                    }
                }
                Err(e) => return Err(NameError::Io(e)),
            }
        }

        Err(NameError::Exhausted {
            name: base_name.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Fallback for filesystems without hard links: reserve the name with an
    /// exclusive create, then rename the staged file over the placeholder.
    async fn claim_with_placeholder(&self, staged: &Path, candidate: &Path) -> Result<bool, NameError> {
        let placeholder = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(candidate)
            .await;

        match placeholder {
            Ok(file) => {
                drop(file);
                if let Err(e) = tokio::fs::rename(staged, candidate).await {
                    if let Err(cleanup) = tokio::fs::remove_file(candidate).await {
                        warn!(path = ?candidate, error = %cleanup, "Failed to remove name placeholder");
                    }
                    return Err(NameError::Io(e));
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(NameError::Io(e)),
        }
    }
}

fn links_unsupported(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied
    )
}
