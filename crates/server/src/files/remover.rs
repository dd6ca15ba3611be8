//! Recursive removal of namespace entries.
//!
//! An entry is first renamed to a hidden trash name in its own directory.
//! That rename is atomic, so once it returns the entry is gone from every
//! listing; the trash entry is then deleted at leisure.

use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::resolver::{PathResolver, VirtualPath};
use super::{is_internal_name, trash_name};

/// Errors that can occur while removing entries.
#[derive(Debug, Error)]
pub enum RemoveError {
    /// The path is not removable: it failed validation, escapes the root,
    /// or is the root itself.
    #[error("removal forbidden: {0}")]
    Forbidden(String),

    /// Nothing exists at the path.
    #[error("not found: {0}")]
    NotFound(VirtualPath),

    /// Some entries could not be removed while clearing the root.
    #[error("removed {removed} entries, {failed} failed")]
    Partial {
        /// Entries removed.
        removed: usize,
        /// Entries that failed.
        failed: usize,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Deletes files and directory subtrees.
#[derive(Debug, Clone)]
pub struct EntryRemover {
    resolver: Arc<PathResolver>,
}

impl EntryRemover {
    /// Create a remover over a resolver.
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// Remove the entry at `path`, recursively for directories.
    ///
    /// Resolution failures are reported as [`RemoveError::Forbidden`] so a
    /// caller cannot learn whether an out-of-bounds path exists.
    pub async fn remove(&self, path: &VirtualPath) -> Result<(), RemoveError> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(RemoveError::Forbidden("cannot remove the storage root".to_string()));
        };

        // The parent is resolved, not the entry, so a symlink is removed
        // itself rather than its target.
        let parent_abs = self
            .resolver
            .resolve(&parent)
            .await
            .map_err(|e| RemoveError::Forbidden(e.to_string()))?;
        let absolute = parent_abs.join(name);

        let metadata = match tokio::fs::symlink_metadata(&absolute).await {
            Ok(m) => m,
            Err(e) if is_absent(&e) => return Err(RemoveError::NotFound(path.clone())),
            Err(e) => return Err(RemoveError::Io(e)),
        };

        let trash = parent_abs.join(trash_name());
        match tokio::fs::rename(&absolute, &trash).await {
            Ok(()) => {}
            Err(e) if is_absent(&e) => return Err(RemoveError::NotFound(path.clone())),
            Err(e) => return Err(RemoveError::Io(e)),
        }

        let is_dir = metadata.is_dir();
        if let Err(e) = purge(&trash, is_dir).await {
            // Hidden already; the staging sweep picks it up later.
            warn!(path = ?trash, error = %e, "Failed to delete trash entry");
        }

        info!(path = %path, directory = is_dir, "Removed entry");
        Ok(())
    }

    /// Remove every entry directly under the root.
    ///
    /// Returns the number of entries removed. Entries that fail are logged
    /// and skipped, and reported together as [`RemoveError::Partial`].
    pub async fn clear(&self) -> Result<usize, RemoveError> {
        let mut read_dir = tokio::fs::read_dir(self.resolver.root()).await?;

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                if !is_internal_name(&name) {
                    names.push(name);
                }
            }
        }

        let mut removed = 0;
        let mut failed = 0;
        for name in names {
            let result = match VirtualPath::segment(&name) {
                Ok(path) => self.remove(&path).await,
                Err(e) => Err(RemoveError::Forbidden(e.to_string())),
            };
            match result {
                Ok(()) => removed += 1,
                Err(RemoveError::NotFound(_)) => debug!(name = %name, "Entry vanished during clear"),
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to remove entry during clear");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(RemoveError::Partial { removed, failed });
        }
        info!(removed, "Cleared storage root");
        Ok(removed)
    }
}

pub(crate) async fn purge(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}
