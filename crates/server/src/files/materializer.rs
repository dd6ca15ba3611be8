//! Ancestor directory creation for upload batches.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::resolver::{PathError, PathResolver, VirtualPath};

/// Why a directory could not be materialized.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The directory path failed resolution.
    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    /// Something other than a directory already exists there.
    #[error("not a directory: {0}")]
    NotADirectory(VirtualPath),

    /// An ancestor failed, so this directory was not attempted.
    #[error("parent directory {0} could not be created")]
    AncestorFailed(VirtualPath),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one materialization pass.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Directories created by this pass, in creation order.
    pub created: Vec<VirtualPath>,
    /// Directories that were already present.
    pub existing: Vec<VirtualPath>,
    /// Directories that could not be created.
    pub failures: BTreeMap<VirtualPath, MaterializeError>,
}

impl MaterializeReport {
    /// The failure that makes `dir` unusable: its own, or an ancestor's.
    pub fn failure_for(&self, dir: &VirtualPath) -> Option<(&VirtualPath, &MaterializeError)> {
        if self.failures.is_empty() {
            return None;
        }
        dir.ancestors()
            .iter()
            .chain(std::iter::once(dir))
            .find_map(|p| self.failures.get_key_value(p))
    }

    /// Whether every requested directory is present.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Derive the directories a set of file paths needs: every proper ancestor
/// of each path.
pub fn ancestor_dirs<'a>(files: impl IntoIterator<Item = &'a VirtualPath>) -> BTreeSet<VirtualPath> {
    files.into_iter().flat_map(VirtualPath::ancestors).collect()
}

/// Order directories for creation: by depth, then lexicographically.
///
/// Ancestors of the given directories are added so the plan is closed
/// under parent, and the root is dropped.
pub fn creation_plan(dirs: impl IntoIterator<Item = VirtualPath>) -> Vec<VirtualPath> {
    let mut all = BTreeSet::new();
    for dir in dirs {
        if dir.is_root() {
            continue;
        }
        all.extend(dir.ancestors());
        all.insert(dir);
    }

    let mut plan: Vec<VirtualPath> = all.into_iter().collect();
    plan.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.cmp(b)));
    plan
}

/// Creates missing directories beneath the storage root.
#[derive(Debug, Clone)]
pub struct DirectoryMaterializer {
    resolver: Arc<PathResolver>,
}

impl DirectoryMaterializer {
    /// Create a materializer over a resolver.
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// Ensure every directory in `dirs` (and its ancestors) exists.
    ///
    /// Directories are created one level at a time in depth order. Existing
    /// directories are not an error, so running the same set twice is a
    /// no-op the second time. A failed directory marks all of its
    /// descendants failed without touching them; unrelated branches carry on.
    pub async fn ensure(&self, dirs: impl IntoIterator<Item = VirtualPath>) -> MaterializeReport {
        let mut report = MaterializeReport::default();

        for dir in creation_plan(dirs) {
            if let Some((failed, _)) = report.failure_for(&dir) {
                let failed = failed.clone();
                report
                    .failures
                    .insert(dir, MaterializeError::AncestorFailed(failed));
                continue;
            }

            match self.ensure_one(&dir).await {
                Ok(true) => {
                    debug!(path = %dir, "Created directory");
                    report.created.push(dir);
                }
                Ok(false) => report.existing.push(dir),
                Err(e) => {
                    warn!(path = %dir, error = %e, "Failed to create directory");
                    report.failures.insert(dir, e);
                }
            }
        }

        report
    }

    /// Create a single directory whose parent already exists.
    ///
    /// Returns `true` when this call created it.
    async fn ensure_one(&self, dir: &VirtualPath) -> Result<bool, MaterializeError> {
        let absolute = self.resolver.resolve(dir).await?;

        match tokio::fs::create_dir(&absolute).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let metadata = tokio::fs::metadata(&absolute).await?;
                if metadata.is_dir() {
                    Ok(false)
                } else {
                    Err(MaterializeError::NotADirectory(dir.clone()))
                }
            }
            Err(e) => Err(MaterializeError::Io(e)),
        }
    }
}
