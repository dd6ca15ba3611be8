//! Directory listings and recursive trees of the namespace.
//!
//! Listings are derived live from the filesystem on every call. Internal
//! staging and trash entries and symbolic links are never reported: the
//! server does not create links, so they are not part of the namespace.

use std::cmp::Ordering;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use protocol::{EntryKind, ListingEntry, TreeNode};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::debug;

use super::resolver::{PathError, PathResolver, VirtualPath};
use super::{epoch_millis, is_internal_name};

/// Errors that can occur while browsing.
#[derive(Debug, Error)]
pub enum BrowseError {
    /// The path failed validation or resolution.
    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    /// Nothing exists at the path.
    #[error("not found: {0}")]
    NotFound(VirtualPath),

    /// The path is a directory where a file was expected.
    #[error("not a file: {0}")]
    NotAFile(VirtualPath),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Order names case-insensitively, lowercase first on ties.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.cmp(a))
}

/// Folders first, then by name.
fn compare_entries(a: &ListingEntry, b: &ListingEntry) -> Ordering {
    b.kind
        .is_folder()
        .cmp(&a.kind.is_folder())
        .then_with(|| compare_names(&a.name, &b.name))
}

type TreeFuture = Pin<Box<dyn Future<Output = Result<TreeNode, BrowseError>> + Send>>;

/// Read-only views of the namespace.
#[derive(Debug, Clone)]
pub struct NamespaceBrowser {
    resolver: Arc<PathResolver>,
}

impl NamespaceBrowser {
    /// Create a browser over a resolver.
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    /// List the immediate children of `dir`.
    ///
    /// A missing directory, or a path naming a regular file, lists as empty.
    pub async fn list(&self, dir: &VirtualPath) -> Result<Vec<ListingEntry>, BrowseError> {
        let absolute = self.resolver.resolve(dir).await?;

        let mut read_dir = match fs::read_dir(&absolute).await {
            Ok(rd) => rd,
            Err(e) if is_absent(&e) => {
                debug!(path = %dir, "Listing missing directory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(BrowseError::Io(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if is_internal_name(&name) {
                continue;
            }

            // Entries can vanish between readdir and stat.
            let metadata = match fs::symlink_metadata(entry.path()).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.file_type().is_symlink() {
                continue;
            }

            let kind = if metadata.is_dir() {
                EntryKind::Folder
            } else if metadata.is_file() {
                EntryKind::File
            } else {
                continue;
            };

            let modified = metadata.modified().map(epoch_millis).unwrap_or(0);
            let created = metadata.created().map(epoch_millis).unwrap_or(modified);

            // Names a client could not address are left out.
            let path = match VirtualPath::segment(&name) {
                Ok(segment) => dir.join(&segment).to_string(),
                Err(_) => continue,
            };
            entries.push(ListingEntry {
                name,
                path,
                kind,
                size: (kind == EntryKind::File).then(|| metadata.len()),
                modified,
                created,
            });
        }

        entries.sort_by(compare_entries);
        Ok(entries)
    }

    /// Build the recursive tree below `dir`.
    ///
    /// A missing directory yields an empty tree.
    pub async fn tree(&self, dir: &VirtualPath) -> Result<TreeNode, BrowseError> {
        let absolute = self.resolver.resolve(dir).await?;
        walk(absolute).await
    }

    /// Open a file for download, returning the handle and its length.
    pub async fn open(&self, path: &VirtualPath) -> Result<(File, u64), BrowseError> {
        let absolute = self.resolver.resolve(path).await?;

        let metadata = match fs::metadata(&absolute).await {
            Ok(m) => m,
            Err(e) if is_absent(&e) => return Err(BrowseError::NotFound(path.clone())),
            Err(e) => return Err(BrowseError::Io(e)),
        };
        if !metadata.is_file() {
            return Err(BrowseError::NotAFile(path.clone()));
        }

        let file = File::open(&absolute).await?;
        Ok((file, metadata.len()))
    }

    /// Absolute location of the storage root.
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }
}

fn walk(dir: PathBuf) -> TreeFuture {
    Box::pin(async move {
        let mut node = TreeNode::default();

        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if is_absent(&e) => return Ok(node),
            Err(e) => return Err(BrowseError::Io(e)),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if is_internal_name(&name) || VirtualPath::segment(&name).is_err() {
                continue;
            }

            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                let child = walk(entry.path()).await?;
                node.folders.insert(name, child);
            } else if file_type.is_file() {
                node.files.push(name);
            }
        }

        node.files.sort_by(|a, b| compare_names(a, b));
        Ok(node)
    })
}

fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}
