//! Namespace-safe file management over a single storage root.
//!
//! This module provides the filesystem side of cloudshelf:
//! - Path validation and containment checks ([`resolver`])
//! - Collision-free naming with exclusive claims ([`namer`])
//! - Ancestor directory creation for upload batches ([`materializer`])
//! - Batch ingestion with staged, atomic commits ([`ingest`])
//! - Listings and recursive trees ([`browser`])
//! - Recursive removal ([`remover`])
//!
//! # Security
//!
//! Every path coming from a client is parsed into a [`VirtualPath`] and
//! resolved by the [`PathResolver`] before any filesystem call. Resolution
//! canonicalizes the deepest existing ancestor, so symlinks that point
//! outside the storage root are rejected as well.
//!
//! # Internal entries
//!
//! Staged uploads and entries being removed live next to their final
//! location under names starting with [`INTERNAL_PREFIX`]. They are hidden
//! from every listing and can never be addressed by a client path.

pub mod browser;
pub mod ingest;
pub mod materializer;
pub mod namer;
pub mod remover;
pub mod resolver;

pub use browser::{BrowseError, NamespaceBrowser};
pub use ingest::{
    sweep_internal_entries, ByteSource, ConflictPolicy, IngestError, IngestOptions, UploadBatch,
    UploadIngestor, UploadItem,
};
pub use materializer::{DirectoryMaterializer, MaterializeError, MaterializeReport};
pub use namer::{ConflictNamer, NameError};
pub use remover::{EntryRemover, RemoveError};
pub use resolver::{PathError, PathResolver, VirtualPath};

/// Prefix of every internal staging or trash entry.
pub const INTERNAL_PREFIX: &str = ".cloudshelf-";

const STAGING_SUFFIX: &str = ".part";
const TRASH_SUFFIX: &str = ".trash";

/// Whether a directory entry name belongs to cloudshelf itself.
pub fn is_internal_name(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// A fresh, random staging file name.
pub(crate) fn staging_name() -> String {
    internal_name(STAGING_SUFFIX)
}

/// A fresh, random trash entry name.
pub(crate) fn trash_name() -> String {
    internal_name(TRASH_SUFFIX)
}

fn internal_name(suffix: &str) -> String {
    format!("{INTERNAL_PREFIX}{:016x}{suffix}", rand::random::<u64>())
}

/// Milliseconds since the Unix epoch, zero for times before it.
pub(crate) fn epoch_millis(time: std::time::SystemTime) -> u64 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
