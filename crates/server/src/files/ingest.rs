//! Upload batch ingestion.
//!
//! A batch is processed in two phases:
//! 1. Every item's declared path is parsed and joined onto the destination;
//!    the union of all parent directories (plus any explicitly requested
//!    folders) is materialized once.
//! 2. Items are committed concurrently. Each item's bytes are staged under a
//!    hidden name in its final directory and then claimed under a free name,
//!    so a partially written file is never visible at a final path.
//!
//! One item failing never affects the others. Items aimed at the same path
//! claim their names in submission order, so the first keeps the base name
//! whatever the concurrency. Progress is published per finished item, in
//! completion order.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use protocol::{ProgressEvent, UploadItemResult, UploadResponse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::materializer::{DirectoryMaterializer, MaterializeReport};
use super::namer::{ConflictNamer, NameError};
use super::remover::purge;
use super::resolver::{PathError, PathResolver, VirtualPath};
use super::{is_internal_name, staging_name};
use crate::audit::{AuditLog, AuditRecord};
use crate::progress::ProgressHub;

/// Default maximum size of a single uploaded file (500 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Default number of items committed concurrently per batch.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// What to do when the target name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the existing entry and pick `name (n).ext`.
    #[default]
    Rename,
    /// Atomically replace an existing file.
    Overwrite,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Rename => f.write_str("rename"),
            ConflictPolicy::Overwrite => f.write_str("overwrite"),
        }
    }
}

/// Ingestion limits and policies.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Largest accepted item, in bytes.
    pub max_file_size: u64,
    /// Items committed concurrently.
    pub concurrency: usize,
    /// Name collision handling.
    pub conflict_policy: ConflictPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            conflict_policy: ConflictPolicy::Rename,
        }
    }
}

/// Why a single item was not committed.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The declared path failed validation or resolution.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// The declared path names no file.
    #[error("invalid path: empty file name")]
    EmptyName,

    /// The item exceeds the size limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Item size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The item's directory could not be created.
    #[error("directory unavailable: {0}")]
    Directory(String),

    /// The batch was cancelled before this item started.
    #[error("upload cancelled")]
    Cancelled,

    /// No free name could be claimed.
    #[error(transparent)]
    Name(#[from] NameError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where an item's bytes come from.
#[derive(Debug)]
pub enum ByteSource {
    /// Bytes held in memory.
    Memory(Bytes),
    /// A spool file the ingestor takes ownership of.
    Spooled(PathBuf),
}

impl ByteSource {
    /// Move the bytes into a new file at `staged`.
    ///
    /// A spool file is renamed when possible and copied otherwise; either
    /// way it is gone afterwards.
    async fn stage_to(self, staged: &Path) -> io::Result<()> {
        match self {
            ByteSource::Memory(bytes) => {
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(staged)
                    .await?;
                file.write_all(&bytes).await?;
                file.flush().await?;
                Ok(())
            }
            ByteSource::Spooled(spool) => {
                if tokio::fs::rename(&spool, staged).await.is_ok() {
                    return Ok(());
                }
                let copied = tokio::fs::copy(&spool, staged).await;
                discard_spool(&spool).await;
                copied.map(|_| ())
            }
        }
    }

    /// Drop the bytes without committing them.
    async fn discard(self) {
        if let ByteSource::Spooled(spool) = self {
            discard_spool(&spool).await;
        }
    }
}

async fn discard_spool(spool: &Path) {
    if let Err(e) = tokio::fs::remove_file(spool).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?spool, error = %e, "Failed to remove spool file");
        }
    }
}

/// One entry of an upload batch.
#[derive(Debug)]
pub struct UploadItem {
    /// Leaf name the client declared.
    pub leaf_name: String,
    /// Folder-relative path the client captured the item from, including the
    /// leaf name, e.g. `photos/2024/trip.jpg`.
    pub relative_path: Option<String>,
    /// The bytes.
    pub source: ByteSource,
    /// Size of the bytes.
    pub size: u64,
    /// MIME type the client declared.
    pub mime_type: Option<String>,
    /// Hex SHA-256 of the bytes, when already known.
    pub sha256: Option<String>,
}

impl UploadItem {
    /// An item held in memory.
    pub fn from_bytes(leaf_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            leaf_name: leaf_name.into(),
            relative_path: None,
            size: data.len() as u64,
            sha256: Some(hex::encode(Sha256::digest(&data))),
            source: ByteSource::Memory(data),
            mime_type: None,
        }
    }

    /// An item already written to a spool file.
    pub fn spooled(leaf_name: impl Into<String>, spool: PathBuf, size: u64, sha256: String) -> Self {
        Self {
            leaf_name: leaf_name.into(),
            relative_path: None,
            source: ByteSource::Spooled(spool),
            size,
            mime_type: None,
            sha256: Some(sha256),
        }
    }

    /// Set the declared relative path.
    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    /// Set the declared MIME type.
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    /// Name reported back to the client.
    pub fn display_name(&self) -> &str {
        self.relative_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.leaf_name)
    }
}

/// A set of items submitted together.
#[derive(Debug, Default)]
pub struct UploadBatch {
    /// Progress id of the batch.
    pub id: Uuid,
    /// Items in submission order.
    pub items: Vec<UploadItem>,
    /// Directory the items are placed under.
    pub destination: VirtualPath,
    /// Extra folders to create under the destination, even if empty.
    pub folders: Vec<VirtualPath>,
    /// Account submitting the batch.
    pub user: String,
}

impl UploadBatch {
    /// An empty batch targeting `destination`.
    pub fn new(destination: VirtualPath, user: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            user: user.into(),
            ..Self::default()
        }
    }

    /// Append an item.
    pub fn push(&mut self, item: UploadItem) {
        self.items.push(item);
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch has no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Commits upload batches into the namespace.
#[derive(Debug)]
pub struct UploadIngestor {
    resolver: Arc<PathResolver>,
    materializer: DirectoryMaterializer,
    namer: ConflictNamer,
    progress: Arc<ProgressHub>,
    audit: Option<Arc<AuditLog>>,
    options: IngestOptions,
}

impl UploadIngestor {
    /// Create an ingestor.
    pub fn new(resolver: Arc<PathResolver>, progress: Arc<ProgressHub>, options: IngestOptions) -> Self {
        Self {
            materializer: DirectoryMaterializer::new(Arc::clone(&resolver)),
            resolver,
            namer: ConflictNamer::default(),
            progress,
            audit: None,
            options,
        }
    }

    /// Record every committed item in `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Active options.
    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Ingest a batch.
    ///
    /// Once `cancel` fires, items that have not started are failed with
    /// [`IngestError::Cancelled`]; items already being committed finish.
    pub async fn ingest(&self, batch: UploadBatch, cancel: CancellationToken) -> UploadResponse {
        let UploadBatch {
            id: batch_id,
            items,
            destination,
            folders,
            user,
        } = batch;

        let total = items.len();
        self.progress.begin(batch_id, &user, &destination.to_string(), total);
        info!(%batch_id, user = %user, destination = %destination, total, "Ingesting upload batch");

        let planned: Vec<(UploadItem, Result<VirtualPath, IngestError>)> = items
            .into_iter()
            .map(|item| {
                let target = target_path(&destination, &item);
                (item, target)
            })
            .collect();

        let mut dirs = vec![destination.clone()];
        dirs.extend(folders.iter().map(|f| destination.join(f)));
        dirs.extend(
            planned
                .iter()
                .filter_map(|(_, target)| target.as_ref().ok().and_then(VirtualPath::parent)),
        );
        let report = self.materializer.ensure(dirs).await;

        let mut turns: HashMap<VirtualPath, Arc<Mutex<()>>> = HashMap::new();
        let report = &report;
        let user = user.as_str();
        let cancel = &cancel;
        let pending: Vec<_> = planned
            .into_iter()
            .map(|(item, target)| {
                let turn = target
                    .as_ref()
                    .ok()
                    .map(|t| Arc::clone(turns.entry(t.clone()).or_default()));
                self.process(item, target, turn, report, user, cancel)
            })
            .collect();
        let mut outcomes =
            stream::iter(pending).buffer_unordered(self.options.concurrency.max(1));

        let mut results = Vec::with_capacity(total);
        let mut processed = 0;
        while let Some((result, folder)) = outcomes.next().await {
            processed += 1;
            let mut event = ProgressEvent::new(batch_id, processed, total)
                .with_current(result.filename.clone(), folder);
            if processed == total {
                event = event.finished();
            }
            self.progress.publish(event);
            results.push(result);
        }

        if total == 0 {
            self.progress
                .publish(ProgressEvent::new(batch_id, 0, 0).finished());
        }

        let response = UploadResponse::from_results(results);
        info!(
            %batch_id,
            successful = response.successful,
            errors = response.errors,
            "Upload batch finished"
        );
        response
    }

    /// Commit one item and turn the outcome into a result entry plus the
    /// virtual folder it was aimed at.
    ///
    /// `turn` is shared by all items with the same target; it is locked on
    /// the first poll, and futures are first polled in submission order.
    async fn process(
        &self,
        item: UploadItem,
        target: Result<VirtualPath, IngestError>,
        turn: Option<Arc<Mutex<()>>>,
        report: &MaterializeReport,
        user: &str,
        cancel: &CancellationToken,
    ) -> (UploadItemResult, String) {
        let _turn = match &turn {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let filename = item.display_name().to_string();
        let folder = target
            .as_ref()
            .ok()
            .and_then(VirtualPath::parent)
            .map(|p| p.to_string())
            .unwrap_or_default();

        let result = match self.commit(item, target, report, user, cancel).await {
            Ok(path) => UploadItemResult::success(filename, path.to_string()),
            Err(e) => {
                warn!(item = %filename, error = %e, "Upload item failed");
                UploadItemResult::error(filename, e.to_string())
            }
        };
        (result, folder)
    }

    async fn commit(
        &self,
        item: UploadItem,
        target: Result<VirtualPath, IngestError>,
        report: &MaterializeReport,
        user: &str,
        cancel: &CancellationToken,
    ) -> Result<VirtualPath, IngestError> {
        let (target, directory) = match self.check(&item, target, report, cancel).await {
            Ok(checked) => checked,
            Err(e) => {
                item.source.discard().await;
                return Err(e);
            }
        };

        let UploadItem {
            source,
            size,
            sha256,
            mime_type,
            ..
        } = item;

        let leaf = match target.file_name() {
            Some(leaf) => leaf,
            None => {
                source.discard().await;
                return Err(IngestError::EmptyName);
            }
        };

        let staged = directory.join(staging_name());
        if let Err(e) = source.stage_to(&staged).await {
            remove_staged(&staged).await;
            return Err(IngestError::Io(e));
        }

        let final_abs = match self.claim(&staged, &directory, leaf).await {
            Ok(path) => path,
            Err(e) => {
                remove_staged(&staged).await;
                return Err(e);
            }
        };

        let final_name = final_abs
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(IngestError::EmptyName)?;
        let parent = target.parent().unwrap_or_default();
        let committed = parent.join(&VirtualPath::segment(final_name)?);

        info!(path = %committed, size, mime = ?mime_type, "Committed upload");

        if let Some(audit) = &self.audit {
            let sha256 = match sha256 {
                Some(digest) => digest,
                None => digest_committed(&final_abs).await,
            };
            audit
                .record(AuditRecord::now(user, &committed.to_string(), size, &sha256))
                .await;
        }

        Ok(committed)
    }

    /// Validate an item before any bytes move; returns its target and the
    /// absolute directory it is committed into.
    async fn check(
        &self,
        item: &UploadItem,
        target: Result<VirtualPath, IngestError>,
        report: &MaterializeReport,
        cancel: &CancellationToken,
    ) -> Result<(VirtualPath, PathBuf), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let target = target?;
        if item.size > self.options.max_file_size {
            return Err(IngestError::TooLarge {
                size: item.size,
                limit: self.options.max_file_size,
            });
        }

        let parent = target.parent().ok_or(IngestError::EmptyName)?;
        if let Some((failed, e)) = report.failure_for(&parent) {
            return Err(IngestError::Directory(format!("{failed}: {e}")));
        }

        let directory = self.resolver.resolve(&parent).await?;
        Ok((target, directory))
    }

    async fn claim(&self, staged: &Path, directory: &Path, leaf: &str) -> Result<PathBuf, IngestError> {
        match self.options.conflict_policy {
            ConflictPolicy::Rename => Ok(self.namer.uniquify(staged, directory, leaf).await?),
            ConflictPolicy::Overwrite => {
                let target = directory.join(leaf);
                tokio::fs::rename(staged, &target).await?;
                Ok(target)
            }
        }
    }
}

/// Destination joined with the item's declared path.
fn target_path(destination: &VirtualPath, item: &UploadItem) -> Result<VirtualPath, IngestError> {
    let relative = VirtualPath::parse(item.display_name())?;
    if relative.is_root() {
        return Err(IngestError::EmptyName);
    }
    Ok(destination.join(&relative))
}

async fn remove_staged(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?staged, error = %e, "Failed to remove staging file");
        }
    }
}

/// Digest of a file that is already committed. The item stays a success
/// when hashing fails; the audit record then carries an empty digest.
async fn digest_committed(path: &Path) -> String {
    match hash_file(path).await {
        Ok(digest) => digest,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to hash committed upload");
            String::new()
        }
    }
}

/// Compute the hex SHA-256 of a file.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Remove internal staging and trash entries older than `max_age` anywhere
/// under `root`. Returns the number removed.
pub async fn sweep_internal_entries(root: &Path, max_age: Duration) -> io::Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            let is_internal = entry
                .file_name()
                .to_str()
                .map(is_internal_name)
                .unwrap_or(false);

            if !is_internal {
                if file_type.is_dir() {
                    pending.push(entry.path());
                }
                continue;
            }

            let age = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }

            match purge(&entry.path(), file_type.is_dir()).await {
                Ok(()) => {
                    debug!(path = ?entry.path(), "Swept stale internal entry");
                    removed += 1;
                }
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to sweep internal entry"),
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::NamespaceBrowser;
    use protocol::{TreeNode, UploadStatus};
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        ingestor: UploadIngestor,
        browser: NamespaceBrowser,
        progress: Arc<ProgressHub>,
    }

    fn fixture(options: IngestOptions) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let resolver = Arc::new(PathResolver::new(temp_dir.path()).unwrap());
        let progress = Arc::new(ProgressHub::default());
        Fixture {
            ingestor: UploadIngestor::new(Arc::clone(&resolver), Arc::clone(&progress), options),
            browser: NamespaceBrowser::new(resolver),
            progress,
            temp_dir,
        }
    }

    fn sequential() -> IngestOptions {
        IngestOptions {
            concurrency: 1,
            ..IngestOptions::default()
        }
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    fn batch(destination: &str, items: Vec<UploadItem>) -> UploadBatch {
        let mut batch = UploadBatch::new(vp(destination), "tester");
        for item in items {
            batch.push(item);
        }
        batch
    }

    fn internal_entries(root: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                if is_internal_name(entry.file_name().to_str().unwrap()) {
                    found.push(entry.path());
                } else if entry.file_type().unwrap().is_dir() {
                    pending.push(entry.path());
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn test_duplicate_names_are_uniquified() {
        let f = fixture(sequential());

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("x.txt", "A"),
                        UploadItem::from_bytes("x.txt", "B"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert!(response.success);
        assert_eq!(response.successful, 2);
        assert_eq!(response.results[0].path.as_deref(), Some("x.txt"));
        assert_eq!(response.results[1].path.as_deref(), Some("x (1).txt"));
        assert_eq!(std::fs::read(f.temp_dir.path().join("x.txt")).unwrap(), b"A");
        assert_eq!(std::fs::read(f.temp_dir.path().join("x (1).txt")).unwrap(), b"B");
    }

    #[tokio::test]
    async fn test_many_identical_names_concurrently() {
        let f = fixture(IngestOptions {
            concurrency: 8,
            ..IngestOptions::default()
        });
        std::fs::create_dir(f.temp_dir.path().join("dir")).unwrap();

        let items = (0..12u8)
            .map(|i| UploadItem::from_bytes("same.dat", vec![i]))
            .collect();
        let response = f
            .ingestor
            .ingest(batch("dir", items), CancellationToken::new())
            .await;

        assert_eq!(response.successful, 12);
        assert_eq!(response.results.iter().filter(|r| r.path.as_deref() == Some("dir/same.dat")).count(), 1);
        assert_eq!(std::fs::read(f.temp_dir.path().join("dir/same.dat")).unwrap(), [0u8]);
        let listing = f.browser.list(&vp("dir")).await.unwrap();
        assert_eq!(listing.len(), 12);
        assert!(listing.iter().any(|e| e.name == "same.dat"));
        let mut contents: Vec<Vec<u8>> = listing
            .iter()
            .map(|e| std::fs::read(f.temp_dir.path().join(&e.path)).unwrap())
            .collect();
        contents.sort();
        contents.dedup();
        assert_eq!(contents.len(), 12);
    }

    #[tokio::test]
    async fn test_tree_round_trip() {
        let f = fixture(IngestOptions::default());

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("c.txt", "c").with_relative_path("a/b/c.txt"),
                        UploadItem::from_bytes("d.txt", "d").with_relative_path("a/d.txt"),
                        UploadItem::from_bytes("e.txt", "e"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.successful, 3);

        let tree = f.browser.tree(&VirtualPath::root()).await.unwrap();
        let mut b = TreeNode::default();
        b.files.push("c.txt".to_string());
        let mut a = TreeNode::default();
        a.folders.insert("b".to_string(), b);
        a.files.push("d.txt".to_string());
        let mut expected = TreeNode::default();
        expected.folders.insert("a".to_string(), a);
        expected.files.push("e.txt".to_string());
        assert_eq!(tree, expected);
    }

    #[tokio::test]
    async fn test_partial_failure_on_escape() {
        let f = fixture(sequential());

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("one.txt", "1"),
                        UploadItem::from_bytes("passwder", "x")
                            .with_relative_path("../../etc/passwder"),
                        UploadItem::from_bytes("three.txt", "3"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert!(response.success);
        assert_eq!(response.successful, 2);
        assert_eq!(response.errors, 1);
        let failed = &response.results[1];
        assert_eq!(failed.status, UploadStatus::Error);
        assert!(failed.error.as_deref().unwrap().starts_with("invalid path"));

        let parent = f.temp_dir.path().parent().unwrap();
        assert!(!parent.join("etc/passwder").exists());
        assert!(!parent.join("passwder").exists());
    }

    #[tokio::test]
    async fn test_destination_and_folders() {
        let f = fixture(IngestOptions::default());

        let mut upload = batch(
            "projects/site",
            vec![UploadItem::from_bytes("index.html", "<html>").with_relative_path("web/index.html")],
        );
        upload.folders = vec![vp("web/empty"), vp("assets")];
        let response = f.ingestor.ingest(upload, CancellationToken::new()).await;

        assert_eq!(response.results[0].path.as_deref(), Some("projects/site/web/index.html"));
        let root = f.temp_dir.path();
        assert!(root.join("projects/site/web/index.html").is_file());
        assert!(root.join("projects/site/web/empty").is_dir());
        assert!(root.join("projects/site/assets").is_dir());
    }

    #[tokio::test]
    async fn test_file_too_large() {
        let f = fixture(IngestOptions {
            max_file_size: 4,
            ..IngestOptions::default()
        });

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("small", "1234"),
                        UploadItem::from_bytes("big", "12345"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.successful, 1);
        let big = response.results.iter().find(|r| r.filename == "big").unwrap();
        assert!(big.error.as_deref().unwrap().starts_with("file too large"));
        assert!(!f.temp_dir.path().join("big").exists());
    }

    #[tokio::test]
    async fn test_blocked_directory_fails_only_its_items() {
        let f = fixture(IngestOptions::default());
        std::fs::write(f.temp_dir.path().join("blocked"), b"file").unwrap();

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("a", "a").with_relative_path("blocked/sub/a"),
                        UploadItem::from_bytes("b", "b").with_relative_path("open/b"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.successful, 1);
        let a = response.results.iter().find(|r| r.filename == "blocked/sub/a").unwrap();
        assert!(a.error.as_deref().unwrap().starts_with("directory unavailable"));
        assert!(f.temp_dir.path().join("open/b").is_file());
    }

    #[tokio::test]
    async fn test_cancelled_batch_commits_nothing() {
        let f = fixture(IngestOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let response = f
            .ingestor
            .ingest(
                batch("", vec![UploadItem::from_bytes("x", "x"), UploadItem::from_bytes("y", "y")]),
                cancel,
            )
            .await;

        assert!(!response.success);
        assert_eq!(response.errors, 2);
        assert!(response
            .results
            .iter()
            .all(|r| r.error.as_deref() == Some("upload cancelled")));
        assert!(f.browser.list(&VirtualPath::root()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_policy_replaces() {
        let f = fixture(IngestOptions {
            conflict_policy: ConflictPolicy::Overwrite,
            ..IngestOptions::default()
        });
        std::fs::write(f.temp_dir.path().join("x.txt"), b"old").unwrap();

        let response = f
            .ingestor
            .ingest(batch("", vec![UploadItem::from_bytes("x.txt", "new")]), CancellationToken::new())
            .await;

        assert_eq!(response.results[0].path.as_deref(), Some("x.txt"));
        assert_eq!(std::fs::read(f.temp_dir.path().join("x.txt")).unwrap(), b"new");
        assert_eq!(f.browser.list(&VirtualPath::root()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spooled_source_is_consumed() {
        let f = fixture(IngestOptions::default());
        let spool_dir = TempDir::new().unwrap();
        let spool = spool_dir.path().join("part-1");
        std::fs::write(&spool, b"spooled").unwrap();
        let sha = hash_file(&spool).await.unwrap();

        let bad_spool = spool_dir.path().join("part-2");
        std::fs::write(&bad_spool, b"rejected").unwrap();

        let response = f
            .ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::spooled("s.bin", spool.clone(), 7, sha),
                        UploadItem::spooled("..", bad_spool.clone(), 8, String::new()),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(response.successful, 1);
        assert_eq!(std::fs::read(f.temp_dir.path().join("s.bin")).unwrap(), b"spooled");
        assert!(!spool.exists());
        assert!(!bad_spool.exists());
    }

    #[tokio::test]
    async fn test_progress_events_follow_completion() {
        let f = fixture(IngestOptions::default());
        let mut rx = f.progress.subscribe();

        f.ingestor
            .ingest(
                batch(
                    "docs",
                    vec![
                        UploadItem::from_bytes("1", "1"),
                        UploadItem::from_bytes("2", "2"),
                        UploadItem::from_bytes("3", "3"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        let processed: Vec<usize> = events.iter().map(|e| e.processed).collect();
        assert_eq!(processed, [1, 2, 3]);
        assert!(events.iter().all(|e| e.current_folder.as_deref() == Some("docs")));
        assert!(events[2].finished);
        assert_eq!(events[2].percentage, 100);
        assert!(f.progress.active().is_empty());
    }

    #[tokio::test]
    async fn test_audit_records_committed_items() {
        let f = fixture(IngestOptions::default());
        let log_dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditLog::open(log_dir.path().join("uploads.log")).await.unwrap());
        let ingestor = UploadIngestor::new(
            Arc::new(PathResolver::new(f.temp_dir.path()).unwrap()),
            Arc::clone(&f.progress),
            IngestOptions::default(),
        )
        .with_audit(Arc::clone(&audit));

        ingestor
            .ingest(
                batch("", vec![UploadItem::from_bytes("a.txt", "abc"), UploadItem::from_bytes("..", "x")]),
                CancellationToken::new(),
            )
            .await;

        let text = std::fs::read_to_string(audit.path()).unwrap();
        let records: Vec<AuditRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "a.txt");
        assert_eq!(records[0].size, 3);
        assert_eq!(records[0].user, "tester");
        assert_eq!(
            records[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_digest_of_committed_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            digest_committed(&path).await,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        // Unreadable after the claim: logged, not an item failure.
        assert_eq!(digest_committed(&temp_dir.path().join("gone")).await, "");
    }

    #[tokio::test]
    async fn test_no_internal_entries_left_behind() {
        let f = fixture(IngestOptions::default());
        std::fs::write(f.temp_dir.path().join("taken"), b"x").unwrap();

        f.ingestor
            .ingest(
                batch(
                    "",
                    vec![
                        UploadItem::from_bytes("taken", "y"),
                        UploadItem::from_bytes("n", "n").with_relative_path("taken/n"),
                        UploadItem::from_bytes("ok", "ok").with_relative_path("d/ok"),
                    ],
                ),
                CancellationToken::new(),
            )
            .await;

        assert!(internal_entries(f.temp_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_internal_entries() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/.cloudshelf-1.part"), b"x").unwrap();
        std::fs::create_dir_all(root.join(".cloudshelf-2.trash/inner")).unwrap();
        std::fs::write(root.join("a/keep.txt"), b"k").unwrap();

        let fresh = sweep_internal_entries(root, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(fresh, 0);

        let removed = sweep_internal_entries(root, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);
        assert!(internal_entries(root).is_empty());
        assert!(root.join("a/keep.txt").exists());
    }
}
