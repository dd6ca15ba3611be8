//! Multipart upload form decoding.
//!
//! Each `files` part is streamed into its own spool file while its size and
//! SHA-256 are computed. Bytes beyond the size limit are counted but not
//! written, so an oversized part costs no more disk than the limit; the
//! ingestor then rejects it by size.
//!
//! Recognised fields:
//! - `files`: file parts. A file name containing separators carries the
//!   part's folder-relative path. Parts without a file name (an empty file
//!   input) are skipped.
//! - `relativePath`: optional text fields, paired with file parts by order.
//! - `destination`: optional virtual folder all items are placed under.
//! - `folders`: optional JSON array of folders to create under the
//!   destination even when empty.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::multipart::{Field, Multipart};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ApiError;
use crate::files::{UploadBatch, UploadItem, VirtualPath};

/// Prefix of every spool file name.
pub const SPOOL_PREFIX: &str = "part-";

/// A received file part.
#[derive(Debug)]
struct SpooledPart {
    file_name: String,
    spool: PathBuf,
    size: u64,
    sha256: String,
    mime_type: Option<String>,
}

/// Spool files of a form being decoded, removed on drop unless released.
///
/// Covers decode errors and a client that disconnects mid-body, which drops
/// the handler future with parts already on disk.
#[derive(Debug, Default)]
struct SpoolGuard {
    paths: Vec<PathBuf>,
}

impl SpoolGuard {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Hand the files over to the caller.
    fn release(mut self) {
        self.paths.clear();
    }
}

impl Drop for SpoolGuard {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = ?path, "Removed abandoned spool file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove spool file"),
            }
        }
    }
}

#[derive(Debug, Default)]
struct UploadForm {
    spooled: SpoolGuard,
    parts: Vec<SpooledPart>,
    relative_paths: Vec<String>,
    destination: Option<String>,
    folders: Option<String>,
}

/// Decode an upload form into a batch for `user`.
///
/// Spool files already written are removed when decoding fails or the
/// future is dropped; on success the batch owns them.
pub async fn read_upload(
    multipart: Multipart,
    spool_dir: &Path,
    max_file_size: u64,
    user: &str,
) -> Result<UploadBatch, ApiError> {
    let mut form = UploadForm::default();
    collect(multipart, spool_dir, max_file_size, &mut form).await?;
    let mut batch = into_batch(&form, user)?;

    let UploadForm {
        spooled,
        parts,
        relative_paths,
        ..
    } = form;
    for (index, part) in parts.into_iter().enumerate() {
        let mut item = UploadItem::spooled(leaf_name(&part.file_name), part.spool, part.size, part.sha256);
        match relative_paths.get(index).filter(|p| !p.is_empty()) {
            Some(relative) => item = item.with_relative_path(relative.clone()),
            None if has_separator(&part.file_name) => item = item.with_relative_path(part.file_name),
            None => {}
        }
        if let Some(mime) = part.mime_type {
            item = item.with_mime_type(mime);
        }
        batch.push(item);
    }
    spooled.release();
    Ok(batch)
}

async fn collect(
    mut multipart: Multipart,
    spool_dir: &Path,
    max_file_size: u64,
    form: &mut UploadForm,
) -> Result<(), ApiError> {
    tokio::fs::create_dir_all(spool_dir)
        .await
        .map_err(|e| ApiError::Io(format!("failed to create spool directory: {e}")))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed upload: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" if field.file_name().is_none_or(str::is_empty) => {
                debug!("Skipping file part without a name");
            }
            "files" | "file" => {
                let part = spool(field, spool_dir, max_file_size, &mut form.spooled).await?;
                debug!(file = %part.file_name, size = part.size, "Received upload part");
                form.parts.push(part);
            }
            "relativePath" | "relativePaths" => form.relative_paths.push(text(field).await?),
            "destination" => form.destination = Some(text(field).await?),
            "folders" => form.folders = Some(text(field).await?),
            other => {
                debug!(field = %other, "Ignoring unknown upload field");
                text(field).await?;
            }
        }
    }
    Ok(())
}

async fn text(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed upload field: {e}")))
}

async fn spool(
    mut field: Field<'_>,
    spool_dir: &Path,
    max_file_size: u64,
    spooled: &mut SpoolGuard,
) -> Result<SpooledPart, ApiError> {
    let file_name = field.file_name().unwrap_or_default().to_string();
    let mime_type = field.content_type().map(str::to_string);
    let spool = spool_dir.join(format!("{SPOOL_PREFIX}{}", Uuid::new_v4()));

    let mut file = tokio::fs::File::create(&spool)
        .await
        .map_err(|e| ApiError::Io(format!("failed to create spool file: {e}")))?;
    spooled.track(spool.clone());
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::BadRequest(format!("upload interrupted: {e}")))?
    {
        size += chunk.len() as u64;
        if size > max_file_size {
            continue;
        }
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| ApiError::Io(format!("failed to spool upload: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| ApiError::Io(format!("failed to spool upload: {e}")))?;

    Ok(SpooledPart {
        file_name,
        spool,
        size,
        sha256: hex::encode(hasher.finalize()),
        mime_type,
    })
}

fn into_batch(form: &UploadForm, user: &str) -> Result<UploadBatch, ApiError> {
    if form.parts.is_empty() {
        return Err(ApiError::BadRequest("No files uploaded".to_string()));
    }

    let destination = match form.destination.as_deref() {
        Some(raw) => VirtualPath::parse(raw).map_err(|e| ApiError::InvalidPath(e.to_string()))?,
        None => VirtualPath::root(),
    };

    let mut batch = UploadBatch::new(destination, user);
    if let Some(raw) = form.folders.as_deref().filter(|f| !f.trim().is_empty()) {
        let folders: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| ApiError::BadRequest(format!("folders must be a JSON array of paths: {e}")))?;
        batch.folders = folders
            .iter()
            .map(|f| VirtualPath::parse(f).map_err(|e| ApiError::InvalidPath(e.to_string())))
            .collect::<Result<_, _>>()?;
    }
    Ok(batch)
}

fn has_separator(name: &str) -> bool {
    name.contains('/') || name.contains('\\')
}

/// Last component of a client file name.
fn leaf_name(file_name: &str) -> String {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .to_string()
}

/// Remove spool files older than `max_age` from `spool_dir`, left behind
/// by batches that never reached the ingestor. Returns the number removed.
pub async fn sweep_spool(spool_dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut read_dir = match tokio::fs::read_dir(spool_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let is_spool = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(SPOOL_PREFIX));
        if !is_spool {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|t| t.elapsed().ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(path = ?entry.path(), "Swept stale spool file");
                removed += 1;
            }
            Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to sweep spool file"),
        }
    }
    Ok(removed)
}
