//! Wire message definitions for Cloudshelf.
//!
//! Every type here serializes to the JSON shape the server sends over HTTP
//! (or over the progress WebSocket). Field names follow the browser front
//! end: listing and upload bodies use lowercase and snake_case names,
//! progress events are camelCase.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

// ============================================================================
// Listing Messages
// ============================================================================

/// Kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Folder,
}

impl EntryKind {
    /// Whether this entry is a directory.
    pub fn is_folder(self) -> bool {
        matches!(self, EntryKind::Folder)
    }
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Virtual path relative to the storage root, `/`-separated.
    pub path: String,
    /// Entry type.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes, `null` for folders.
    pub size: Option<u64>,
    /// Last modified timestamp (Unix epoch milliseconds).
    pub modified: u64,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created: u64,
}

/// Recursive view of a directory.
///
/// `folders` is ordered by name so two trees of the same namespace always
/// serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Child directories keyed by name.
    pub folders: BTreeMap<String, TreeNode>,
    /// Names of the files directly inside this directory.
    pub files: Vec<String>,
}

impl TreeNode {
    /// True when the directory has neither files nor subdirectories.
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// Total number of files in this subtree.
    pub fn file_count(&self) -> usize {
        self.files.len()
            + self
                .folders
                .values()
                .map(TreeNode::file_count)
                .sum::<usize>()
    }

    /// Total number of directories in this subtree, excluding `self`.
    pub fn folder_count(&self) -> usize {
        self.folders.len()
            + self
                .folders
                .values()
                .map(TreeNode::folder_count)
                .sum::<usize>()
    }
}

// ============================================================================
// Upload Messages
// ============================================================================

/// Outcome of a single upload item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// The item was committed.
    Success,
    /// The item was rejected or failed to commit.
    Error,
}

/// Per-item entry of an upload response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadItemResult {
    /// Name the client declared for the item.
    pub filename: String,
    /// Whether the item was committed.
    pub status: UploadStatus,
    /// Final virtual path (success only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Failure reason (error only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadItemResult {
    /// Result for a committed item.
    pub fn success(filename: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: UploadStatus::Success,
            path: Some(path.into()),
            error: None,
        }
    }

    /// Result for a failed item.
    pub fn error(filename: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: UploadStatus::Error,
            path: None,
            error: Some(reason.into()),
        }
    }

    /// Whether the item was committed.
    pub fn is_success(&self) -> bool {
        self.status == UploadStatus::Success
    }
}

/// Batch-level upload response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// True when at least one item was committed.
    pub success: bool,
    /// Number of items in the batch.
    pub total: usize,
    /// Number of committed items.
    pub successful: usize,
    /// Number of failed items.
    pub errors: usize,
    /// Per-item outcomes, in completion order.
    pub results: Vec<UploadItemResult>,
    /// Human-readable summary.
    pub message: String,
}

impl UploadResponse {
    /// Build the aggregate response from per-item results.
    pub fn from_results(results: Vec<UploadItemResult>) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.is_success()).count();
        Self {
            success: successful > 0,
            total,
            successful,
            errors: total - successful,
            message: format!("{successful} of {total} files uploaded successfully"),
            results,
        }
    }
}

// ============================================================================
// Progress Messages
// ============================================================================

/// Progress of an in-flight upload batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Batch this event belongs to.
    pub batch_id: Uuid,
    /// Items finished so far (committed or failed).
    pub processed: usize,
    /// Items in the batch.
    pub total: usize,
    /// Rounded completion percentage, 0..=100.
    pub percentage: u8,
    /// Name of the item that just finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    /// Virtual directory of the item that just finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_folder: Option<String>,
    /// Set on the last event of a batch.
    #[serde(default)]
    pub finished: bool,
}

impl ProgressEvent {
    /// Create an event for `processed` out of `total` items.
    pub fn new(batch_id: Uuid, processed: usize, total: usize) -> Self {
        Self {
            batch_id,
            processed,
            total,
            percentage: percentage(processed, total),
            current_file: None,
            current_folder: None,
            finished: false,
        }
    }

    /// Attach the item that just finished.
    pub fn with_current(mut self, file: impl Into<String>, folder: impl Into<String>) -> Self {
        self.current_file = Some(file.into());
        self.current_folder = Some(folder.into());
        self
    }

    /// Mark this event as the last one of its batch.
    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

fn percentage(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let processed = processed.min(total) as u128;
    let total = total as u128;
    ((processed * 100 + total / 2) / total) as u8
}

/// Snapshot of a batch that is still being ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUpload {
    /// Batch identifier.
    pub batch_id: Uuid,
    /// User who submitted the batch.
    pub user: String,
    /// Target directory of the batch.
    pub destination: String,
    /// Items finished so far.
    pub processed: usize,
    /// Items in the batch.
    pub total: usize,
    /// Start time (Unix epoch milliseconds).
    pub started_at: u64,
}

// ============================================================================
// Mutation Messages
// ============================================================================

/// Response to a single-entry delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Always true; failures use the error body.
    pub success: bool,
}

/// Response to clearing the whole namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAllResponse {
    /// Always true; failures use the error body.
    pub success: bool,
    /// Number of top-level entries removed.
    pub removed: usize,
}

/// Request to create a folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFolderRequest {
    /// Virtual path of the folder to create.
    pub path: String,
}

/// Response to folder creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFolderResponse {
    /// Always true; failures use the error body.
    pub success: bool,
    /// Normalized virtual path of the folder.
    pub path: String,
}

// ============================================================================
// Session Messages
// ============================================================================

/// Privilege level of an authenticated caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access, including deletion.
    Admin,
    /// Upload, browse and download.
    #[default]
    User,
}

impl Role {
    /// Whether the role may perform privileged mutations.
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the current request is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Account name.
    pub username: String,
    /// Account role.
    pub role: Role,
}

/// Response of the session liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCheck {
    /// Always true when the probe is answered.
    pub authenticated: bool,
    /// Account name.
    pub username: String,
    /// Account role.
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_listing_entry_shape() {
        let entry = ListingEntry {
            name: "docs".to_string(),
            path: "a/docs".to_string(),
            kind: EntryKind::Folder,
            size: None,
            modified: 10,
            created: 5,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(
            value,
            json!({
                "name": "docs",
                "path": "a/docs",
                "type": "folder",
                "size": null,
                "modified": 10,
                "created": 5,
            })
        );
    }

    #[test]
    fn test_tree_shape() {
        let mut a = TreeNode::default();
        a.files.push("d.txt".to_string());
        let mut root = TreeNode::default();
        root.folders.insert("a".to_string(), a);
        root.files.push("e.txt".to_string());

        let value = serde_json::to_value(&root).unwrap();
        assert_eq!(
            value,
            json!({
                "folders": { "a": { "folders": {}, "files": ["d.txt"] } },
                "files": ["e.txt"],
            })
        );
        assert_eq!(root.file_count(), 2);
        assert_eq!(root.folder_count(), 1);
        assert!(!root.is_empty());
    }

    #[test]
    fn test_upload_response_counts() {
        let response = UploadResponse::from_results(vec![
            UploadItemResult::success("a.txt", "a.txt"),
            UploadItemResult::error("b.txt", "invalid path"),
            UploadItemResult::success("c.txt", "sub/c.txt"),
        ]);
        assert!(response.success);
        assert_eq!(response.total, 3);
        assert_eq!(response.successful, 2);
        assert_eq!(response.errors, 1);
        assert_eq!(response.message, "2 of 3 files uploaded successfully");
    }

    #[test]
    fn test_upload_response_all_failed_is_not_success() {
        let response =
            UploadResponse::from_results(vec![UploadItemResult::error("x", "invalid path")]);
        assert!(!response.success);
        assert_eq!(response.errors, 1);
    }

    #[test]
    fn test_upload_item_result_omits_empty_fields() {
        let value = serde_json::to_value(UploadItemResult::success("a.txt", "d/a.txt")).unwrap();
        assert_eq!(
            value,
            json!({"filename": "a.txt", "status": "success", "path": "d/a.txt"})
        );

        let value = serde_json::to_value(UploadItemResult::error("a.txt", "file too large")).unwrap();
        assert_eq!(
            value,
            json!({"filename": "a.txt", "status": "error", "error": "file too large"})
        );
    }

    #[test]
    fn test_progress_event_camel_case() {
        let id = Uuid::nil();
        let event = ProgressEvent::new(id, 1, 3).with_current("x.txt", "photos");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["batchId"], json!(id.to_string()));
        assert_eq!(value["percentage"], json!(33));
        assert_eq!(value["currentFile"], json!("x.txt"));
        assert_eq!(value["currentFolder"], json!("photos"));
        assert_eq!(value["finished"], json!(false));

        let parsed = ProgressEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_progress_percentage_rounding() {
        let id = Uuid::nil();
        assert_eq!(ProgressEvent::new(id, 0, 3).percentage, 0);
        assert_eq!(ProgressEvent::new(id, 2, 3).percentage, 67);
        assert_eq!(ProgressEvent::new(id, 3, 3).percentage, 100);
        assert_eq!(ProgressEvent::new(id, 0, 0).percentage, 100);
        assert_eq!(ProgressEvent::new(id, 9, 3).percentage, 100);
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_value(Role::Admin).unwrap(), json!("admin"));
        let role: Role = serde_json::from_value(json!("user")).unwrap();
        assert_eq!(role, Role::User);
        assert!(Role::Admin.is_admin());
        assert!(!Role::User.is_admin());
        assert_eq!(Role::Admin.to_string(), "admin");
    }

    #[test]
    fn test_create_folder_request_parse() {
        let req: CreateFolderRequest = serde_json::from_str(r#"{"path":"a/b"}"#).unwrap();
        assert_eq!(req.path, "a/b");
    }
}
