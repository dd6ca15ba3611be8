//! # Cloudshelf Protocol Library
//!
//! Wire types exchanged between the cloudshelf server and its clients.
//!
//! ## Overview
//!
//! The server speaks JSON over HTTP. This crate owns every JSON shape the
//! server emits or accepts so a client (the bundled web front end, a CLI,
//! a test harness) can depend on the exact same definitions:
//!
//! - **Listings**: one level of a directory ([`ListingEntry`]) and the
//!   recursive view ([`TreeNode`])
//! - **Uploads**: per-item outcomes and the batch summary ([`UploadResponse`])
//! - **Progress**: events pushed while a batch is in flight ([`ProgressEvent`])
//! - **Errors**: the JSON body attached to every non-2xx response
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{UploadItemResult, UploadResponse};
//!
//! let results = vec![
//!     UploadItemResult::success("x.txt", "x.txt"),
//!     UploadItemResult::error("../x.txt", "invalid path"),
//! ];
//! let response = UploadResponse::from_results(results);
//! assert!(response.success);
//! assert_eq!(response.successful, 1);
//! assert_eq!(response.errors, 1);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Listing, tree, upload, progress and session types
//! - [`error`]: Error codes and the JSON error body

pub mod error;
pub mod messages;

pub use error::{ErrorBody, ErrorCode, ProtocolError, Result};
pub use messages::{
    ActiveUpload, CreateFolderRequest, CreateFolderResponse, DeleteAllResponse, DeleteResponse,
    EntryKind, ListingEntry, ProgressEvent, Role, SessionCheck, SessionInfo, TreeNode,
    UploadItemResult, UploadResponse, UploadStatus,
};
