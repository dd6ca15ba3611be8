//! # Cloudshelf Server Library
//!
//! This crate provides a namespace-safe file manager: clients upload,
//! browse, download and delete files and folders under a single storage
//! root, and no request can read or write outside that root.
//!
//! ## Overview
//!
//! - **Path safety**: every client path is validated and resolved against
//!   the canonical storage root before any filesystem call
//! - **Batch uploads**: whole folder trees in one request, with collision-free
//!   naming and per-item results
//! - **Browsing**: sorted listings and recursive trees, derived live from
//!   the filesystem
//! - **Progress**: per-item upload progress pushed over a WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Server Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │            HTTP router (axum, Basic auth)              │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │    Upload    │  │  Namespace   │  │      Entry       │   │
//! │  │   Ingestor   │  │   Browser    │  │     Remover      │   │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┬─────────┘   │
//! │  ┌──────┴───────┐  ┌──────┴─────────────────────┴─────────┐   │
//! │  │ Materializer │  │            Path Resolver            │   │
//! │  │ Conflict     │  └─────────────────────────────────────┘   │
//! │  │ Namer        │  ┌──────────────┐  ┌──────────────────┐   │
//! │  └──────────────┘  │ Progress Hub │  │    Audit Log     │   │
//! │                    └──────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, ServerOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let orchestrator = ServerOrchestrator::new(config).await?;
//!     orchestrator.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`accounts`]: Accounts and caller privileges
//! - [`files`]: Path resolution, uploads, listings and removal
//! - [`progress`]: Upload progress fan-out
//! - [`audit`]: Append-only upload log
//! - [`http`]: Routes, authentication and error mapping
//! - [`orchestrator`]: Main server coordinator

pub mod accounts;
pub mod audit;
pub mod config;
pub mod files;
pub mod http;
pub mod orchestrator;
pub mod progress;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export account types for convenience
pub use accounts::{hash_password, Account, AccountStore, Caller};

// Re-export files types for convenience
pub use files::{
    ConflictNamer, ConflictPolicy, DirectoryMaterializer, EntryRemover, NamespaceBrowser,
    PathResolver, UploadBatch, UploadIngestor, UploadItem, VirtualPath,
};

// Re-export HTTP types for convenience
pub use http::{router, ApiError, AppState};

// Re-export orchestrator types for convenience
pub use orchestrator::{OrchestratorState, ServerOrchestrator};
pub use progress::ProgressHub;
