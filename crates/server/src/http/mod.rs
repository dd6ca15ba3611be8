//! HTTP transport for the namespace.
//!
//! Every route sits behind HTTP Basic authentication ([`auth`]). Handlers
//! translate requests into calls on the `files` components and map their
//! errors onto [`ApiError`], which always renders a JSON [`ErrorBody`].
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/api/files?folder=` | listing |
//! | GET | `/api/tree?folder=` | recursive tree |
//! | POST | `/upload` | multipart batch upload |
//! | GET | `/download/{*path}` | file bytes |
//! | DELETE | `/api/delete/{*path}` | remove entry (admin) |
//! | DELETE | `/api/delete-all` | clear root (admin) |
//! | POST | `/api/create-folder` | idempotent mkdir |
//! | GET | `/session-info`, `/api/session-check` | caller identity |
//! | GET | `/api/uploads` | batches in flight |
//! | GET | `/api/progress` | WebSocket progress feed |

pub mod auth;
pub mod handlers;
pub mod multipart;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use protocol::{ErrorBody, ErrorCode};
use thiserror::Error;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::accounts::AccountStore;
use crate::files::{
    BrowseError, DirectoryMaterializer, EntryRemover, NamespaceBrowser, PathResolver, RemoveError,
    UploadIngestor,
};
use crate::progress::ProgressHub;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Storage root resolver.
    pub resolver: Arc<PathResolver>,
    /// Listings, trees and downloads.
    pub browser: Arc<NamespaceBrowser>,
    /// Entry removal.
    pub remover: Arc<EntryRemover>,
    /// Folder creation.
    pub materializer: Arc<DirectoryMaterializer>,
    /// Batch uploads.
    pub ingestor: Arc<UploadIngestor>,
    /// Upload progress fan-out.
    pub progress: Arc<ProgressHub>,
    /// Known accounts.
    pub accounts: Arc<AccountStore>,
    /// Where multipart parts are spooled while being received.
    pub spool_dir: PathBuf,
    /// Front-end files served for unmatched paths.
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    /// Wire the namespace components around `resolver`.
    pub fn new(
        resolver: Arc<PathResolver>,
        ingestor: Arc<UploadIngestor>,
        progress: Arc<ProgressHub>,
        accounts: Arc<AccountStore>,
        spool_dir: PathBuf,
    ) -> Self {
        Self {
            browser: Arc::new(NamespaceBrowser::new(Arc::clone(&resolver))),
            remover: Arc::new(EntryRemover::new(Arc::clone(&resolver))),
            materializer: Arc::new(DirectoryMaterializer::new(Arc::clone(&resolver))),
            resolver,
            ingestor,
            progress,
            accounts,
            spool_dir,
            static_dir: None,
        }
    }

    /// Serve front-end files from `dir` for paths no route claims.
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request was malformed.
    #[error("{0}")]
    BadRequest(String),

    /// A client path was rejected where rejection reads as a bad request.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Missing or wrong credentials.
    #[error("authentication required")]
    Unauthorized,

    /// The caller may not do this, or the path is out of bounds.
    #[error("{0}")]
    Forbidden(String),

    /// Nothing exists at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem failure.
    #[error("{0}")]
    Io(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, ErrorCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorCode::BadRequest, "Bad request"),
            ApiError::InvalidPath(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidPath, "Invalid path"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, "Unauthorized"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, ErrorCode::Forbidden, "Access denied"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound, "Not found"),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::IoFailure, "Server error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, summary) = self.parts();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = ErrorBody::new(code, self.to_string(), summary);
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="cloudshelf""#),
            );
        }
        response
    }
}

impl From<BrowseError> for ApiError {
    fn from(err: BrowseError) -> Self {
        match err {
            BrowseError::Path(e) => ApiError::Forbidden(e.to_string()),
            BrowseError::NotFound(path) => ApiError::NotFound(path.to_string()),
            BrowseError::NotAFile(path) => ApiError::NotFound(format!("{path} is not a file")),
            BrowseError::Io(e) => ApiError::Io(e.to_string()),
        }
    }
}

impl From<RemoveError> for ApiError {
    fn from(err: RemoveError) -> Self {
        match err {
            RemoveError::Forbidden(reason) => ApiError::Forbidden(reason),
            RemoveError::NotFound(path) => ApiError::NotFound(path.to_string()),
            e @ RemoveError::Partial { .. } => ApiError::Io(e.to_string()),
            RemoveError::Io(e) => ApiError::Io(e.to_string()),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/files", get(handlers::list_files))
        .route("/api/tree", get(handlers::tree))
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/download/{*path}", get(handlers::download))
        .route("/api/delete/{*path}", delete(handlers::delete_entry))
        .route("/api/delete-all", delete(handlers::delete_all))
        .route("/api/create-folder", post(handlers::create_folder))
        .route("/session-info", get(handlers::session_info))
        .route("/api/session-check", get(handlers::session_check))
        .route("/api/uploads", get(handlers::active_uploads))
        .route("/api/progress", get(handlers::progress_socket));

    let mut app = api;
    if let Some(dir) = &state.static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(middleware::from_fn_with_state(state.clone(), auth::require_caller))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
