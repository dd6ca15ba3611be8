//! Route handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use protocol::{
    ActiveUpload, CreateFolderRequest, CreateFolderResponse, DeleteAllResponse, DeleteResponse,
    ListingEntry, ProgressEvent, SessionCheck, SessionInfo, TreeNode, UploadResponse,
};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{multipart, ApiError, AppState};
use crate::accounts::Caller;
use crate::files::{BrowseError, MaterializeError, VirtualPath};
use crate::progress::ProgressHub;

/// `?folder=` query of the listing routes.
#[derive(Debug, Default, Deserialize)]
pub struct FolderQuery {
    /// Virtual folder; empty for the root.
    #[serde(default)]
    pub folder: String,
}

fn browse_path(raw: &str) -> Result<VirtualPath, ApiError> {
    VirtualPath::parse(raw).map_err(|e| ApiError::from(BrowseError::from(e)))
}

fn require_delete(caller: &Caller) -> Result<(), ApiError> {
    if caller.can_delete() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("admin privileges required".to_string()))
    }
}

/// `GET /api/files`
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<Vec<ListingEntry>>, ApiError> {
    let folder = browse_path(&query.folder)?;
    Ok(Json(state.browser.list(&folder).await?))
}

/// `GET /api/tree`
pub async fn tree(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<TreeNode>, ApiError> {
    let folder = browse_path(&query.folder)?;
    Ok(Json(state.browser.tree(&folder).await?))
}

/// `POST /upload`
///
/// The batch runs on its own task. If the client goes away, the handler
/// future is dropped and the guard cancels the items not yet started.
pub async fn upload(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let max_file_size = state.ingestor.options().max_file_size;
    let batch = multipart::read_upload(multipart, &state.spool_dir, max_file_size, &caller.username).await?;

    let batch_id = batch.id;
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let ingestor = Arc::clone(&state.ingestor);
    let task = tokio::spawn(async move { ingestor.ingest(batch, cancel).await });

    let response = join_batch(&state.progress, batch_id, task).await?;
    guard.disarm();
    Ok(Json(response))
}

/// Wait for an ingest task. A task that died never finished its batch, so
/// its snapshot is dropped here.
async fn join_batch(
    progress: &ProgressHub,
    batch_id: Uuid,
    task: JoinHandle<UploadResponse>,
) -> Result<UploadResponse, ApiError> {
    task.await.map_err(|e| {
        progress.abandon(&batch_id);
        ApiError::Io(format!("upload task failed: {e}"))
    })
}

/// `GET /download/{*path}`
pub async fn download(
    State(state): State<AppState>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let path = VirtualPath::parse(&raw).map_err(|e| ApiError::Forbidden(e.to_string()))?;
    let (file, len) = state.browser.open(&path).await?;

    let name = path.file_name().unwrap_or("download");
    let mime = mime_guess::from_path(name).first_or_octet_stream();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    debug!(path = %path, size = len, "Serving download");
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// `attachment` disposition with an ASCII fallback and the exact UTF-8 name.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// `DELETE /api/delete/{*path}`
pub async fn delete_entry(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(raw): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_delete(&caller)?;
    let path = VirtualPath::parse(&raw).map_err(|e| ApiError::Forbidden(e.to_string()))?;

    state.remover.remove(&path).await?;
    info!(user = %caller.username, path = %path, "Entry deleted");
    Ok(Json(DeleteResponse { success: true }))
}

/// `DELETE /api/delete-all`
pub async fn delete_all(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    require_delete(&caller)?;

    let removed = state.remover.clear().await?;
    info!(user = %caller.username, removed, "Storage root cleared");
    Ok(Json(DeleteAllResponse {
        success: true,
        removed,
    }))
}

/// `POST /api/create-folder`
pub async fn create_folder(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<CreateFolderRequest>,
) -> Result<Json<CreateFolderResponse>, ApiError> {
    let path = VirtualPath::parse(&request.path).map_err(|e| ApiError::InvalidPath(e.to_string()))?;
    if path.is_root() {
        return Err(ApiError::BadRequest("folder path is required".to_string()));
    }

    let report = state.materializer.ensure([path.clone()]).await;
    if let Some((failed, e)) = report.failure_for(&path) {
        return Err(match e {
            MaterializeError::Path(e) => ApiError::InvalidPath(e.to_string()),
            MaterializeError::NotADirectory(_) | MaterializeError::AncestorFailed(_) => {
                ApiError::BadRequest(format!("cannot create {path}: {failed} is not a folder"))
            }
            MaterializeError::Io(e) => ApiError::Io(format!("cannot create {failed}: {e}")),
        });
    }

    info!(user = %caller.username, path = %path, "Folder created");
    Ok(Json(CreateFolderResponse {
        success: true,
        path: path.to_string(),
    }))
}

/// `GET /session-info`
pub async fn session_info(Extension(caller): Extension<Caller>) -> Json<SessionInfo> {
    Json(caller.session_info())
}

/// `GET /api/session-check`
pub async fn session_check(Extension(caller): Extension<Caller>) -> Json<SessionCheck> {
    Json(SessionCheck {
        authenticated: true,
        username: caller.username,
        role: caller.role,
    })
}

/// `GET /api/uploads`
pub async fn active_uploads(State(state): State<AppState>) -> Json<Vec<ActiveUpload>> {
    Json(state.progress.active())
}

/// `GET /api/progress`
pub async fn progress_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let events = state.progress.subscribe();
    ws.on_upgrade(move |socket| forward_progress(socket, events))
}

async fn forward_progress(mut socket: WebSocket, mut events: broadcast::Receiver<ProgressEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode progress event");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Progress listener disconnected");
}
