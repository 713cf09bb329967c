//! Upload Routes
//!
//! HTTP endpoints for chunked asset uploads from the editor.
//!
//! Endpoints:
//! - POST /api/v1/editor/chunked-upload/init - Open a session
//! - POST /api/v1/editor/chunked-upload/chunk - Upload a chunk (multipart form)
//! - PUT /api/v1/editor/chunked-upload/:session_id/chunks/:index - Upload a chunk (raw body)
//! - GET /api/v1/editor/chunked-upload/status/:session_id - Session status for resuming
//! - POST /api/v1/editor/chunked-upload/finalize - Assemble the file
//! - DELETE /api/v1/editor/chunked-upload/:session_id - Cancel upload
//!
//! Callers reach these routes only after the authorization gate in front of
//! the server has accepted their credential; it forwards the caller identity
//! in the `X-User-Id` header.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, FinalizeUploadRequest, FinalizeUploadResponse, InitUploadRequest,
    InitUploadResponse, UploadError, UploadStatusResponse, UNKNOWN_OWNER,
};

/// Header carrying the authenticated caller identity
pub const USER_ID_HEADER: &str = "x-user-id";

/// Room for multipart boundaries and the form fields around a chunk
const MULTIPART_OVERHEAD: usize = 2 * 1024 * 1024;

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_size: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_chunk_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/init", post(initialize))
        .route("/chunk", post(upload_chunk_form))
        .route("/:session_id/chunks/:index", put(upload_chunk_raw))
        .route("/status/:session_id", get(status))
        .route("/finalize", post(finalize))
        .route("/:session_id", delete(cancel))
        .layer(DefaultBodyLimit::max(body_limit))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /init
async fn initialize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, UploadError> {
    let owner_id = owner_id(&headers);
    let response = state.uploads().initialize(owner_id, &request).await?;
    Ok(Json(response))
}

/// POST /chunk
///
/// Multipart form with `sessionId`, `chunkIndex` and the chunk as a file part.
async fn upload_chunk_form(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let mut session_id: Option<String> = None;
    let mut chunk_index: Option<i64> = None;
    let mut payload: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let is_file = field.file_name().is_some();

        match name.as_str() {
            "sessionId" => session_id = Some(field_text(field).await?),
            "chunkIndex" => {
                let raw = field_text(field).await?;
                let index = raw
                    .trim()
                    .parse()
                    .map_err(|_| UploadError::InvalidRequest(format!("Invalid chunk index: {raw}")))?;
                chunk_index = Some(index);
            }
            _ if is_file && payload.is_none() => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| UploadError::InvalidRequest(e.body_text()))?;
                payload = Some(bytes);
            }
            _ => {}
        }
    }

    let session_id = session_id.ok_or_else(|| UploadError::invalid("sessionId is required"))?;
    let chunk_index = chunk_index.ok_or_else(|| UploadError::invalid("chunkIndex is required"))?;
    let payload = payload.unwrap_or_default();

    let progress = state
        .uploads()
        .upload_chunk(&session_id, chunk_index, &payload)
        .await?;
    Ok(Json(progress.into()))
}

/// PUT /:session_id/chunks/:index
///
/// The chunk data is the raw request body.
async fn upload_chunk_raw(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, i64)>,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let progress = state
        .uploads()
        .upload_chunk(&session_id, chunk_index, &body)
        .await?;
    Ok(Json(progress.into()))
}

/// GET /status/:session_id
async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<UploadStatusResponse>, UploadError> {
    Ok(Json(state.uploads().status(&session_id).await?))
}

/// POST /finalize
async fn finalize(
    State(state): State<AppState>,
    Json(request): Json<FinalizeUploadRequest>,
) -> Result<Json<FinalizeUploadResponse>, UploadError> {
    Ok(Json(state.uploads().finalize(&request.session_id).await?))
}

/// DELETE /:session_id
async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.uploads().cancel(&session_id).await?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Helpers
// ============================================================================

fn owner_id(headers: &HeaderMap) -> &str {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN_OWNER)
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, UploadError> {
    field
        .text()
        .await
        .map_err(|e| UploadError::InvalidRequest(e.body_text()))
}

// ============================================================================
// Tests
// ============================================================================
