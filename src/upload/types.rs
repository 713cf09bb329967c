//! Upload types for the chunked asset upload protocol

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for a single chunk: 50MB
pub const MAX_CHUNK_BYTES: u64 = 50_000_000;

/// Chunk size used when the caller does not declare one: 10MB
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000_000;

/// Owner recorded when the authorization gate did not supply an identity
pub const UNKNOWN_OWNER: &str = "unknown";

// ============================================================================
// Upload Type
// ============================================================================

/// Which asset tree a finalized upload belongs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadType {
    Client,
    Editor,
}

impl UploadType {
    /// Directory name of this tree under the asset root
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Editor => "editor",
        }
    }
}

impl fmt::Display for UploadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadType {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "editor" => Ok(Self::Editor),
            _ => Err(UploadError::InvalidRequest(
                "Upload type must be 'client' or 'editor'".to_string(),
            )),
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Accepting chunks
    Receiving,
    /// Assembly in progress; no further chunk writes or finalize calls
    Finalizing,
    /// File assembled and published
    Completed,
    /// Cancelled by the caller
    Cancelled,
    /// Reaped after sitting idle past the configured timeout
    Expired,
}

impl SessionState {
    /// Whether the session can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

// ============================================================================
// Initialize Types
// ============================================================================

/// Request to open a chunked upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    /// Leaf name of the file being uploaded
    pub file_name: String,

    /// Subdirectory under the upload-type root (empty = root itself)
    #[serde(default)]
    pub relative_path: Option<String>,

    /// "client" or "editor"
    pub upload_type: String,

    /// Declared total file size in bytes
    pub total_size: i64,

    /// Declared chunk size; defaults to 10MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
}

fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE as i64
}

/// Response to an initialize request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Outcome of a single chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Payload staged and recorded
    Accepted,
    /// Index was already recorded; payload ignored
    Duplicate,
}

/// Progress reported after a chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: u32,
    pub outcome: ChunkOutcome,
    pub uploaded_count: usize,
    pub total_chunks: u32,
    pub is_complete: bool,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub chunk_index: u32,
    pub uploaded_chunks: usize,
    pub total_chunks: u32,
    pub is_complete: bool,
}

impl From<ChunkProgress> for ChunkUploadResponse {
    fn from(progress: ChunkProgress) -> Self {
        Self {
            chunk_index: progress.chunk_index,
            uploaded_chunks: progress.uploaded_count,
            total_chunks: progress.total_chunks,
            is_complete: progress.is_complete,
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Read-only projection of a session, used for resuming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub session_id: String,
    pub file_name: String,
    pub state: SessionState,
    /// Received chunk indices in ascending order
    pub uploaded_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Request to assemble a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadRequest {
    pub session_id: String,
}

/// Response after finalizing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadResponse {
    pub success: bool,
    pub file_name: String,

    /// Size of the assembled file
    pub size: u64,

    /// Destination relative to the asset root, '/'-separated
    pub path: String,

    /// SHA-256 of the assembled file (hex)
    pub sha256: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Chunked uploads are not enabled")]
    Disabled,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Upload session not found or expired: {0}")]
    SessionNotFound(String),

    #[error("Invalid chunk index: {index} (total chunks: {total})")]
    InvalidChunkIndex { index: i64, total: u32 },

    #[error("Upload session is {state:?}: {session_id}")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    #[error("Invalid destination path")]
    Forbidden,

    #[error("Not all chunks uploaded: {uploaded}/{total}")]
    IncompleteSession { uploaded: usize, total: u32 },

    #[error("Chunk {index} is recorded but missing from staging")]
    CorruptSession { index: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Disabled => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidChunkIndex { .. } => StatusCode::BAD_REQUEST,
            Self::SessionClosed { .. } => StatusCode::CONFLICT,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::IncompleteSession { .. } => StatusCode::BAD_REQUEST,
            Self::CorruptSession { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "UPLOADS_DISABLED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidChunkIndex { .. } => "INVALID_CHUNK_INDEX",
            Self::SessionClosed { .. } => "SESSION_CLOSED",
            Self::Forbidden => "FORBIDDEN",
            Self::IncompleteSession { .. } => "INCOMPLETE_SESSION",
            Self::CorruptSession { .. } => "CORRUPT_SESSION",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}
