//! Upload Session Manager
//!
//! Manages upload sessions with:
//! - An in-memory registry behind a structure-only lock
//! - A per-session lock over the mutable progress fields, so chunk writes to
//!   different sessions never contend
//! - Staging area provisioning and cleanup through the chunk storage backend
//!
//! Lock order is registry, then session. The registry lock is never held
//! across an await point.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::chunk_store::ChunkStorage;
use super::sandbox::validate_file_name;
use super::types::{InitUploadRequest, SessionState, UploadError, UploadType, MAX_CHUNK_BYTES};

// ============================================================================
// Session Types
// ============================================================================

/// Validated parameters for a new session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub owner_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub upload_type: UploadType,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl SessionParams {
    /// Validate an initialize request against the configured limits
    pub fn from_request(
        owner_id: &str,
        request: &InitUploadRequest,
        limits: &SessionLimits,
    ) -> Result<Self, UploadError> {
        validate_file_name(&request.file_name)?;

        if request.total_size <= 0 {
            return Err(UploadError::invalid("Total size must be greater than 0"));
        }
        let total_size = request.total_size as u64;
        if limits.max_total_size > 0 && total_size > limits.max_total_size {
            return Err(UploadError::InvalidRequest(format!(
                "Total size exceeds limit of {} bytes",
                limits.max_total_size
            )));
        }

        if request.chunk_size <= 0 || request.chunk_size as u64 > limits.max_chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "Chunk size must be between 1 and {} bytes",
                limits.max_chunk_size
            )));
        }
        let chunk_size = request.chunk_size as u64;

        let upload_type: UploadType = request.upload_type.parse()?;

        let total_chunks = u32::try_from(total_size.div_ceil(chunk_size))
            .map_err(|_| UploadError::invalid("Too many chunks for this chunk size"))?;

        Ok(Self {
            owner_id: owner_id.to_string(),
            file_name: request.file_name.clone(),
            relative_path: request.relative_path.clone().unwrap_or_default(),
            upload_type,
            total_size,
            chunk_size,
            total_chunks,
        })
    }
}

/// Size limits applied when creating sessions
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_chunk_size: u64,
    /// 0 = unlimited
    pub max_total_size: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_BYTES,
            max_total_size: 0,
        }
    }
}

/// Mutable part of a session, guarded by the session lock
#[derive(Debug)]
pub struct SessionProgress {
    /// Indices of chunks whose payload is durably staged
    pub uploaded_chunks: BTreeSet<u32>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
}

/// One in-progress chunked upload
#[derive(Debug)]
pub struct UploadSession {
    pub id: Uuid,
    pub owner_id: String,
    pub file_name: String,
    pub relative_path: String,
    pub upload_type: UploadType,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub staging_location: PathBuf,
    pub created_at: DateTime<Utc>,
    progress: Mutex<SessionProgress>,
}

impl UploadSession {
    fn new(id: Uuid, params: SessionParams, staging_location: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id: params.owner_id,
            file_name: params.file_name,
            relative_path: params.relative_path,
            upload_type: params.upload_type,
            total_size: params.total_size,
            chunk_size: params.chunk_size,
            total_chunks: params.total_chunks,
            staging_location,
            created_at: now,
            progress: Mutex::new(SessionProgress {
                uploaded_chunks: BTreeSet::new(),
                last_activity_at: now,
                state: SessionState::Receiving,
            }),
        }
    }

    /// Acquire the session lock
    pub async fn lock(&self) -> MutexGuard<'_, SessionProgress> {
        self.progress.lock().await
    }

    pub fn is_complete(&self, progress: &SessionProgress) -> bool {
        progress.uploaded_chunks.len() == self.total_chunks as usize
    }

    /// Byte length the chunk at `index` should have
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.chunk_size.min(self.total_size.saturating_sub(start))
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Active sessions indexed by ID
    sessions: RwLock<HashMap<Uuid, Arc<UploadSession>>>,

    /// Staging backend
    storage: Arc<dyn ChunkStorage>,

    limits: SessionLimits,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(storage: Arc<dyn ChunkStorage>, limits: SessionLimits) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: RwLock::new(HashMap::new()),
                storage,
                limits,
            }),
        }
    }

    pub fn storage(&self) -> &Arc<dyn ChunkStorage> {
        &self.inner.storage
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Validate, provision staging and register a new session
    pub async fn create_session(
        &self,
        owner_id: &str,
        request: &InitUploadRequest,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let params = SessionParams::from_request(owner_id, request, &self.inner.limits)?;

        let id = loop {
            let candidate = Uuid::new_v4();
            if !self.inner.sessions.read().contains_key(&candidate) {
                break candidate;
            }
        };

        let staging_location = self.inner.storage.provision(id).await?;
        let session = Arc::new(UploadSession::new(id, params, staging_location));

        self.inner.sessions.write().insert(id, session.clone());

        tracing::info!(
            session_id = %id,
            owner_id = %session.owner_id,
            file_name = %session.file_name,
            upload_type = %session.upload_type,
            total_size = session.total_size,
            total_chunks = session.total_chunks,
            "Created upload session"
        );

        Ok(session)
    }

    /// Get a session by ID
    pub fn get_session(&self, id: Uuid) -> Result<Arc<UploadSession>, UploadError> {
        self.inner
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))
    }

    /// Get a session by string ID
    pub fn get_session_by_str(&self, id: &str) -> Result<Arc<UploadSession>, UploadError> {
        let uuid = Uuid::parse_str(id).map_err(|_| UploadError::SessionNotFound(id.to_string()))?;
        self.get_session(uuid)
    }

    /// Deregister a session and delete its staging area.
    ///
    /// Idempotent: returns `None` if the session was already gone. The
    /// session is moved to `final_state` unless it already reached a
    /// terminal state.
    pub async fn remove_session(
        &self,
        id: Uuid,
        final_state: SessionState,
    ) -> Option<Arc<UploadSession>> {
        let session = self.inner.sessions.write().remove(&id)?;

        {
            let mut progress = session.lock().await;
            if !progress.state.is_terminal() {
                progress.state = final_state;
            }
        }

        if let Err(e) = self.inner.storage.remove_session(id).await {
            tracing::warn!(
                session_id = %id,
                error = %e,
                "Failed to clean up staging area"
            );
        }

        Some(session)
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Get all registered sessions
    pub fn sessions(&self) -> Vec<Arc<UploadSession>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Expire sessions still receiving whose last activity is before `cutoff`.
    ///
    /// Sessions that are being finalized are left alone. The state flips to
    /// `Expired` under the same lock hold that saw the session idle, so a
    /// chunk arriving afterwards is refused rather than lost.
    pub async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Vec<Arc<UploadSession>> {
        let mut idle = Vec::new();
        for session in self.sessions() {
            let mut progress = session.lock().await;
            if progress.state == SessionState::Receiving && progress.last_activity_at < cutoff {
                progress.state = SessionState::Expired;
                idle.push(session.id);
            }
        }

        futures::future::join_all(
            idle.into_iter()
                .map(|id| self.remove_session(id, SessionState::Expired)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::LocalChunkStorage;
    use tempfile::TempDir;

    fn create_test_request() -> InitUploadRequest {
        InitUploadRequest {
            file_name: "tileset.png".to_string(),
            relative_path: Some("resources/tilesets".to_string()),
            upload_type: "client".to_string(),
            total_size: 25,
            chunk_size: 10,
        }
    }

    fn manager(temp_dir: &TempDir) -> SessionManager {
        SessionManager::new(
            Arc::new(LocalChunkStorage::new(temp_dir.path())),
            SessionLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_create_session() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let session = manager.create_session("dev-1", &create_test_request()).await.unwrap();

        assert_eq!(session.file_name, "tileset.png");
        assert_eq!(session.owner_id, "dev-1");
        assert_eq!(session.upload_type, UploadType::Client);
        assert_eq!(session.total_chunks, 3);
        assert!(session.staging_location.is_dir());

        let progress = session.lock().await;
        assert_eq!(progress.state, SessionState::Receiving);
        assert!(progress.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_count_arithmetic() {
        let limits = SessionLimits::default();
        let cases = [(25, 10, 3), (30, 10, 3), (1, 10, 1), (15_000_000, 5_000_000, 3)];
        for (total_size, chunk_size, expected) in cases {
            let request = InitUploadRequest {
                total_size,
                chunk_size,
                ..create_test_request()
            };
            let params = SessionParams::from_request("dev", &request, &limits).unwrap();
            assert_eq!(params.total_chunks, expected, "{total_size}/{chunk_size}");
        }
    }

    #[tokio::test]
    async fn test_expired_session_refuses_late_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let storage: Arc<dyn ChunkStorage> = Arc::new(LocalChunkStorage::new(temp_dir.path()));
        let manager = SessionManager::new(storage.clone(), SessionLimits::default());
        let writer = crate::upload::writer::ChunkWriter::new(storage);
        let session = manager.create_session("dev", &create_test_request()).await.unwrap();

        let expired = manager.expire_idle(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(expired.len(), 1);

        // A writer still holding the session handle is turned away
        let result = writer.write_chunk(&session, 0, b"0123456789").await;
        assert!(matches!(
            result,
            Err(UploadError::SessionClosed {
                state: SessionState::Expired,
                ..
            })
        ));
        assert!(session.lock().await.uploaded_chunks.is_empty());
        assert!(!session.staging_location.exists());
    }

    #[tokio::test]
    async fn test_expected_chunk_len() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let session = manager.create_session("dev", &create_test_request()).await.unwrap();

        assert_eq!(session.expected_chunk_len(0), 10);
        assert_eq!(session.expected_chunk_len(1), 10);
        assert_eq!(session.expected_chunk_len(2), 5);
    }

    #[tokio::test]
    async fn test_rejects_invalid_parameters() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let bad_requests = [
            InitUploadRequest { file_name: String::new(), ..create_test_request() },
            InitUploadRequest { file_name: "../x".to_string(), ..create_test_request() },
            InitUploadRequest { total_size: 0, ..create_test_request() },
            InitUploadRequest { total_size: -5, ..create_test_request() },
            InitUploadRequest { chunk_size: 0, ..create_test_request() },
            InitUploadRequest { chunk_size: 50_000_001, ..create_test_request() },
            InitUploadRequest { upload_type: "server".to_string(), ..create_test_request() },
        ];

        for request in bad_requests {
            let result = manager.create_session("dev", &request).await;
            assert!(
                matches!(result, Err(UploadError::InvalidRequest(_))),
                "{request:?}"
            );
        }
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_max_total_size_limit() {
        let limits = SessionLimits {
            max_chunk_size: MAX_CHUNK_BYTES,
            max_total_size: 20,
        };
        let result = SessionParams::from_request("dev", &create_test_request(), &limits);
        assert!(matches!(result, Err(UploadError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_remove_session_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let session = manager.create_session("dev", &create_test_request()).await.unwrap();
        let staging = session.staging_location.clone();

        let removed = manager
            .remove_session(session.id, SessionState::Cancelled)
            .await
            .unwrap();
        assert_eq!(removed.lock().await.state, SessionState::Cancelled);
        assert!(!staging.exists());

        assert!(manager.remove_session(session.id, SessionState::Cancelled).await.is_none());
        assert!(matches!(
            manager.get_session(session.id),
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_session_by_malformed_id() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        assert!(matches!(
            manager.get_session_by_str("not-a-uuid"),
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_expire_idle() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let stale = manager.create_session("dev", &create_test_request()).await.unwrap();
        let fresh = manager.create_session("dev", &create_test_request()).await.unwrap();

        let cutoff = Utc::now();
        fresh.lock().await.last_activity_at = cutoff + chrono::Duration::seconds(60);

        let expired = manager.expire_idle(cutoff + chrono::Duration::seconds(1)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
        assert_eq!(stale.lock().await.state, SessionState::Expired);
        assert!(manager.get_session(fresh.id).is_ok());
    }
}
