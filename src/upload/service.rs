//! Upload Service
//!
//! Orchestrates the caller-visible operations on top of the session
//! registry, chunk writer, assembler and destination sandbox:
//!
//! ```text
//! initialize -> Receiving --upload_chunk*--> finalize -> Completed
//!                   |                           |
//!                   +--cancel--> Cancelled      +--(failure)--> Receiving
//!                   +--idle sweep--> Expired
//! ```
//!
//! The registry lock is only taken to look sessions up or remove them;
//! assembly runs with no lock held.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::assembler::Assembler;
use super::chunk_store::{ChunkStorage, LocalChunkStorage};
use super::sandbox::PathSandbox;
use super::session::{SessionLimits, SessionManager, UploadSession};
use super::types::{
    ChunkProgress, FinalizeUploadResponse, InitUploadRequest, InitUploadResponse, SessionState,
    UploadError, UploadStatusResponse,
};
use super::writer::ChunkWriter;
use crate::config::UploadConfig;

/// Tunables for [`UploadService`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// When false, new sessions are refused
    pub enabled: bool,
    pub limits: SessionLimits,
    /// Sessions without activity for this long are reaped
    pub idle_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: SessionLimits::default(),
            idle_timeout: Duration::from_secs(3600),
        }
    }
}

/// Chunked upload lifecycle
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    options: ServiceOptions,
    sessions: SessionManager,
    writer: ChunkWriter,
    assembler: Assembler,
    sandbox: PathSandbox,
}

impl UploadService {
    pub fn new(storage: Arc<dyn ChunkStorage>, sandbox: PathSandbox, options: ServiceOptions) -> Self {
        Self {
            inner: Arc::new(UploadServiceInner {
                sessions: SessionManager::new(storage.clone(), options.limits),
                writer: ChunkWriter::new(storage.clone()),
                assembler: Assembler::new(storage),
                sandbox,
                options,
            }),
        }
    }

    /// Service staging on the local filesystem, as configured
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            Arc::new(LocalChunkStorage::new(&config.staging_dir)),
            PathSandbox::new(&config.asset_root),
            ServiceOptions {
                enabled: config.enabled,
                limits: SessionLimits {
                    max_chunk_size: config.max_chunk_size,
                    max_total_size: config.max_total_size,
                },
                idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            },
        )
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Open a new session; it accepts chunks immediately
    pub async fn initialize(
        &self,
        owner_id: &str,
        request: &InitUploadRequest,
    ) -> Result<InitUploadResponse, UploadError> {
        if !self.inner.options.enabled {
            return Err(UploadError::Disabled);
        }

        let session = self.inner.sessions.create_session(owner_id, request).await?;

        Ok(InitUploadResponse {
            session_id: session.id.to_string(),
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
        })
    }

    /// Stage one chunk of a session
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk_index: i64,
        payload: &[u8],
    ) -> Result<ChunkProgress, UploadError> {
        let session = self.inner.sessions.get_session_by_str(session_id)?;
        self.inner.writer.write_chunk(&session, chunk_index, payload).await
    }

    /// Read-only view of a session; does not count as activity
    pub async fn status(&self, session_id: &str) -> Result<UploadStatusResponse, UploadError> {
        let session = self.inner.sessions.get_session_by_str(session_id)?;
        let progress = session.lock().await;

        Ok(UploadStatusResponse {
            session_id: session.id.to_string(),
            file_name: session.file_name.clone(),
            state: progress.state,
            uploaded_chunks: progress.uploaded_chunks.iter().copied().collect(),
            total_chunks: session.total_chunks,
            is_complete: session.is_complete(&progress),
            created_at: session.created_at,
            last_activity_at: progress.last_activity_at,
        })
    }

    /// Assemble a complete session into its destination.
    ///
    /// On failure the session goes back to `Receiving` so the caller can
    /// retry or cancel.
    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeUploadResponse, UploadError> {
        let session = self.inner.sessions.get_session_by_str(session_id)?;

        let destination = self
            .inner
            .sandbox
            .resolve(session.upload_type, &session.relative_path, &session.file_name)
            .inspect_err(|_| {
                tracing::warn!(
                    session_id = %session.id,
                    owner_id = %session.owner_id,
                    upload_type = %session.upload_type,
                    relative_path = %session.relative_path,
                    file_name = %session.file_name,
                    "Upload destination escapes the sandbox"
                );
            })?;

        {
            let mut progress = session.lock().await;
            if progress.state != SessionState::Receiving {
                return Err(UploadError::SessionClosed {
                    session_id: session.id.to_string(),
                    state: progress.state,
                });
            }
            if !session.is_complete(&progress) {
                return Err(UploadError::IncompleteSession {
                    uploaded: progress.uploaded_chunks.len(),
                    total: session.total_chunks,
                });
            }
            progress.state = SessionState::Finalizing;
        }

        tracing::info!(
            session_id = %session.id,
            file_name = %session.file_name,
            chunks = session.total_chunks,
            "Assembling file from chunks"
        );

        let assembled = match self.inner.assembler.assemble(&session, &destination).await {
            Ok(assembled) => assembled,
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to finalize upload"
                );
                reopen(&session).await;
                return Err(e);
            }
        };

        let sha256 = assembled.sha256.clone();
        let size = {
            let mut progress = session.lock().await;
            if progress.state != SessionState::Finalizing {
                let err = UploadError::SessionClosed {
                    session_id: session.id.to_string(),
                    state: progress.state,
                };
                drop(progress);
                assembled.discard().await;
                return Err(err);
            }

            match assembled.commit().await {
                Ok(size) => {
                    progress.state = SessionState::Completed;
                    size
                }
                Err(e) => {
                    progress.state = SessionState::Receiving;
                    tracing::error!(
                        session_id = %session.id,
                        error = %e,
                        "Failed to move assembled file into place"
                    );
                    return Err(UploadError::Storage(e));
                }
            }
        };

        self.inner
            .sessions
            .remove_session(session.id, SessionState::Completed)
            .await;

        tracing::info!(
            session_id = %session.id,
            file_name = %session.file_name,
            size = size,
            path = %destination.relative,
            "Finalized chunked upload"
        );

        Ok(FinalizeUploadResponse {
            success: true,
            file_name: session.file_name.clone(),
            size,
            path: destination.relative,
            sha256,
        })
    }

    /// Drop a session and its staged chunks unconditionally
    pub async fn cancel(&self, session_id: &str) -> Result<(), UploadError> {
        let session = self.inner.sessions.get_session_by_str(session_id)?;
        self.inner
            .sessions
            .remove_session(session.id, SessionState::Cancelled)
            .await
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;

        tracing::info!(session_id = %session.id, "Cancelled upload session");
        Ok(())
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Expire sessions idle past the configured timeout.
    ///
    /// A timeout reaching back before the earliest representable time
    /// expires nothing.
    pub async fn sweep_idle(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.inner.options.idle_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout));
        match cutoff {
            Some(cutoff) => self.sweep_idle_before(cutoff).await,
            None => 0,
        }
    }

    /// Expire sessions whose last activity is before `cutoff`
    pub async fn sweep_idle_before(&self, cutoff: DateTime<Utc>) -> usize {
        let expired = self.inner.sessions.expire_idle(cutoff).await;
        for session in &expired {
            tracing::info!(
                session_id = %session.id,
                file_name = %session.file_name,
                "Expired idle upload session"
            );
        }
        expired.len()
    }

    /// Remove staging areas left behind by a previous process
    pub async fn purge_orphaned_staging(&self) -> io::Result<usize> {
        let count = self.inner.sessions.storage().purge_all().await?;
        if count > 0 {
            tracing::info!(count = count, "Removed orphaned staging areas");
        }
        Ok(count)
    }

    /// Start background idle-session reaper
    pub fn start_sweeper(self, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.sweep_idle().await;
            }
        })
    }
}

/// Put a session whose finalize failed back into `Receiving`
async fn reopen(session: &UploadSession) {
    let mut progress = session.lock().await;
    if progress.state == SessionState::Finalizing {
        progress.state = SessionState::Receiving;
    }
}

// ============================================================================
// Tests
// ============================================================================
