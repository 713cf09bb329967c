//! Chunk Writer
//!
//! Stages one inbound chunk and records its arrival in the session.
//! The payload is made durable before the index is published in
//! `uploaded_chunks`, and publishing happens under the session lock so a
//! concurrent cancel either sees the chunk committed or never sees it at all.

use std::sync::Arc;

use chrono::Utc;

use super::chunk_store::ChunkStorage;
use super::session::{SessionProgress, UploadSession};
use super::types::{ChunkOutcome, ChunkProgress, SessionState, UploadError};

#[derive(Clone)]
pub struct ChunkWriter {
    storage: Arc<dyn ChunkStorage>,
}

impl ChunkWriter {
    pub fn new(storage: Arc<dyn ChunkStorage>) -> Self {
        Self { storage }
    }

    /// Stage `payload` as chunk `chunk_index` of `session`.
    ///
    /// Every chunk but the last must be exactly `chunk_size` bytes long; the
    /// last one carries the remainder of `total_size`.
    ///
    /// Re-sending an index that is already recorded is not an error: the
    /// staged payload is left untouched and `Duplicate` is reported with the
    /// current progress.
    pub async fn write_chunk(
        &self,
        session: &UploadSession,
        chunk_index: i64,
        payload: &[u8],
    ) -> Result<ChunkProgress, UploadError> {
        let index = u32::try_from(chunk_index)
            .ok()
            .filter(|i| *i < session.total_chunks)
            .ok_or(UploadError::InvalidChunkIndex {
                index: chunk_index,
                total: session.total_chunks,
            })?;

        if payload.is_empty() {
            return Err(UploadError::invalid("No file data provided"));
        }
        if payload.len() as u64 > session.chunk_size {
            return Err(UploadError::InvalidRequest(format!(
                "Chunk of {} bytes exceeds the session chunk size of {} bytes",
                payload.len(),
                session.chunk_size
            )));
        }

        {
            let progress = session.lock().await;
            if progress.state.is_terminal() {
                return Err(closed(session, &progress));
            }
            if progress.uploaded_chunks.contains(&index) {
                return Ok(duplicate(session, index, &progress));
            }
            if progress.state != SessionState::Receiving {
                return Err(closed(session, &progress));
            }
        }

        let expected = session.expected_chunk_len(index);
        if payload.len() as u64 != expected {
            return Err(UploadError::InvalidRequest(format!(
                "Chunk {} must be {} bytes, got {}",
                index,
                expected,
                payload.len()
            )));
        }

        let staged = match self.storage.stage(session.id, index, payload).await {
            Ok(staged) => staged,
            Err(e) => {
                let progress = session.lock().await;
                if progress.state.is_terminal() {
                    return Err(closed(session, &progress));
                }
                tracing::error!(
                    session_id = %session.id,
                    chunk_index = index,
                    error = %e,
                    "Failed to save chunk"
                );
                return Err(UploadError::Storage(e));
            }
        };

        let mut progress = session.lock().await;

        if progress.state != SessionState::Receiving {
            let err = closed(session, &progress);
            drop(progress);
            self.storage.discard(staged).await;
            // The cancel may have swept the directory before our payload landed in it
            if let Err(e) = self.storage.remove_session(session.id).await {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Failed to clean up staging area after late chunk"
                );
            }
            return Err(err);
        }

        if progress.uploaded_chunks.contains(&index) {
            // Lost a race against a retry of the same chunk
            let report = duplicate(session, index, &progress);
            drop(progress);
            self.storage.discard(staged).await;
            return Ok(report);
        }

        self.storage.commit(staged).await?;
        progress.uploaded_chunks.insert(index);
        progress.last_activity_at = Utc::now();

        tracing::debug!(
            session_id = %session.id,
            chunk_index = index,
            bytes = payload.len(),
            uploaded = progress.uploaded_chunks.len(),
            total_chunks = session.total_chunks,
            "Chunk uploaded"
        );

        Ok(report(session, index, ChunkOutcome::Accepted, &progress))
    }
}

fn report(
    session: &UploadSession,
    chunk_index: u32,
    outcome: ChunkOutcome,
    progress: &SessionProgress,
) -> ChunkProgress {
    ChunkProgress {
        chunk_index,
        outcome,
        uploaded_count: progress.uploaded_chunks.len(),
        total_chunks: session.total_chunks,
        is_complete: session.is_complete(progress),
    }
}

fn duplicate(session: &UploadSession, chunk_index: u32, progress: &SessionProgress) -> ChunkProgress {
    tracing::warn!(
        session_id = %session.id,
        chunk_index = chunk_index,
        "Chunk already uploaded"
    );
    report(session, chunk_index, ChunkOutcome::Duplicate, progress)
}

fn closed(session: &UploadSession, progress: &SessionProgress) -> UploadError {
    UploadError::SessionClosed {
        session_id: session.id.to_string(),
        state: progress.state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::LocalChunkStorage;
    use crate::upload::session::{SessionLimits, SessionManager};
    use crate::upload::types::InitUploadRequest;
    use tempfile::TempDir;

    async fn setup(temp_dir: &TempDir) -> (SessionManager, ChunkWriter, Arc<UploadSession>) {
        let storage: Arc<dyn ChunkStorage> = Arc::new(LocalChunkStorage::new(temp_dir.path()));
        let manager = SessionManager::new(storage.clone(), SessionLimits::default());
        let session = manager
            .create_session(
                "dev",
                &InitUploadRequest {
                    file_name: "music.ogg".to_string(),
                    relative_path: None,
                    upload_type: "client".to_string(),
                    total_size: 25,
                    chunk_size: 10,
                },
            )
            .await
            .unwrap();
        (manager, ChunkWriter::new(storage), session)
    }

    #[tokio::test]
    async fn test_accepts_and_reports_progress() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        let progress = writer.write_chunk(&session, 2, b"tail!").await.unwrap();
        assert_eq!(progress.outcome, ChunkOutcome::Accepted);
        assert_eq!(progress.uploaded_count, 1);
        assert_eq!(progress.total_chunks, 3);
        assert!(!progress.is_complete);

        let staged = session.staging_location.join("00000002.chunk");
        assert_eq!(tokio::fs::read(staged).await.unwrap(), b"tail!");
    }

    #[tokio::test]
    async fn test_duplicate_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        let first = writer.write_chunk(&session, 0, b"0123456789").await.unwrap();
        let second = writer.write_chunk(&session, 0, b"XXXXXXXXXX").await.unwrap();

        assert_eq!(first.outcome, ChunkOutcome::Accepted);
        assert_eq!(second.outcome, ChunkOutcome::Duplicate);
        assert_eq!(first.uploaded_count, second.uploaded_count);
        assert_eq!(first.is_complete, second.is_complete);

        let staged = session.staging_location.join("00000000.chunk");
        assert_eq!(tokio::fs::read(staged).await.unwrap(), b"0123456789");

        let mut entries = tokio::fs::read_dir(&session.staging_location).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_index() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        for index in [-1, 3, i64::MAX] {
            let result = writer.write_chunk(&session, index, b"data").await;
            assert!(matches!(
                result,
                Err(UploadError::InvalidChunkIndex { total: 3, .. })
            ));
        }
        assert!(session.lock().await.uploaded_chunks.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        assert!(matches!(
            writer.write_chunk(&session, 0, b"").await,
            Err(UploadError::InvalidRequest(_))
        ));
        assert!(matches!(
            writer.write_chunk(&session, 0, b"01234567890").await,
            Err(UploadError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_wrong_chunk_length() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        // Short middle chunk
        assert!(matches!(
            writer.write_chunk(&session, 1, b"short").await,
            Err(UploadError::InvalidRequest(_))
        ));
        // Full-size last chunk where only the remainder fits
        assert!(matches!(
            writer.write_chunk(&session, 2, b"0123456789").await,
            Err(UploadError::InvalidRequest(_))
        ));
        assert!(session.lock().await.uploaded_chunks.is_empty());

        let mut entries = tokio::fs::read_dir(&session.staging_location).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_writes_after_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, writer, session) = setup(&temp_dir).await;

        manager.remove_session(session.id, SessionState::Cancelled).await;

        let result = writer.write_chunk(&session, 0, b"late").await;
        assert!(matches!(
            result,
            Err(UploadError::SessionClosed {
                state: SessionState::Cancelled,
                ..
            })
        ));
        assert!(!session.staging_location.exists());
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_session() {
        let temp_dir = TempDir::new().unwrap();
        let (_manager, writer, session) = setup(&temp_dir).await;

        let results = futures::future::join_all((0..3).map(|i| {
            let writer = writer.clone();
            let session = session.clone();
            async move {
                let payload: &[u8] = if i == 2 { b"chunk" } else { b"chunk-body" };
                writer.write_chunk(&session, i, payload).await
            }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        let progress = session.lock().await;
        assert_eq!(progress.uploaded_chunks.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(session.is_complete(&progress));
    }
}
