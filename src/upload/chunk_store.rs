//! Chunk Store
//!
//! Per-session staging area for received chunk payloads before assembly.
//! Payloads are first written under a private temporary name and only moved
//! to their index-addressed name once durable, so a chunk file that exists
//! under its final name is always complete.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

/// Extra passes over a detached session directory that a late writer refilled
const REMOVE_RETRIES: usize = 8;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// A payload written to staging but not yet visible under its index
#[derive(Debug)]
pub struct StagedChunk {
    pub session_id: Uuid,
    pub chunk_index: u32,
    pub(crate) temp_path: PathBuf,
}

/// Trait for chunk staging backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Create the staging area for a new session, returning its location
    async fn provision(&self, session_id: Uuid) -> io::Result<PathBuf>;

    /// Durably write a payload under a temporary name
    async fn stage(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> io::Result<StagedChunk>;

    /// Move a staged payload to its index-addressed location
    async fn commit(&self, staged: StagedChunk) -> io::Result<()>;

    /// Drop a staged payload that will never be committed
    async fn discard(&self, staged: StagedChunk);

    /// Open a committed chunk for reading; `None` if it is not there
    async fn open(
        &self,
        session_id: Uuid,
        chunk_index: u32,
    ) -> io::Result<Option<Box<dyn AsyncRead + Send + Unpin>>>;

    /// Delete the staging area of a session; returns whether anything was removed
    async fn remove_session(&self, session_id: Uuid) -> io::Result<bool>;

    /// Delete every staging area, used at startup when no session can be resumed
    async fn purge_all(&self) -> io::Result<usize>;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
#[derive(Debug, Clone)]
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn session_dir(&self, session_id: Uuid) -> PathBuf {
        self.base_path.join(session_id.to_string())
    }

    pub fn chunk_path(&self, session_id: Uuid, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.chunk", chunk_index))
    }

    fn temp_path(&self, session_id: Uuid, chunk_index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{:08}.{}.part", chunk_index, Uuid::new_v4().simple()))
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn provision(&self, session_id: Uuid) -> io::Result<PathBuf> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn stage(
        &self,
        session_id: Uuid,
        chunk_index: u32,
        data: &[u8],
    ) -> io::Result<StagedChunk> {
        let temp_path = self.temp_path(session_id, chunk_index);

        // create_new so a cancelled session's directory is never recreated
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        let written: io::Result<()> = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            remove_quietly(&temp_path).await;
            return Err(e);
        }

        Ok(StagedChunk {
            session_id,
            chunk_index,
            temp_path,
        })
    }

    async fn commit(&self, staged: StagedChunk) -> io::Result<()> {
        let target = self.chunk_path(staged.session_id, staged.chunk_index);
        if let Err(e) = tokio::fs::rename(&staged.temp_path, &target).await {
            remove_quietly(&staged.temp_path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn discard(&self, staged: StagedChunk) {
        if let Err(e) = tokio::fs::remove_file(&staged.temp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    session_id = %staged.session_id,
                    chunk_index = staged.chunk_index,
                    error = %e,
                    "Failed to discard staged chunk"
                );
            }
        }
    }

    async fn open(
        &self,
        session_id: Uuid,
        chunk_index: u32,
    ) -> io::Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        match tokio::fs::File::open(self.chunk_path(session_id, chunk_index)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove_session(&self, session_id: Uuid) -> io::Result<bool> {
        // Detach first: once renamed, nothing new can be created under the session path
        let detached = self
            .base_path
            .join(format!(".{}.{}.removing", session_id, Uuid::new_v4().simple()));
        match tokio::fs::rename(self.session_dir(session_id), &detached).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }

        let mut attempt = 0;
        loop {
            match tokio::fs::remove_dir_all(&detached).await {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(_) if attempt < REMOVE_RETRIES => {
                    attempt += 1;
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn purge_all(&self) -> io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                count += 1;
            }
        }

        Ok(count)
    }
}

/// Best-effort removal of a temp file whose write already failed
async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged file");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
