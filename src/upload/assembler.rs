//! Chunk Assembler
//!
//! Concatenates the staged chunks of a complete session, strictly in index
//! order, into a hidden temporary file next to the destination. The result
//! only becomes visible under its real name through [`AssembledFile::commit`],
//! so a failed assembly never leaves a partial destination file behind.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use super::chunk_store::ChunkStorage;
use super::sandbox::ResolvedPath;
use super::session::UploadSession;
use super::types::UploadError;

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// A fully written file that has not been moved into place yet
#[derive(Debug)]
pub struct AssembledFile {
    pub temp_path: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl AssembledFile {
    /// Move the file to its destination, replacing any previous version
    pub async fn commit(self) -> io::Result<u64> {
        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.destination).await {
            self.remove_temp().await;
            return Err(e);
        }
        Ok(self.size)
    }

    pub async fn discard(self) {
        self.remove_temp().await;
    }

    async fn remove_temp(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.temp_path.display(),
                    error = %e,
                    "Failed to remove assembled temp file"
                );
            }
        }
    }
}

#[derive(Clone)]
pub struct Assembler {
    storage: Arc<dyn ChunkStorage>,
}

impl Assembler {
    pub fn new(storage: Arc<dyn ChunkStorage>) -> Self {
        Self { storage }
    }

    /// Assemble `session` for `destination`
    pub async fn assemble(
        &self,
        session: &UploadSession,
        destination: &ResolvedPath,
    ) -> Result<AssembledFile, UploadError> {
        {
            let progress = session.lock().await;
            if !session.is_complete(&progress) {
                return Err(UploadError::IncompleteSession {
                    uploaded: progress.uploaded_chunks.len(),
                    total: session.total_chunks,
                });
            }
        }

        tokio::fs::create_dir_all(&destination.directory).await?;

        // Fixed-length name so any legal file name still fits
        let temp_path = destination
            .directory
            .join(format!(".{}.partial", session.id.simple()));

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        match self.copy_chunks(session, file).await {
            Ok((size, sha256)) => {
                if size != session.total_size {
                    tracing::warn!(
                        session_id = %session.id,
                        expected = session.total_size,
                        actual = size,
                        "Assembled size differs from declared total size"
                    );
                }
                Ok(AssembledFile {
                    temp_path,
                    destination: destination.file_path.clone(),
                    size,
                    sha256,
                })
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&temp_path).await {
                    tracing::warn!(
                        session_id = %session.id,
                        path = %temp_path.display(),
                        error = %remove_err,
                        "Failed to remove partial file"
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_chunks(
        &self,
        session: &UploadSession,
        file: tokio::fs::File,
    ) -> Result<(u64, String), UploadError> {
        let mut writer = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;

        for index in 0..session.total_chunks {
            let corrupt = |e: Option<io::Error>| {
                tracing::error!(
                    session_id = %session.id,
                    chunk_index = index,
                    error = ?e,
                    "Recorded chunk could not be read"
                );
                UploadError::CorruptSession { index }
            };

            let mut reader = match self.storage.open(session.id, index).await {
                Ok(Some(reader)) => reader,
                Ok(None) => return Err(corrupt(None)),
                Err(e) => return Err(corrupt(Some(e))),
            };

            loop {
                let n = reader.read(&mut buf).await.map_err(|e| corrupt(Some(e)))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        Ok((total, hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::LocalChunkStorage;
    use crate::upload::sandbox::{PathSandbox, MAX_FILE_NAME_BYTES};
    use crate::upload::session::{SessionLimits, SessionManager};
    use crate::upload::types::{InitUploadRequest, UploadType};
    use crate::upload::writer::ChunkWriter;
    use tempfile::TempDir;

    struct Fixture {
        _staging: TempDir,
        assets: TempDir,
        storage: Arc<dyn ChunkStorage>,
        session: Arc<UploadSession>,
    }

    async fn fixture(total_size: i64, chunk_size: i64) -> Fixture {
        fixture_named("data.bin", total_size, chunk_size).await
    }

    async fn fixture_named(file_name: &str, total_size: i64, chunk_size: i64) -> Fixture {
        let staging = TempDir::new().unwrap();
        let assets = TempDir::new().unwrap();
        let storage: Arc<dyn ChunkStorage> = Arc::new(LocalChunkStorage::new(staging.path()));
        let manager = SessionManager::new(storage.clone(), SessionLimits::default());
        let session = manager
            .create_session(
                "dev",
                &InitUploadRequest {
                    file_name: file_name.to_string(),
                    relative_path: Some("packs".to_string()),
                    upload_type: "editor".to_string(),
                    total_size,
                    chunk_size,
                },
            )
            .await
            .unwrap();
        Fixture {
            _staging: staging,
            assets,
            storage,
            session,
        }
    }

    fn destination(fixture: &Fixture) -> ResolvedPath {
        PathSandbox::new(fixture.assets.path())
            .resolve(UploadType::Editor, "packs", "data.bin")
            .unwrap()
    }

    #[tokio::test]
    async fn test_assembles_in_index_order() {
        let fixture = fixture(25, 10).await;
        let writer = ChunkWriter::new(fixture.storage.clone());
        writer.write_chunk(&fixture.session, 2, b"ccccc").await.unwrap();
        writer.write_chunk(&fixture.session, 0, b"aaaaaaaaaa").await.unwrap();
        writer.write_chunk(&fixture.session, 1, b"bbbbbbbbbb").await.unwrap();

        let dest = destination(&fixture);
        let assembled = Assembler::new(fixture.storage.clone())
            .assemble(&fixture.session, &dest)
            .await
            .unwrap();
        assert_eq!(assembled.size, 25);
        assert!(!dest.file_path.exists());

        let expected = b"aaaaaaaaaabbbbbbbbbbccccc";
        assert_eq!(assembled.sha256, hex::encode(Sha256::digest(expected)));

        assembled.commit().await.unwrap();
        assert_eq!(tokio::fs::read(&dest.file_path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_long_file_name_assembles() {
        let file_name = format!("{}.bin", "n".repeat(MAX_FILE_NAME_BYTES - 4));
        let fixture = fixture_named(&file_name, 4, 10).await;
        ChunkWriter::new(fixture.storage.clone())
            .write_chunk(&fixture.session, 0, b"data")
            .await
            .unwrap();

        let dest = PathSandbox::new(fixture.assets.path())
            .resolve(UploadType::Editor, "packs", &file_name)
            .unwrap();
        let assembled = Assembler::new(fixture.storage.clone())
            .assemble(&fixture.session, &dest)
            .await
            .unwrap();
        assembled.commit().await.unwrap();
        assert_eq!(tokio::fs::read(&dest.file_path).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_incomplete_session_is_rejected() {
        let fixture = fixture(25, 10).await;
        let writer = ChunkWriter::new(fixture.storage.clone());
        writer.write_chunk(&fixture.session, 0, b"aaaaaaaaaa").await.unwrap();

        let result = Assembler::new(fixture.storage.clone())
            .assemble(&fixture.session, &destination(&fixture))
            .await;
        assert!(matches!(
            result,
            Err(UploadError::IncompleteSession { uploaded: 1, total: 3 })
        ));
    }

    #[tokio::test]
    async fn test_missing_staged_chunk_leaves_no_partial_file() {
        let fixture = fixture(20, 10).await;
        let writer = ChunkWriter::new(fixture.storage.clone());
        writer.write_chunk(&fixture.session, 0, b"aaaaaaaaaa").await.unwrap();
        writer.write_chunk(&fixture.session, 1, b"bbbbbbbbbb").await.unwrap();

        tokio::fs::remove_file(fixture.session.staging_location.join("00000001.chunk"))
            .await
            .unwrap();

        let dest = destination(&fixture);
        let result = Assembler::new(fixture.storage.clone())
            .assemble(&fixture.session, &dest)
            .await;
        assert!(matches!(result, Err(UploadError::CorruptSession { index: 1 })));

        let mut entries = tokio::fs::read_dir(&dest.directory).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_discard_removes_temp_file() {
        let fixture = fixture(5, 10).await;
        let writer = ChunkWriter::new(fixture.storage.clone());
        writer.write_chunk(&fixture.session, 0, b"hello").await.unwrap();

        let dest = destination(&fixture);
        let assembled = Assembler::new(fixture.storage.clone())
            .assemble(&fixture.session, &dest)
            .await
            .unwrap();
        let temp_path = assembled.temp_path.clone();
        assert!(temp_path.exists());

        assembled.discard().await;
        assert!(!temp_path.exists());
        assert!(!dest.file_path.exists());
    }
}
