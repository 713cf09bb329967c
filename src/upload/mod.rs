//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - Independently transmitted, idempotently retried chunks
//! - Per-session staging and index-ordered reassembly
//! - A sandbox that keeps finalized files under the asset root
//!
//! Protocol Flow:
//! 1. Client initializes a session with file name, destination and sizes
//! 2. Client uploads chunks in any order, retrying freely
//! 3. Client polls status to resume after an interruption
//! 4. Client finalizes; the server assembles the file and drops the session

pub mod assembler;
pub mod chunk_store;
pub mod sandbox;
pub mod service;
pub mod session;
pub mod types;
pub mod writer;

pub use assembler::{AssembledFile, Assembler};
pub use chunk_store::{ChunkStorage, LocalChunkStorage, StagedChunk};
pub use sandbox::{PathSandbox, ResolvedPath};
pub use service::{ServiceOptions, UploadService};
pub use session::{SessionLimits, SessionManager, SessionParams, UploadSession};
pub use types::*;
pub use writer::ChunkWriter;
