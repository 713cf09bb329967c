//! Asset Upload Server Library
//!
//! Resumable chunked uploads of game assets from the editor into the update
//! server's asset tree. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `upload`: Sessions, chunk staging, assembly and the destination sandbox
//! - `routes`: HTTP surface over the upload service
//! - `config`: Environment-driven configuration

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;
