//! Destination Sandbox
//!
//! Resolves `asset root / upload type / relative path / file name` lexically
//! and refuses anything that climbs out of the upload-type root. Nothing is
//! touched on disk here; directory creation happens after a successful resolve.

use std::path::PathBuf;

use super::types::{UploadError, UploadType};

/// Longest file name most filesystems accept, in bytes
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// A destination that stayed inside its upload-type root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Directory the file lands in
    pub directory: PathBuf,

    /// Absolute destination of the assembled file
    pub file_path: PathBuf,

    /// Destination relative to the asset root, '/'-separated
    pub relative: String,
}

/// Bounds finalized uploads to the configured asset root
#[derive(Debug, Clone)]
pub struct PathSandbox {
    asset_root: PathBuf,
}

impl PathSandbox {
    pub fn new(asset_root: impl Into<PathBuf>) -> Self {
        Self {
            asset_root: asset_root.into(),
        }
    }

    /// Root directory for one upload type
    pub fn type_root(&self, upload_type: UploadType) -> PathBuf {
        self.asset_root.join(upload_type.as_str())
    }

    /// Resolve a destination, or `Forbidden` if it escapes the upload-type root
    pub fn resolve(
        &self,
        upload_type: UploadType,
        relative_path: &str,
        file_name: &str,
    ) -> Result<ResolvedPath, UploadError> {
        if validate_file_name(file_name).is_err() {
            return Err(UploadError::Forbidden);
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in relative_path.trim().split(['/', '\\']) {
            match segment {
                "" | "." => continue,
                ".." => {
                    if segments.pop().is_none() {
                        return Err(UploadError::Forbidden);
                    }
                }
                s if s.contains(':') => return Err(UploadError::Forbidden),
                s => segments.push(s),
            }
        }

        let mut directory = self.type_root(upload_type);
        directory.extend(&segments);
        let file_path = directory.join(file_name);

        let mut relative = String::from(upload_type.as_str());
        for segment in &segments {
            relative.push('/');
            relative.push_str(segment);
        }
        relative.push('/');
        relative.push_str(file_name);

        Ok(ResolvedPath {
            directory,
            file_path,
            relative,
        })
    }
}

/// A file name must be a single, real path segment
pub fn validate_file_name(file_name: &str) -> Result<(), UploadError> {
    let trimmed = file_name.trim();
    if trimmed.is_empty() {
        return Err(UploadError::invalid("File name is required"));
    }
    if trimmed != file_name {
        return Err(UploadError::invalid(
            "File name must not have leading or trailing whitespace",
        ));
    }
    if file_name == "." || file_name == ".." {
        return Err(UploadError::invalid("File name must not be a directory reference"));
    }
    if file_name.contains(['/', '\\', ':', '\0']) {
        return Err(UploadError::invalid("File name must not contain path separators"));
    }
    if file_name.len() > MAX_FILE_NAME_BYTES {
        return Err(UploadError::InvalidRequest(format!(
            "File name must be at most {MAX_FILE_NAME_BYTES} bytes"
        )));
    }
    Ok(())
}
