//! Error types for backend operations.

use rangefs_cache::CacheError;
use rangefs_common::PathError;
use thiserror::Error;

/// Errors that can occur while answering filesystem requests.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// Path does not exist.
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    /// Operation not permitted on this kind of entry.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    /// Backend root directory does not exist.
    #[error("Root path ({root}) is not real")]
    RootMissing { root: String },

    /// Filesystem image could not be parsed or is inconsistent.
    #[error("Invalid filesystem image: {message}")]
    InvalidImage { message: String },

    /// Local I/O error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Malformed virtual path.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Block cache read failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl BackendError {
    /// Errno the filesystem layer should reply with.
    pub fn errno(&self) -> i32 {
        match self {
            BackendError::NotFound { .. } => libc::ENOENT,
            BackendError::RootMissing { .. } => libc::ENOENT,
            BackendError::PermissionDenied { .. } => libc::EACCES,
            BackendError::InvalidImage { .. } => libc::EIO,
            BackendError::Io { .. } => libc::EIO,
            BackendError::Path(_) => libc::EINVAL,
            BackendError::Cache(CacheError::CacheTimeout { .. }) => libc::EAGAIN,
            BackendError::Cache(CacheError::InvalidArgument { .. }) => libc::EINVAL,
            BackendError::Cache(_) => libc::EIO,
        }
    }

    /// Check if the filesystem layer may retry the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Cache(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn not_found(path: &str) -> Self {
        BackendError::NotFound {
            path: path.to_string(),
        }
    }

    pub(crate) fn denied(path: &str) -> Self {
        BackendError::PermissionDenied {
            path: path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(BackendError::not_found("/x").errno(), libc::ENOENT);
        assert_eq!(BackendError::denied("/").errno(), libc::EACCES);

        let timeout: BackendError = CacheError::CacheTimeout {
            block: 0,
            waited: Duration::from_secs(7),
        }
        .into();
        assert_eq!(timeout.errno(), libc::EAGAIN);
        assert!(timeout.is_retryable());

        let invalid: BackendError = PathError::InvalidPath {
            path: "/a/../b".to_string(),
        }
        .into();
        assert_eq!(invalid.errno(), libc::EINVAL);
        assert!(!invalid.is_retryable());
    }
}
