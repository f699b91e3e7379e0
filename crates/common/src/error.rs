//! Shared error types used across rangefs crates.

use thiserror::Error;

/// Path-related errors shared across crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Path is invalid or malformed.
    #[error("Invalid path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: String,
    },

    /// Path is outside the expected root directory.
    #[error("Path is outside root: {path} not in {root}")]
    PathOutsideRoot {
        /// The path that was checked.
        path: String,
        /// The root directory it should be within.
        root: String,
    },

    /// IO error occurred while accessing path.
    #[error("IO error at {path}: {message}")]
    IoError {
        /// Path where error occurred.
        path: String,
        /// Error message.
        message: String,
    },
}

impl PathError {
    /// Create an IoError from std::io::Error.
    ///
    /// # Arguments
    /// * `path` - Path where the error occurred
    /// * `err` - The underlying IO error
    pub fn from_io(path: impl Into<String>, err: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
