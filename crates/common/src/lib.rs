//! Shared types and utilities for rangefs.
//!
//! This crate provides common functionality used across the rangefs crates:
//! - Default cache tuning constants
//! - Content identities (XXH3-128)
//! - Virtual path helpers
//! - Shared error types

pub mod constants;
pub mod error;
pub mod hash;
pub mod path_utils;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::PathError;
pub use hash::{content_id_for_bytes, content_id_for_file, CONTENT_ID_PREFIX};
pub use path_utils::{file_name, normalize_virtual_path, path_to_keys};
