//! Helpers for virtual filesystem paths.
//!
//! Virtual paths are always POSIX style and rooted: `/`, `/a`, `/a/b.txt`.

use crate::error::PathError;

/// Normalize a virtual path.
///
/// Ensures a single leading `/`, drops trailing slashes, empty segments and
/// `.` segments. `..` is never resolved and is rejected instead.
///
/// # Arguments
/// * `path` - Path as received from the filesystem layer
///
/// # Errors
/// Returns `PathError::InvalidPath` if the path contains a `..` segment.
pub fn normalize_virtual_path(path: &str) -> Result<String, PathError> {
    let keys: Vec<&str> = path_to_keys(path);
    if keys.iter().any(|k: &&str| *k == "..") {
        return Err(PathError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(format!("/{}", keys.join("/")))
}

/// Split a virtual path into its segments.
///
/// The root (`/` or empty) yields no segments.
///
/// # Arguments
/// * `path` - Virtual path
pub fn path_to_keys(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|segment: &&str| !segment.is_empty() && *segment != ".")
        .collect()
}

/// Last segment of a virtual path, or `None` for the root.
///
/// # Arguments
/// * `path` - Virtual path
pub fn file_name(path: &str) -> Option<&str> {
    path_to_keys(path).last().copied()
}
