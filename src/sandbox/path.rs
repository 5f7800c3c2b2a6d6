//! Validation of untrusted file names against a sandbox root.
//!
//! Two strictness levels exist:
//! - [`validate_name`] accepts a single plain file name only.
//! - [`resolve`] accepts nested relative paths and dot-files, and resolves
//!   them under a sandbox root.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Result, ZipstageError};

/// Why a name was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    #[error("name is empty")]
    Empty,
    #[error("name must not contain path separators")]
    Separator,
    #[error("name must not contain '..' segments")]
    ParentSegment,
    #[error("name must not start with '.'")]
    Hidden,
    #[error("absolute paths are not allowed")]
    Absolute,
    #[error("name must not contain NUL bytes")]
    NulByte,
    #[error("path resolves outside the sandbox")]
    Escapes,
}

/// Check a plain file name.
pub fn validate_name(name: &str) -> std::result::Result<(), PathRejection> {
    if name.trim().is_empty() {
        return Err(PathRejection::Empty);
    }
    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        return Err(PathRejection::Absolute);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PathRejection::Separator);
    }
    if name == ".." {
        return Err(PathRejection::ParentSegment);
    }
    if name.starts_with('.') {
        return Err(PathRejection::Hidden);
    }
    if name.contains('\0') {
        return Err(PathRejection::NulByte);
    }
    Ok(())
}

/// Resolve an untrusted relative path under `root`.
///
/// The returned path is always prefixed by `root`. When part of the target
/// already exists it is canonicalized so that symlinks cannot point outside.
pub fn resolve(root: &Path, name: &str) -> Result<PathBuf> {
    let reject = |reason| ZipstageError::invalid_path(name, reason);

    if name.trim().is_empty() {
        return Err(reject(PathRejection::Empty));
    }
    if name.contains('\0') {
        return Err(reject(PathRejection::NulByte));
    }

    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(reject(PathRejection::Absolute));
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(reject(PathRejection::ParentSegment)),
            segment => {
                resolved.push(segment);
                depth += 1;
            }
        }
    }

    if depth == 0 {
        return Err(reject(PathRejection::Empty));
    }
    if !resolved.starts_with(root) || resolved == root {
        return Err(reject(PathRejection::Escapes));
    }

    if let Ok(canonical_root) = root.canonicalize() {
        let existing = resolved
            .ancestors()
            .take(depth)
            .find(|candidate| candidate.symlink_metadata().is_ok());
        if let Some(existing) = existing {
            let canonical = existing.canonicalize().map_err(ZipstageError::Io)?;
            if !canonical.starts_with(&canonical_root) {
                return Err(reject(PathRejection::Escapes));
            }
        }
    }

    Ok(resolved)
}

/// `C:` style prefixes.
fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
