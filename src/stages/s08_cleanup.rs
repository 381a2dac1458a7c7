//! Remove scratch state. Never fails the build.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Remove each path, logging (not returning) failures. Returns the paths
/// that could not be removed.
pub fn remove_scratch(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut failed = Vec::new();
    for path in paths {
        if let Err(err) = remove_path(path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove scratch path");
            failed.push(path.clone());
        }
    }
    failed
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
