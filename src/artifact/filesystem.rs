//! Filesystem utilities for the staging trees.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Remove `dir` if present and create it empty.
pub fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("removing stale directory '{}'", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating directory '{}'", dir.display()))?;
    Ok(())
}

/// Recursively copy a directory, preserving symlinks and file modes.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.exists() || target.is_symlink() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to create symlink: {}", target.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy file: {}", entry.path().display()))?;
        }
    }

    Ok(())
}

/// Top-level entries of `dir` whose names don't start with `.`, sorted.
///
/// A missing directory has no entries.
pub fn visible_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with('.') {
            entries.push(entry);
        }
    }
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Grant the owner write access to everything below `root`.
///
/// ISO 9660 extraction reproduces the medium's read-only modes; the staging
/// copy has to be mutable. Directories also get owner execute so they stay
/// traversable.
pub fn make_tree_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata of '{}'", entry.path().display()))?;
        let mode = metadata.permissions().mode();
        let wanted = if metadata.is_dir() {
            mode | 0o700
        } else {
            mode | 0o200
        };
        if wanted != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(wanted)).with_context(
                || format!("making '{}' writable", entry.path().display()),
            )?;
        }
    }
    Ok(())
}

/// Sibling of `dest` that a write lands in before it is renamed into place.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
