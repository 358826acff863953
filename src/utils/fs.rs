//! File system helpers shared by the upgrade components.
//!
//! The persisted records (plan, status) are small JSON documents that must
//! never be observed half-written, so they go through [`atomic_write`]. Paths
//! derived from the target executable (staged, backup) go through
//! [`with_suffix`] so the derived file always lives in the same directory,
//! and therefore on the same filesystem, as the target.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Ensures a directory exists, creating it and its parents if necessary.
///
/// # Errors
///
/// Fails if the path exists but is not a directory, or if creation fails.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    } else if !path.is_dir() {
        return Err(anyhow::anyhow!("Path exists but is not a directory: {}", path.display()));
    }
    Ok(())
}

/// Atomically writes bytes to a file using a write-then-rename strategy.
///
/// 1. Writes content to a sibling temporary file (`<name>.tmp`)
/// 2. Syncs the temporary file to disk
/// 3. Renames the temporary file over the target path
///
/// Readers see either the previous content or the new content, never a prefix.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let temp_path = with_suffix(path, ".tmp");

    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        file.write_all(content)
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;

        file.sync_all().with_context(|| "Failed to sync file to disk")?;
    }

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;

    Ok(())
}

/// Appends `suffix` to the full file name of `path`.
///
/// Unlike [`Path::with_extension`], an existing extension is kept:
/// `svc.exe` becomes `svc.exe.new`, not `svc.new`.
#[must_use]
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Removes a file, treating "not found" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
