//! Target, staging and backup path resolution.
//!
//! Every derived path is the target's full file name plus a suffix, in the
//! target's own directory. Keeping the staged artifact next to the target
//! guarantees the final move is a same-filesystem rename.

use crate::constants::{BACKUP_SUFFIX, DISPLACED_SUFFIX, STAGED_SUFFIX};
use crate::utils::fs::with_suffix;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve the absolute path of the executable to replace.
///
/// With no explicit path the running executable is used. Symlinks are
/// resolved so the real file is mutated rather than the link; a path that
/// does not exist yet is only made absolute.
pub fn resolve_target_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe().context("Failed to get current executable path")?,
    };

    let resolved = if path.exists() {
        path.canonicalize()
            .with_context(|| format!("Failed to resolve target path: {}", path.display()))?
    } else {
        std::path::absolute(&path)
            .with_context(|| format!("Failed to make target path absolute: {}", path.display()))?
    };

    debug!(target = %resolved.display(), "Resolved upgrade target");
    Ok(resolved)
}

/// Path of the staged artifact: `<target>.new`.
#[must_use]
pub fn stage_path(target: &Path) -> PathBuf {
    with_suffix(target, STAGED_SUFFIX)
}

/// Path of the backup copy: `<target>.bak`.
#[must_use]
pub fn backup_path(target: &Path) -> PathBuf {
    with_suffix(target, BACKUP_SUFFIX)
}

/// Path a running Windows image is moved to when no backup is requested: `<target>.old`.
#[must_use]
pub fn displaced_path(target: &Path) -> PathBuf {
    with_suffix(target, DISPLACED_SUFFIX)
}
