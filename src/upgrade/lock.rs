//! Instance lock serializing upgrade attempts within one working directory.
//!
//! At most one upgrade may run per installation. The lock is non-blocking: a
//! second attempt fails immediately with
//! [`UpgradeError::AlreadyInProgress`] instead of queueing behind the first.
//!
//! # Strategies
//!
//! - [`LockStrategy::Advisory`]: an OS advisory exclusive lock on an open
//!   handle to `upgrade.lock` (via [`fs4`]). The OS drops the lock when the
//!   holder exits for any reason, including signals, so no stale-lock cleanup
//!   is ever needed. The file itself is left in place; removing a file other
//!   processes may already have opened would let two holders lock different
//!   inodes.
//! - [`LockStrategy::CreateExclusive`]: exclusive creation of `upgrade.lock`,
//!   used when the filesystem does not support advisory locks. The file is
//!   removed on release. A crash strands it, and it then has to be deleted by
//!   hand.
//!
//! Both strategies hand back the same guard type. Dropping the guard (or
//! calling [`UpgradeLock::release`]) releases the lock exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use binswap_cli::upgrade::lock::UpgradeLock;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let lock = UpgradeLock::acquire(Path::new("/var/lib/binswap/upgrade")).await?;
//! // ... stage, verify, replace ...
//! lock.release();
//! # Ok(())
//! # }
//! ```

use crate::constants::LOCK_FILE_NAME;
use crate::core::UpgradeError;
use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How the instance lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Kernel advisory exclusive lock, released automatically on process death.
    Advisory,
    /// Exclusive file creation; must be removed on release.
    CreateExclusive,
}

/// Guard for the per-installation upgrade lock.
#[derive(Debug)]
pub struct UpgradeLock {
    /// Open handle; for the advisory strategy the lock lives as long as this does
    _file: File,
    /// Path to the lock file
    path: PathBuf,
    /// Strategy the lock was acquired with
    strategy: LockStrategy,
}

enum Attempt {
    Acquired(File),
    Held,
    Unsupported(io::Error),
}

impl UpgradeLock {
    /// Acquire the lock for `work_dir`, creating the directory if needed.
    ///
    /// Uses the advisory strategy and falls back to exclusive creation only
    /// when the filesystem reports advisory locks as unsupported.
    ///
    /// # Errors
    ///
    /// - [`UpgradeError::AlreadyInProgress`] if another attempt holds the lock
    /// - I/O errors creating the directory or opening the lock file
    pub async fn acquire(work_dir: &Path) -> Result<Self> {
        Self::acquire_inner(work_dir, LockStrategy::Advisory, true).await
    }

    /// Acquire the lock with an explicit strategy and no fallback.
    pub async fn acquire_with_strategy(work_dir: &Path, strategy: LockStrategy) -> Result<Self> {
        Self::acquire_inner(work_dir, strategy, false).await
    }

    async fn acquire_inner(work_dir: &Path, strategy: LockStrategy, fallback: bool) -> Result<Self> {
        tokio::fs::create_dir_all(work_dir).await.with_context(|| {
            format!("Failed to create upgrade working directory: {}", work_dir.display())
        })?;

        let lock_path = work_dir.join(LOCK_FILE_NAME);
        let mut strategy = strategy;

        loop {
            let path_clone = lock_path.clone();
            let attempt = tokio::task::spawn_blocking(move || match strategy {
                LockStrategy::Advisory => try_advisory(&path_clone),
                LockStrategy::CreateExclusive => try_create_exclusive(&path_clone),
            })
            .await
            .context("spawn_blocking panicked")?
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

            match attempt {
                Attempt::Acquired(file) => {
                    debug!(path = %lock_path.display(), ?strategy, "Upgrade lock acquired");
                    return Ok(Self {
                        _file: file,
                        path: lock_path,
                        strategy,
                    });
                }
                Attempt::Held => {
                    return Err(UpgradeError::AlreadyInProgress {
                        lock_path: lock_path.display().to_string(),
                    }
                    .into());
                }
                Attempt::Unsupported(e) if fallback && strategy == LockStrategy::Advisory => {
                    warn!(
                        path = %lock_path.display(),
                        error = %e,
                        "Advisory locks unsupported here, falling back to exclusive lock file creation"
                    );
                    strategy = LockStrategy::CreateExclusive;
                }
                Attempt::Unsupported(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to lock {}", lock_path.display()));
                }
            }
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strategy this guard holds the lock with.
    #[must_use]
    pub const fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Release the lock now. Equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for UpgradeLock {
    fn drop(&mut self) {
        if self.strategy == LockStrategy::CreateExclusive {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
                }
            }
        }
        debug!(path = %self.path.display(), "Upgrade lock released");
    }
}

fn try_advisory(path: &Path) -> io::Result<Attempt> {
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
    match file.try_lock_exclusive() {
        Ok(true) => Ok(Attempt::Acquired(file)),
        Ok(false) => Ok(Attempt::Held),
        Err(e) if is_unsupported(&e) => Ok(Attempt::Unsupported(e)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Attempt::Held),
        Err(e) => Err(e),
    }
}

fn try_create_exclusive(path: &Path) -> io::Result<Attempt> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            file.sync_all()?;
            Ok(Attempt::Acquired(file))
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attempt::Held),
        Err(e) => Err(e),
    }
}

fn is_unsupported(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    // ENOLCK and EOPNOTSUPP, as returned by some network filesystems
    cfg!(target_os = "linux") && matches!(e.raw_os_error(), Some(37 | 95))
}
