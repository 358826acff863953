//! Replacement of the live executable by the staged artifact.
//!
//! Two entry points exist, matching the two ways an upgrade can finish:
//!
//! - [`direct_replace`] runs in the requesting process on hosts where a
//!   running executable can be unlinked (macOS, FreeBSD, Linux without a
//!   service restart). It backs up by *copy*, so the live file is untouched
//!   until the final rename, and restores the copy if that rename fails.
//! - [`ReplaceStrategy::replace`] runs inside a dispatched worker. The
//!   [`ReplaceStrategy::Windows`] variant retries because the old image can
//!   stay locked for a while after its process was asked to stop.
//!
//! A successful rename is the only point at which the target changes, so a
//! failure before it leaves the live binary intact.

use crate::constants::{DEFAULT_REPLACE_RETRY_INTERVAL, DEFAULT_REPLACE_TIMEOUT};
use crate::core::UpgradeError;
use crate::upgrade::backup::BackupManager;
use crate::upgrade::paths::{backup_path, displaced_path};
use crate::utils::platform::Platform;
use anyhow::Result;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

/// Progress of one upgrade attempt, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    /// Nothing started
    Idle,
    /// Instance lock held
    Locked,
    /// New binary downloaded
    Fetched,
    /// New binary copied next to the target
    Staged,
    /// Staged binary passed verification
    Verified,
    /// Replacing in the requesting process
    DirectReplace,
    /// Plan handed to a worker process or upgrader service
    DispatchedToWorker,
    /// Attempt finished
    Done,
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::Fetched => "fetched",
            Self::Staged => "staged",
            Self::Verified => "verified",
            Self::DirectReplace => "direct-replace",
            Self::DispatchedToWorker => "dispatched-to-worker",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// How long the Windows worker keeps retrying a locked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up once this much time has passed since the first attempt
    pub timeout: Duration,
    /// Pause between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    /// Pauses between attempts after the first, spread over the timeout.
    #[must_use]
    pub fn delays(&self) -> std::iter::Take<FixedInterval> {
        let interval = self.interval.max(Duration::from_millis(1));
        let retries = self.timeout.as_millis() / interval.as_millis();
        FixedInterval::new(interval).take(usize::try_from(retries).unwrap_or(usize::MAX))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REPLACE_TIMEOUT,
            interval: DEFAULT_REPLACE_RETRY_INTERVAL,
        }
    }
}

/// Replacement procedure used by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Single attempt; an unlinked running image stays valid for its process.
    Unix,
    /// Retry loop that moves the running image aside before installing.
    Windows {
        /// Timeout and interval of the retry loop
        policy: RetryPolicy,
    },
}

impl ReplaceStrategy {
    /// Pick the strategy for `platform`.
    #[must_use]
    pub fn for_platform(platform: &Platform, policy: RetryPolicy) -> Self {
        if platform.os.is_unix_like() {
            Self::Unix
        } else {
            Self::Windows {
                policy,
            }
        }
    }

    /// Move `staged` over `target`, optionally keeping the old binary as `<target>.bak`.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::ReplaceFailed`]; `rolled_back` reports whether
    /// the original binary is back in place.
    pub async fn replace(&self, staged: &Path, target: &Path, backup: bool) -> Result<()> {
        ensure_staged(staged, target).await?;
        match self {
            Self::Unix => unix_replace(staged, target, backup).await,
            Self::Windows {
                policy,
            } => windows_replace(staged, target, backup, *policy).await,
        }
    }
}

/// Replace `target` in the current process.
///
/// With `backup`, the target is first copied to `<target>.bak`. The staged
/// file is then renamed over the target, falling back to a copy when rename
/// is not possible. If installation fails the backup is copied back.
///
/// # Errors
///
/// Returns [`UpgradeError::ReplaceFailed`].
pub async fn direct_replace(staged: &Path, target: &Path, backup: bool) -> Result<()> {
    ensure_staged(staged, target).await?;

    let manager = if backup && fs::try_exists(target).await.unwrap_or(false) {
        let manager = BackupManager::new(target.to_path_buf());
        manager.create_backup().await.map_err(|e| replace_failed(target, format!("{e:#}"), false))?;
        Some(manager)
    } else {
        if backup {
            debug!(target = %target.display(), "Nothing to back up, target does not exist yet");
        }
        None
    };

    let Err(e) = install(staged, target).await else {
        info!(target = %target.display(), "Binary replaced");
        return Ok(());
    };

    let rolled_back = match &manager {
        Some(manager) => match manager.restore_backup().await {
            Ok(()) => true,
            Err(restore) => {
                warn!(error = %restore, "Rollback from backup failed");
                false
            }
        },
        None => false,
    };

    Err(replace_failed(target, e.to_string(), rolled_back).into())
}

async fn install(staged: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(staged, target).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(error = %rename_err, "Rename failed, falling back to copy");
            fs::copy(staged, target).await?;
            if let Err(e) = fs::remove_file(staged).await {
                debug!(error = %e, path = %staged.display(), "Could not remove staged file after copy");
            }
            Ok(())
        }
    }
}

async fn unix_replace(staged: &Path, target: &Path, backup: bool) -> Result<()> {
    let bak = backup_path(target);
    let backed_up = backup && fs::try_exists(target).await.unwrap_or(false);
    if backed_up {
        fs::rename(target, &bak).await.map_err(|e| {
            replace_failed(target, format!("backup rename to {} failed: {e}", bak.display()), false)
        })?;
        debug!(backup = %bak.display(), "Moved current binary to backup");
    }

    match fs::rename(staged, target).await {
        Ok(()) => {
            info!(target = %target.display(), "Binary replaced");
            Ok(())
        }
        Err(e) => {
            let rolled_back = backed_up && restore_rename(&bak, target).await;
            Err(replace_failed(target, e.to_string(), rolled_back).into())
        }
    }
}

async fn windows_replace(
    staged: &Path,
    target: &Path,
    backup: bool,
    policy: RetryPolicy,
) -> Result<()> {
    let bak = backup_path(target);
    let old = displaced_path(target);
    let moved = MovedAside::default();
    let attempts = AtomicU32::new(0);

    let (bak_ref, old_ref, moved_ref) = (bak.as_path(), old.as_path(), &moved);
    let result = Retry::spawn(policy.delays(), || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            windows_attempt(staged, target, backup, moved_ref, bak_ref, old_ref)
                .await
                .inspect_err(|e| debug!(attempt, error = %e, "Replace attempt failed"))
        }
    })
    .await;
    let attempts = attempts.load(Ordering::Relaxed);

    match result {
        Ok(()) => {
            match fs::remove_file(&old).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    debug!(path = %old.display(), error = %e, "Displaced binary still in use, leaving it");
                }
            }
            info!(target = %target.display(), attempts, "Binary replaced");
            Ok(())
        }
        Err(e) => {
            let rolled_back = restore_original(target, &moved, &bak, &old).await;
            Err(replace_failed(target, format!("gave up after {attempts} attempts: {e}"), rolled_back)
                .into())
        }
    }
}

/// Where the Windows worker moved the original binary, if anywhere.
#[derive(Debug, Default)]
struct MovedAside {
    to_backup: AtomicBool,
    to_displaced: AtomicBool,
}

async fn windows_attempt(
    staged: &Path,
    target: &Path,
    backup: bool,
    moved: &MovedAside,
    bak: &Path,
    old: &Path,
) -> io::Result<()> {
    if fs::try_exists(target).await.unwrap_or(false) {
        if backup && !moved.to_backup.load(Ordering::Relaxed) {
            fs::rename(target, bak).await?;
            moved.to_backup.store(true, Ordering::Relaxed);
            debug!(backup = %bak.display(), "Moved current binary to backup");
        } else {
            fs::rename(target, old).await?;
            moved.to_displaced.store(true, Ordering::Relaxed);
        }
    }
    fs::rename(staged, target).await
}

/// Move the original binary back once every attempt has failed.
///
/// Returns whether the original is at `target` again. Nothing is moved when
/// the target is occupied or no attempt got as far as moving it aside.
async fn restore_original(target: &Path, moved: &MovedAside, bak: &Path, old: &Path) -> bool {
    if fs::try_exists(target).await.unwrap_or(true) {
        return false;
    }
    if moved.to_backup.load(Ordering::Relaxed) {
        restore_rename(bak, target).await
    } else if moved.to_displaced.load(Ordering::Relaxed) {
        restore_rename(old, target).await
    } else {
        false
    }
}

async fn restore_rename(from: &Path, target: &Path) -> bool {
    match fs::rename(from, target).await {
        Ok(()) => {
            warn!(target = %target.display(), from = %from.display(), "Original binary restored");
            true
        }
        Err(e) => {
            warn!(target = %target.display(), error = %e, "Failed to restore original binary");
            false
        }
    }
}

async fn ensure_staged(staged: &Path, target: &Path) -> Result<()> {
    if fs::try_exists(staged).await.unwrap_or(false) {
        Ok(())
    } else {
        Err(replace_failed(target, format!("staged binary missing: {}", staged.display()), false)
            .into())
    }
}

fn replace_failed(target: &Path, reason: String, rolled_back: bool) -> UpgradeError {
    UpgradeError::ReplaceFailed {
        target: target.display().to_string(),
        reason,
        rolled_back,
    }
}
