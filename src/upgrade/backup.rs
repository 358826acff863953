//! Copy-based backup of the live executable for the in-process replacement path.
//!
//! The backup lives at `<target>.bak` and overwrites any earlier backup. It is
//! kept after a successful upgrade so an operator can roll back by hand.

use crate::upgrade::paths::backup_path;
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, info, warn};

const RESTORE_ATTEMPTS: usize = 3;
const RESTORE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Creates and restores the `.bak` copy of a target executable.
///
/// # Examples
///
/// ```rust,no_run
/// use binswap_cli::upgrade::backup::BackupManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let backup = BackupManager::new(PathBuf::from("/usr/local/bin/edge-agent"));
/// backup.create_backup().await?;
/// // ... replace the binary ...
/// # let failed = false;
/// if failed {
///     backup.restore_backup().await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BackupManager {
    target: PathBuf,
    backup: PathBuf,
}

impl BackupManager {
    /// Manage the backup of `target`, stored at `<target>.bak`.
    #[must_use]
    pub fn new(target: PathBuf) -> Self {
        let backup = backup_path(&target);
        Self {
            target,
            backup,
        }
    }

    /// Copy the target to `<target>.bak`, preserving its permissions.
    ///
    /// # Errors
    ///
    /// Fails if the target does not exist or the copy cannot be written.
    pub async fn create_backup(&self) -> Result<()> {
        if !fs::try_exists(&self.target).await.unwrap_or(false) {
            bail!("Cannot back up missing executable: {}", self.target.display());
        }

        if fs::try_exists(&self.backup).await.unwrap_or(false) {
            debug!(path = %self.backup.display(), "Overwriting previous backup");
            fs::remove_file(&self.backup).await.with_context(|| {
                format!("Failed to remove previous backup: {}", self.backup.display())
            })?;
        }

        fs::copy(&self.target, &self.backup)
            .await
            .with_context(|| format!("Failed to create backup: {}", self.backup.display()))?;

        #[cfg(unix)]
        {
            let permissions = fs::metadata(&self.target)
                .await
                .context("Failed to read target metadata")?
                .permissions();
            fs::set_permissions(&self.backup, permissions)
                .await
                .context("Failed to set backup permissions")?;
        }

        info!(backup = %self.backup.display(), "Backup created");
        Ok(())
    }

    /// Copy `<target>.bak` back over the target.
    ///
    /// Retried a few times since the target may still be briefly held open
    /// by the process that just failed to replace it.
    pub async fn restore_backup(&self) -> Result<()> {
        if !self.backup_exists() {
            bail!("No backup found at {}", self.backup.display());
        }

        warn!(backup = %self.backup.display(), target = %self.target.display(), "Restoring from backup");

        let strategy = FixedInterval::new(RESTORE_RETRY_DELAY).take(RESTORE_ATTEMPTS - 1);
        Retry::spawn(strategy, || async move {
            self.attempt_restore().await.inspect_err(|e| warn!(error = %e, "Restore attempt failed"))
        })
        .await
        .with_context(|| format!("Failed to restore backup after {RESTORE_ATTEMPTS} attempts"))?;

        info!(target = %self.target.display(), "Restored from backup");
        Ok(())
    }

    async fn attempt_restore(&self) -> Result<()> {
        match fs::remove_file(&self.target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to remove replaced binary: {}", self.target.display())
                });
            }
        }

        fs::copy(&self.backup, &self.target).await.context("Failed to copy backup into place")?;

        #[cfg(unix)]
        {
            let permissions =
                fs::metadata(&self.backup).await.context("Failed to read backup metadata")?.permissions();
            fs::set_permissions(&self.target, permissions)
                .await
                .context("Failed to restore permissions")?;
        }

        Ok(())
    }

    /// Whether a backup file is present.
    #[must_use]
    pub fn backup_exists(&self) -> bool {
        self.backup.exists()
    }

    /// Location of the backup file.
    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_backup_overwrites_previous_and_restores() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("svc");
        std::fs::write(&target, b"v1").unwrap();
        std::fs::write(temp.path().join("svc.bak"), b"v0").unwrap();

        let manager = BackupManager::new(target.clone());
        assert_eq!(manager.backup_path(), temp.path().join("svc.bak"));
        manager.create_backup().await.unwrap();
        assert_eq!(std::fs::read(manager.backup_path()).unwrap(), b"v1");

        std::fs::write(&target, b"broken").unwrap();
        manager.restore_backup().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");
        assert!(manager.backup_exists());
    }

    #[tokio::test]
    async fn test_backup_of_missing_target_fails() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("absent"));
        assert!(manager.create_backup().await.is_err());
        assert!(manager.restore_backup().await.is_err());
    }

    #[tokio::test]
    async fn test_restore_gives_up_after_retries() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("svc");
        std::fs::write(&target, b"v1").unwrap();
        let manager = BackupManager::new(target.clone());
        manager.create_backup().await.unwrap();

        // A non-empty directory at the target cannot be removed as a file.
        std::fs::remove_file(&target).unwrap();
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let started = std::time::Instant::now();
        let err = manager.restore_backup().await.unwrap_err();
        assert!(started.elapsed() >= RESTORE_RETRY_DELAY * 2);
        assert!(format!("{err:#}").contains("after 3 attempts"), "{err:#}");
        assert!(target.join("keep").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backup_preserves_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("svc");
        std::fs::write(&target, b"v1").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o750)).unwrap();

        let manager = BackupManager::new(target);
        manager.create_backup().await.unwrap();
        let mode = std::fs::metadata(manager.backup_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
