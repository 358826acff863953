//! Detached worker process launch.
//!
//! On Windows the requesting process cannot replace its own image, so it hands
//! the plan to a fresh copy of itself (`<exe> upgrade-worker --plan <path>`)
//! and returns. The child must outlive the parent and any console it had, so
//! it gets null stdio, its own process group and no console.

use crate::core::UpgradeError;
use anyhow::Result;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::info;

/// Starts a worker process that outlives the caller.
pub trait WorkerLauncher: Send + Sync {
    /// Spawn `executable` with `args`, detached. Returns the child pid.
    ///
    /// Failures are reported as [`UpgradeError::ScheduleFailed`].
    fn spawn_detached(&self, executable: &Path, args: &[String]) -> Result<u32>;
}

/// [`WorkerLauncher`] that spawns a real OS process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn spawn_detached(&self, executable: &Path, args: &[String]) -> Result<u32> {
        let mut command = Command::new(executable);
        command.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        detach(&mut command);

        // The child handle is dropped without waiting; the worker reports
        // through the status file.
        let child = command.spawn().map_err(|e| UpgradeError::ScheduleFailed {
            reason: format!("failed to spawn {}: {e}", executable.display()),
        })?;
        let pid = child.id();

        info!(pid, executable = %executable.display(), args = %args.join(" "), "Spawned detached worker");
        Ok(pid)
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}
