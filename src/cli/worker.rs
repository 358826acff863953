//! `binswap upgrade-worker`: finish a dispatched upgrade.
//!
//! Started by the `{service}-upgrader` unit on Linux or as a detached process
//! on Windows, never by hand. The outcome goes to the status file next to the
//! plan, and a failure also sets a non-zero exit code.

use crate::config::Config;
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

/// Hidden command run by the upgrade worker.
#[derive(Args, Debug)]
pub struct WorkerCommand {
    /// Plan file written by `binswap upgrade`
    #[arg(long, value_name = "PATH")]
    plan: PathBuf,
}

impl WorkerCommand {
    /// Execute the plan, if it still exists.
    pub async fn execute(self, config: &Config) -> Result<()> {
        super::build_upgrader(config).run_worker(&self.plan).await
    }
}
