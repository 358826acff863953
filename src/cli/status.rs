//! `binswap upgrade-status`: show the outcome of the last dispatched upgrade.
//!
//! Only upgrades finished by a worker leave a status record; an upgrade
//! completed directly by `binswap upgrade` reports its result immediately.

use crate::config::Config;
use crate::upgrade::Status;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

/// Command to read the recorded upgrade status.
#[derive(Args, Debug)]
pub struct StatusCommand {
    /// Directory holding the status file
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Print the status as JSON
    #[arg(long)]
    json: bool,
}

impl StatusCommand {
    /// Print the recorded status.
    pub fn execute(self, config: &Config) -> Result<()> {
        let upgrader = super::build_upgrader(config);
        let status = upgrader.read_upgrade_status(self.work_dir.as_deref())?;

        if self.json {
            let json =
                serde_json::to_string_pretty(&status).context("Failed to serialize upgrade status")?;
            println!("{json}");
        } else {
            print_status(&status);
        }
        Ok(())
    }
}

fn print_status(status: &Status) {
    let outcome = if status.success {
        "succeeded".green()
    } else {
        "failed".red()
    };
    println!("Last upgrade {outcome} at {}", status.updated_at.to_rfc3339());
    if !status.message.is_empty() {
        println!("  {}", status.message);
    }
}
