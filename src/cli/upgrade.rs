//! `binswap upgrade`: download, verify and install a release.
//!
//! ```bash
//! # Latest release, keeping the current binary as <target>.bak
//! binswap upgrade --backup
//!
//! # Pinned version through a mirror and a proxy
//! binswap upgrade 1.4.0 --use-mirror --mirror https://mirror.example --proxy http://proxy:3128
//!
//! # Replace the binary of a systemd service and restart it
//! binswap upgrade --target /usr/local/bin/edge-agent --service edge-agent --restart-service
//! ```
//!
//! When the replacement is handed to a worker the command returns right away;
//! follow up with `binswap upgrade-status`.

use crate::config::Config;
use crate::upgrade::{UpgradeOptions, UpgradeOutcome};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

/// Command to upgrade the target binary.
#[derive(Args, Debug)]
pub struct UpgradeCommand {
    /// Release to install, e.g. `1.4.0` or `v1.4.0`
    #[arg(value_name = "VERSION", default_value = "latest")]
    version: String,

    /// Download from this exact URL instead of the release location
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Mirror prefix placed in front of the release URL
    #[arg(long, value_name = "URL")]
    mirror: Option<String>,

    /// Download through the mirror (from --mirror or the config file)
    #[arg(long)]
    use_mirror: bool,

    /// HTTP/HTTPS proxy for the download
    #[arg(long, value_name = "URL", env = "BINSWAP_HTTP_PROXY")]
    proxy: Option<String>,

    /// Executable to replace (defaults to this binary)
    #[arg(long, value_name = "PATH")]
    target: Option<PathBuf>,

    /// Keep the replaced binary as <target>.bak
    #[arg(long)]
    backup: bool,

    /// OS service that runs the target
    #[arg(long, value_name = "NAME")]
    service: Option<String>,

    /// Restart --service after replacing the binary
    #[arg(long, requires = "service")]
    restart_service: bool,

    /// Directory for the lock, plan and status files
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Extra argument for the service tool, e.g. --service-arg=--user (repeatable)
    #[arg(long = "service-arg", value_name = "ARG", allow_hyphen_values = true)]
    service_args: Vec<String>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,
}

impl UpgradeCommand {
    fn options(&self) -> UpgradeOptions {
        UpgradeOptions {
            version: self.version.clone(),
            download_url: self.url.clone(),
            mirror_url: self.mirror.clone(),
            use_mirror: self.use_mirror,
            http_proxy: self.proxy.clone(),
            target_path: self.target.clone(),
            backup: self.backup,
            service_name: self.service.clone(),
            restart_service: self.restart_service,
            work_dir: self.work_dir.clone(),
            service_args: self.service_args.clone(),
        }
    }

    /// Run the upgrade.
    pub async fn execute(self, config: &Config) -> Result<()> {
        let upgrader = super::build_upgrader(config);
        let options = self.options();

        if !self.json {
            println!("{} {}", "Upgrading to".cyan(), options.version.bold());
        }

        let outcome = upgrader.start_upgrade(&options).await?;

        if self.json {
            let json = serde_json::to_string_pretty(&outcome)
                .context("Failed to serialize upgrade outcome")?;
            println!("{json}");
        } else {
            print_outcome(&outcome, &upgrader.work_dir(&options));
        }
        Ok(())
    }
}

fn print_outcome(outcome: &UpgradeOutcome, work_dir: &std::path::Path) {
    if !outcome.dispatched {
        println!("{}", "Upgrade completed successfully".green());
        return;
    }

    println!("{}", "Upgrade dispatched".green());
    if let Some(service) = &outcome.service_name {
        println!("  service: {service}");
    }
    if let Some(plan) = &outcome.plan_path {
        println!("  plan:    {}", plan.display());
    }
    println!(
        "Run `binswap upgrade-status --work-dir {}` to see the result",
        work_dir.display()
    );
}
