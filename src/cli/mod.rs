//! Command-line interface for binswap.
//!
//! # Commands
//!
//! - `upgrade [VERSION]` - download, verify and install a release
//! - `upgrade-status` - show the outcome of the last dispatched upgrade
//! - `upgrade-worker --plan <PATH>` - hidden; finishes a dispatched upgrade
//!
//! # Global Options
//!
//! - `--verbose` / `-v`: debug logging
//! - `--quiet` / `-q`: warnings and errors only
//! - `--config` / `-c`: configuration file (see [`crate::config`])
//!
//! `RUST_LOG`, when set, overrides both verbosity flags. Logs go to stderr so
//! that a service manager journal captures worker output and `--json` output
//! on stdout stays machine-readable.
//!
//! # Examples
//!
//! ```bash
//! binswap upgrade v1.4.0 --backup
//! binswap upgrade --service edge-agent --restart-service --json
//! binswap upgrade-status --json
//! ```

mod status;
mod upgrade;
mod worker;

use crate::config::Config;
use crate::upgrade::Upgrader;
use crate::utils::platform::Platform;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Runtime settings derived from the global flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliConfig {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Explicit configuration file
    pub config_path: Option<PathBuf>,
}

impl CliConfig {
    /// Install the global tracing subscriber, writing to stderr.
    ///
    /// Safe to call more than once; later calls are ignored.
    pub fn init_logging(&self) {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(&self.log_level)
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

/// Self-upgrade tool for long-running service binaries.
#[derive(Parser, Debug)]
#[command(
    name = "binswap",
    about = "Safely replace a running service binary with a new release",
    version,
    long_about = "binswap downloads a release, verifies it is an executable for this host, \
                  and swaps it in place of the running binary, restarting the owning OS \
                  service when asked. At most one upgrade runs per installation."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download, verify and install a release
    Upgrade(upgrade::UpgradeCommand),

    /// Show the outcome of the last dispatched upgrade
    UpgradeStatus(status::StatusCommand),

    /// Finish a dispatched upgrade from its plan file
    #[command(hide = true)]
    UpgradeWorker(worker::WorkerCommand),
}

impl Cli {
    /// Run the parsed command.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        config.init_logging();
        self.execute_with_config(config).await
    }

    /// Derive runtime settings from the global flags.
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };

        CliConfig {
            log_level: log_level.to_string(),
            config_path: self.config.clone(),
        }
    }

    /// Run the parsed command with explicit settings.
    pub async fn execute_with_config(self, cli_config: CliConfig) -> Result<()> {
        let config = Config::load_with_optional(cli_config.config_path).await?;

        match self.command {
            Commands::Upgrade(cmd) => cmd.execute(&config).await,
            Commands::UpgradeStatus(cmd) => cmd.execute(&config),
            Commands::UpgradeWorker(cmd) => cmd.execute(&config).await,
        }
    }
}

/// Upgrader for this host, with settings from `config`.
fn build_upgrader(config: &Config) -> Upgrader {
    Upgrader::new(Platform::detect()).with_settings(config.upgrade_settings())
}
