//! binswap CLI entry point
//!
//! Parses arguments, runs the command and renders failures with the
//! user-facing error formatter.
//!
//! - `upgrade` - download, verify and install a release
//! - `upgrade-status` - show the outcome of the last dispatched upgrade

use anyhow::Result;
use binswap_cli::cli;
use binswap_cli::core::error::user_friendly_error;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
