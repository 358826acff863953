//! Configuration management for binswap.
//!
//! A single optional TOML file carries host-wide defaults; see [`global`] for
//! the format and lookup order. Everything in it can be left out.
//!
//! ```rust,no_run
//! use binswap_cli::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load().await?;
//! println!("assets are named {}-<os>-<arch>", config.release.asset_prefix);
//! # Ok(())
//! # }
//! ```

pub mod global;

pub use global::{Config, UpgradeSection};
