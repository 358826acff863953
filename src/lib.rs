//! binswap - self-upgrade engine for long-running service binaries
//!
//! Replaces the running executable, or any target executable, with a freshly
//! downloaded release and optionally restarts the OS service that runs it.
//! Built for daemons that must upgrade themselves without an external
//! package manager.
//!
//! # Architecture Overview
//!
//! An upgrade attempt downloads a release asset named after the host
//! (`{prefix}-{os}-{arch}`), stages it next to the target as `<target>.new`,
//! and checks that the staged file is an executable for this OS and CPU
//! before anything is touched. What happens next depends on the platform:
//!
//! - **Linux, service restart requested**: a durable plan is written and a
//!   transient `{service}-upgrader` oneshot unit performs the swap, so the
//!   replacement survives the service stopping the requesting process.
//! - **Windows**: a running executable cannot be overwritten, so a detached
//!   worker process retries the swap until the old process lets go.
//! - **Everything else**: the binary is renamed into place directly.
//!
//! A lock in the working directory keeps attempts exclusive, and workers
//! record their outcome in a status file that can be read back later.
//!
//! # Core Modules
//!
//! - [`upgrade`] - the engine: options, lock, plan/status store, fetch and
//!   stage, verification, replacement, service control, orchestration
//! - [`cli`] - `binswap upgrade`, `upgrade-status` and the hidden worker
//! - [`config`] - optional host-wide TOML configuration
//! - [`core`] - error types and user-facing error rendering
//! - [`utils`] - platform probing and filesystem helpers
//! - [`constants`] - file names, timeouts and other fixed values
//!
//! # Example
//!
//! ```rust,no_run
//! use binswap_cli::upgrade::{UpgradeOptions, Upgrader};
//! use binswap_cli::utils::platform::Platform;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let outcome = Upgrader::new(Platform::detect())
//!     .start_upgrade(&UpgradeOptions {
//!         version: "1.4.0".to_string(),
//!         backup: true,
//!         ..UpgradeOptions::default()
//!     })
//!     .await?;
//! println!("dispatched: {}", outcome.dispatched);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod upgrade;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
