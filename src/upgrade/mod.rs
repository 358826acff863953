//! Self-upgrade engine.
//!
//! Replaces the running executable (or any target executable) with a freshly
//! downloaded release, optionally restarting the OS service that runs it, with
//! at most one upgrade in flight per installation and an observable outcome.
//!
//! # Architecture Overview
//!
//! ## Core Components
//!
//! - **[`Upgrader`]**: entry points; picks the platform branch
//! - **[`lock::UpgradeLock`]**: non-blocking instance lock per working directory
//! - **[`plan`]**: durable plan/status records crossing process boundaries
//! - **[`fetch`]**: download URL resolution, [`Fetcher`] seam and staging
//! - **[`verify`]**: ELF/Mach-O/PE header and architecture check
//! - **[`replace`]**: direct and worker replacement, [`ReplaceStrategy`]
//! - **[`service`]** / **[`launcher`]**: service control and detached spawn
//!
//! ## Attempt Flow
//!
//! ```text
//! start_upgrade
//!    ├── resolve target, working dir, download URL
//!    ├── lock <work_dir>/upgrade.lock
//!    ├── fetch → stage to <target>.new → verify
//!    └── branch
//!        ├── Linux + service restart: plan.json → {service}-upgrader (oneshot)
//!        ├── Windows:                plan.json → detached `upgrade-worker`
//!        └── otherwise:              backup, rename, restart service
//!
//! run_worker (upgrader service or detached process)
//!    ├── no plan.json → nothing to do
//!    ├── verify staged → stop service → replace → start service
//!    └── status.json (success or failure), plan.json removed on success
//! ```
//!
//! # On-disk Layout
//!
//! ```text
//! <work_dir>/upgrade.lock    instance lock
//! <work_dir>/plan.json       pending dispatched upgrade
//! <work_dir>/status.json     outcome of the last worker run
//! <target>.new               staged binary
//! <target>.bak               previous binary, when a backup was requested
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use binswap_cli::upgrade::{UpgradeOptions, Upgrader, read_upgrade_status};
//! use binswap_cli::utils::platform::Platform;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let upgrader = Upgrader::new(Platform::detect());
//! let options = UpgradeOptions {
//!     service_name: Some("edge-agent".to_string()),
//!     restart_service: true,
//!     ..UpgradeOptions::default()
//! };
//! let outcome = upgrader.start_upgrade(&options).await?;
//! if outcome.dispatched {
//!     // Poll later; the worker records its result.
//!     let status = read_upgrade_status(&upgrader.work_dir(&options))?;
//!     println!("success: {}", status.success);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod fetch;
pub mod launcher;
pub mod lock;
pub mod options;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod replace;
pub mod service;
pub mod verify;

pub use fetch::{Fetcher, HttpFetcher, ReleaseSource};
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use options::UpgradeOptions;
pub use orchestrator::{UpgradeOutcome, UpgradeSettings, Upgrader, read_upgrade_status};
pub use plan::{Plan, Status};
pub use replace::{ReplaceStrategy, RetryPolicy, UpgradeStage};
pub use service::{ServiceAction, ServiceManager, ServiceOptions, ServiceRequest, SystemServiceManager};
