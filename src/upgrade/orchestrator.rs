//! Upgrade entry points and branch selection.
//!
//! [`Upgrader::start_upgrade`] runs the synchronous part of an attempt under
//! the instance lock: resolve, fetch, stage and verify. It then takes one of
//! three branches, in this order of precedence:
//!
//! 1. **Linux with a service restart**: write a plan, install the oneshot
//!    `{service}-upgrader` unit and start it without waiting. Restarting the
//!    service in-process could kill the requester along with the service.
//! 2. **Windows**: write a plan and spawn a detached worker, since a running
//!    image cannot be overwritten.
//! 3. **Everything else**: replace in-process, then restart the service if
//!    asked to.
//!
//! Dispatched attempts finish in [`Upgrader::run_worker`], which reports its
//! outcome only through the status file.

use crate::constants::{UPGRADER_SERVICE_SUFFIX, UPGRADER_UNIT_TEMPLATE, WORKER_COMMAND};
use crate::core::UpgradeError;
use crate::upgrade::fetch::{Fetcher, HttpFetcher, ReleaseSource, build_download_url, stage};
use crate::upgrade::launcher::{ProcessLauncher, WorkerLauncher};
use crate::upgrade::lock::UpgradeLock;
use crate::upgrade::options::UpgradeOptions;
use crate::upgrade::paths::{resolve_target_path, stage_path};
use crate::upgrade::plan::{Status, read_plan, read_status, remove_plan, write_plan, write_status};
use crate::upgrade::replace::{ReplaceStrategy, RetryPolicy, UpgradeStage, direct_replace};
use crate::upgrade::service::{
    ServiceAction, ServiceManager, ServiceOptions, ServiceRequest, SystemServiceManager,
};
use crate::upgrade::verify::verify;
use crate::utils::platform::{Os, Platform};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

/// Result of [`Upgrader::start_upgrade`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeOutcome {
    /// Whether the replacement was handed to a worker
    pub dispatched: bool,
    /// Plan file the worker consumes, when dispatched
    pub plan_path: Option<PathBuf>,
    /// Upgrader service name on Linux, otherwise the controlled service
    pub service_name: Option<String>,
}

/// Defaults that do not vary per attempt, usually read from the config file.
#[derive(Debug, Clone, Default)]
pub struct UpgradeSettings {
    /// Release location and asset naming
    pub release: ReleaseSource,
    /// Windows worker retry loop bounds
    pub retry: RetryPolicy,
    /// Working directory used when the options name none
    pub work_dir: Option<PathBuf>,
    /// Program the worker is launched from; the running executable if unset
    pub worker_executable: Option<PathBuf>,
}

/// Runs upgrade attempts for one platform with injected collaborators.
///
/// # Examples
///
/// ```rust,no_run
/// use binswap_cli::upgrade::{UpgradeOptions, Upgrader};
/// use binswap_cli::utils::platform::Platform;
///
/// # async fn example() -> anyhow::Result<()> {
/// let upgrader = Upgrader::new(Platform::detect());
/// let outcome = upgrader
///     .start_upgrade(&UpgradeOptions {
///         version: "v1.4.0".to_string(),
///         backup: true,
///         ..UpgradeOptions::default()
///     })
///     .await?;
/// if outcome.dispatched {
///     println!("worker will finish the upgrade");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Upgrader {
    platform: Platform,
    fetcher: Arc<dyn Fetcher>,
    services: Arc<dyn ServiceManager>,
    launcher: Arc<dyn WorkerLauncher>,
    settings: UpgradeSettings,
}

impl Upgrader {
    /// Upgrader with the default HTTP fetcher, system service manager and process launcher.
    #[must_use]
    pub fn new(platform: Platform) -> Self {
        let services = Arc::new(SystemServiceManager::new(platform.os.clone()));
        Self {
            platform,
            fetcher: Arc::new(HttpFetcher::new()),
            services,
            launcher: Arc::new(ProcessLauncher),
            settings: UpgradeSettings::default(),
        }
    }

    /// Replace the fetcher.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Replace the service manager.
    #[must_use]
    pub fn with_service_manager(mut self, services: Arc<dyn ServiceManager>) -> Self {
        self.services = services;
        self
    }

    /// Replace the worker launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: UpgradeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Platform this upgrader acts for.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Working directory for `options`: options, then settings, then the platform default.
    #[must_use]
    pub fn work_dir(&self, options: &UpgradeOptions) -> PathBuf {
        options
            .work_dir
            .clone()
            .or_else(|| self.settings.work_dir.clone())
            .unwrap_or_else(|| self.platform.default_work_dir())
    }

    /// Start an upgrade attempt.
    ///
    /// Returns once the binary has been replaced, or once the replacement has
    /// been handed to a worker (`dispatched: true`). The instance lock is
    /// released before returning on every path.
    ///
    /// # Errors
    ///
    /// Any [`UpgradeError`] from the synchronous path. Nothing is dispatched
    /// when an error is returned.
    pub async fn start_upgrade(&self, options: &UpgradeOptions) -> Result<UpgradeOutcome> {
        let target = resolve_target_path(options.target_path.as_deref())?;
        let work_dir = self.work_dir(options);
        let url = self.download_url(options)?;

        let lock = UpgradeLock::acquire(&work_dir).await?;
        debug!(stage = %UpgradeStage::Locked, work_dir = %work_dir.display(), "Upgrade started");

        let fetched = self.fetch(&url, options.http_proxy.as_deref()).await?;
        debug!(stage = %UpgradeStage::Fetched, path = %fetched.display());

        let staged = stage(&fetched, &target).await?;
        debug!(stage = %UpgradeStage::Staged, path = %staged.display());
        // The download is no longer needed once the staged copy exists.
        drop(fetched);

        if let Err(e) = self.verify_staged(&staged).await {
            // An untrusted artifact is never left where a later worker could pick it up.
            if let Err(remove) = tokio::fs::remove_file(&staged).await {
                debug!(error = %remove, "Failed to remove rejected staged binary");
            }
            return Err(e);
        }
        debug!(stage = %UpgradeStage::Verified, path = %staged.display());

        let resolved = UpgradeOptions {
            target_path: Some(target.clone()),
            work_dir: Some(work_dir.clone()),
            ..options.clone()
        };

        let outcome = if self.platform.os == Os::Linux && resolved.wants_service_restart() {
            self.dispatch_to_upgrader_service(&resolved, &work_dir).await?
        } else if self.platform.os == Os::Windows {
            self.dispatch_to_worker_process(&resolved, &work_dir)?
        } else {
            self.replace_in_process(&resolved, &staged, &target).await?
        };

        lock.release();
        info!(
            stage = %UpgradeStage::Done,
            dispatched = outcome.dispatched,
            target = %target.display(),
            "Upgrade attempt finished"
        );
        Ok(outcome)
    }

    /// Finish a dispatched upgrade from its plan file.
    ///
    /// A missing plan means there is nothing to do. Otherwise the outcome is
    /// written to `status.json` next to the plan; the plan is deleted only on
    /// success.
    ///
    /// # Errors
    ///
    /// The failure that was recorded in the status file.
    pub async fn run_worker(&self, plan_path: &Path) -> Result<()> {
        let exists = tokio::fs::try_exists(plan_path)
            .await
            .with_context(|| format!("Failed to check upgrade plan: {}", plan_path.display()))?;
        if !exists {
            info!(plan = %plan_path.display(), "No pending upgrade plan");
            return Ok(());
        }

        let work_dir = plan_path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        match self.execute_plan(plan_path).await {
            Ok(message) => {
                write_status(&work_dir, true, &message)?;
                info!(plan = %plan_path.display(), "{message}");
                Ok(())
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(plan = %plan_path.display(), error = %message, "Upgrade worker failed");
                if let Err(status_err) = write_status(&work_dir, false, &message) {
                    error!(error = %status_err, "Failed to record upgrade failure");
                }
                Err(e)
            }
        }
    }

    /// Read the last recorded worker outcome.
    pub fn read_upgrade_status(&self, work_dir: Option<&Path>) -> Result<Status> {
        let work_dir = work_dir
            .map(Path::to_path_buf)
            .or_else(|| self.settings.work_dir.clone())
            .unwrap_or_else(|| self.platform.default_work_dir());
        read_upgrade_status(&work_dir)
    }

    fn download_url(&self, options: &UpgradeOptions) -> Result<String> {
        // An explicit URL bypasses asset resolution, so it works on any platform.
        if options.download_url.as_deref().is_some_and(|u| !u.trim().is_empty()) {
            return Ok(build_download_url(options, &self.settings.release, ""));
        }
        let asset = self.platform.asset_name(&self.settings.release.asset_prefix)?;
        Ok(build_download_url(options, &self.settings.release, &asset))
    }

    async fn fetch(&self, url: &str, http_proxy: Option<&str>) -> Result<TempPath> {
        info!(url, "Fetching new binary");
        self.fetcher.fetch(url, http_proxy).await.map_err(|e| {
            if e.downcast_ref::<UpgradeError>().is_some() {
                e
            } else {
                UpgradeError::DownloadFailed {
                    url: url.to_string(),
                    reason: format!("{e:#}"),
                }
                .into()
            }
        })
    }

    async fn verify_staged(&self, staged: &Path) -> Result<()> {
        let path = staged.to_path_buf();
        let platform = self.platform.clone();
        tokio::task::spawn_blocking(move || verify(&path, &platform))
            .await
            .context("spawn_blocking panicked")?
            .map_err(|source| {
                UpgradeError::VerificationFailed {
                    path: staged.display().to_string(),
                    source,
                }
                .into()
            })
    }

    async fn dispatch_to_upgrader_service(
        &self,
        options: &UpgradeOptions,
        work_dir: &Path,
    ) -> Result<UpgradeOutcome> {
        let service = options.restart_target().unwrap_or_default();
        let upgrader = format!("{service}{UPGRADER_SERVICE_SUFFIX}");
        let executable = self.worker_executable()?;
        let plan_path = write_plan(work_dir, options)?;

        let unit = ServiceOptions {
            description: format!("Upgrade {service}"),
            executable,
            arguments: worker_args(&plan_path),
            working_directory: work_dir.to_path_buf(),
            unit_template: Some(
                UPGRADER_UNIT_TEMPLATE.replace("{{plan_path}}", &plan_path.display().to_string()),
            ),
        };

        let uninstall = ServiceRequest::new(&upgrader, ServiceAction::Uninstall, &options.service_args);
        if let Err(e) = self.services.control(&uninstall).await {
            debug!(service = %upgrader, error = %e, "No previous upgrader service removed");
        }

        let install = ServiceRequest::install(&upgrader, unit, &options.service_args);
        if let Err(e) = self.services.control(&install).await {
            discard_plan(&plan_path);
            return Err(schedule_failed("install", &upgrader, &e));
        }

        // The upgrader unit stops the service that may host this process.
        let start = ServiceRequest::new(&upgrader, ServiceAction::Start, &options.service_args)
            .without_blocking();
        if let Err(e) = self.services.control(&start).await {
            discard_plan(&plan_path);
            return Err(schedule_failed("start", &upgrader, &e));
        }

        info!(
            stage = %UpgradeStage::DispatchedToWorker,
            service = %upgrader,
            plan = %plan_path.display(),
            "Upgrade dispatched to upgrader service"
        );
        Ok(UpgradeOutcome {
            dispatched: true,
            plan_path: Some(plan_path),
            service_name: Some(upgrader),
        })
    }

    fn dispatch_to_worker_process(
        &self,
        options: &UpgradeOptions,
        work_dir: &Path,
    ) -> Result<UpgradeOutcome> {
        let executable = self.worker_executable()?;
        let plan_path = write_plan(work_dir, options)?;

        let pid = match self.launcher.spawn_detached(&executable, &worker_args(&plan_path)) {
            Ok(pid) => pid,
            Err(e) => {
                discard_plan(&plan_path);
                return Err(schedule_failed("spawn", "worker", &e));
            }
        };

        info!(
            stage = %UpgradeStage::DispatchedToWorker,
            pid,
            plan = %plan_path.display(),
            "Upgrade dispatched to worker process"
        );
        Ok(UpgradeOutcome {
            dispatched: true,
            plan_path: Some(plan_path),
            service_name: options.service_name.clone(),
        })
    }

    async fn replace_in_process(
        &self,
        options: &UpgradeOptions,
        staged: &Path,
        target: &Path,
    ) -> Result<UpgradeOutcome> {
        debug!(stage = %UpgradeStage::DirectReplace, target = %target.display());
        direct_replace(staged, target, options.backup).await?;

        if let Some(service) = options.restart_target() {
            self.control_service_or_warn(service, ServiceAction::Stop, &options.service_args).await;
            self.control_service_or_warn(service, ServiceAction::Start, &options.service_args).await;
        }

        Ok(UpgradeOutcome {
            dispatched: false,
            plan_path: None,
            service_name: options.service_name.clone(),
        })
    }

    async fn execute_plan(&self, plan_path: &Path) -> Result<String> {
        let plan = read_plan(plan_path)?;
        let options = plan.options;
        info!(
            plan = %plan_path.display(),
            requested_by = plan.requesting_pid,
            version = %options.version,
            "Executing upgrade plan"
        );

        let target = resolve_target_path(options.target_path.as_deref())?;
        let staged = stage_path(&target);
        self.verify_staged(&staged).await?;

        let service = options.restart_target();
        if let Some(service) = service {
            self.control_service_or_warn(service, ServiceAction::Stop, &options.service_args).await;
        }

        let strategy = ReplaceStrategy::for_platform(&self.platform, self.settings.retry);
        if let Err(e) = strategy.replace(&staged, &target, options.backup).await {
            if let Some(service) = service {
                // Bring the service back on whatever binary is in place.
                self.control_service_or_warn(service, ServiceAction::Start, &options.service_args)
                    .await;
            }
            return Err(e);
        }

        let mut message = format!("Upgraded {} to {}", target.display(), options.version);
        if let Some(service) = service {
            let start = ServiceRequest::new(service, ServiceAction::Start, &options.service_args);
            if let Err(e) = self.services.control(&start).await {
                warn!(service, error = %e, "Binary replaced but service failed to start");
                message.push_str(&format!("; warning: failed to start service {service}: {e:#}"));
            }
        }

        remove_plan(plan_path)?;
        Ok(message)
    }

    async fn control_service_or_warn(&self, service: &str, action: ServiceAction, args: &[String]) {
        let request = ServiceRequest::new(service, action, args);
        match self.services.control(&request).await {
            Ok(()) => debug!(service, action = %action, "Service control succeeded"),
            Err(e) => warn!(service, action = %action, error = %e, "Service control failed"),
        }
    }

    fn worker_executable(&self) -> Result<PathBuf> {
        match &self.settings.worker_executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().context("Failed to get current executable path"),
        }
    }
}

/// Read the last recorded worker outcome from `work_dir`.
///
/// # Errors
///
/// [`UpgradeError::StatusNotFound`] if no worker has finished yet.
pub fn read_upgrade_status(work_dir: &Path) -> Result<Status> {
    read_status(work_dir)
}

fn worker_args(plan_path: &Path) -> Vec<String> {
    vec![WORKER_COMMAND.to_string(), "--plan".to_string(), plan_path.display().to_string()]
}

/// Remove a plan no worker will ever run.
fn discard_plan(plan_path: &Path) {
    if let Err(e) = remove_plan(plan_path) {
        warn!(plan = %plan_path.display(), error = %e, "Failed to remove undispatched plan");
    }
}

fn schedule_failed(step: &str, what: &str, e: &anyhow::Error) -> anyhow::Error {
    UpgradeError::ScheduleFailed {
        reason: format!("{step} {what}: {e:#}"),
    }
    .into()
}
