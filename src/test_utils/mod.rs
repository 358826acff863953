//! Test utilities for binswap
//!
//! Fakes for the collaborators the [`Upgrader`](crate::upgrade::Upgrader)
//! takes by injection, plus builders for minimal executable headers so the
//! verifier can be exercised for any platform on any host.
//!
//! # Example
//!
//! ```rust,no_run
//! use binswap_cli::test_utils::{FakeFetcher, RecordingServiceManager, binaries};
//! use binswap_cli::upgrade::Upgrader;
//! use binswap_cli::utils::platform::{Arch, Os, Platform};
//! use std::sync::Arc;
//!
//! let platform = Platform::new(Os::Linux, Arch::X86_64);
//! let services = Arc::new(RecordingServiceManager::default());
//! let upgrader = Upgrader::new(platform.clone())
//!     .with_fetcher(Arc::new(FakeFetcher::new(binaries::for_platform(&platform))))
//!     .with_service_manager(services.clone());
//! ```

pub mod binaries;

use crate::core::UpgradeError;
use crate::upgrade::fetch::Fetcher;
use crate::upgrade::launcher::WorkerLauncher;
use crate::upgrade::service::{ServiceAction, ServiceManager, ServiceRequest};
use anyhow::Result;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use tempfile::{TempDir, TempPath};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Uses `level` if given, otherwise `RUST_LOG`; with neither, tests run
/// without a subscriber.
///
/// ```bash
/// RUST_LOG=binswap_cli=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Fetcher`] that serves a fixed payload from its own temp directory.
#[derive(Debug)]
pub struct FakeFetcher {
    payload: Vec<u8>,
    dir: TempDir,
    requests: Mutex<Vec<(String, Option<String>)>>,
    fail: bool,
}

impl FakeFetcher {
    /// Serve `payload` for every URL.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            dir: tempfile::tempdir().unwrap_or_else(|e| panic!("failed to create fetcher dir: {e}")),
            requests: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// Fail every fetch with [`UpgradeError::DownloadFailed`].
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    /// URLs requested so far, in order.
    #[must_use]
    pub fn requested_urls(&self) -> Vec<String> {
        lock(&self.requests).iter().map(|(url, _)| url.clone()).collect()
    }

    /// Proxies passed with each request, in order.
    #[must_use]
    pub fn requested_proxies(&self) -> Vec<Option<String>> {
        lock(&self.requests).iter().map(|(_, proxy)| proxy.clone()).collect()
    }

    fn serve(&self, url: &str, http_proxy: Option<&str>) -> Result<TempPath> {
        let count = {
            let mut requests = lock(&self.requests);
            requests.push((url.to_string(), http_proxy.map(str::to_string)));
            requests.len()
        };

        if self.fail {
            return Err(UpgradeError::DownloadFailed {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".to_string(),
            }
            .into());
        }

        let path = self.dir.path().join(format!("download-{count}"));
        std::fs::write(&path, &self.payload)?;
        Ok(TempPath::from_path(path))
    }
}

impl Fetcher for FakeFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        http_proxy: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<TempPath>> + Send + 'a>> {
        Box::pin(async move { self.serve(url, http_proxy) })
    }
}

/// [`ServiceManager`] that records requests and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingServiceManager {
    requests: Mutex<Vec<ServiceRequest>>,
    failing: Mutex<Vec<ServiceAction>>,
}

impl RecordingServiceManager {
    /// Fail every future request with `action`.
    pub fn fail_on(&self, action: ServiceAction) {
        lock(&self.failing).push(action);
    }

    /// Recorded requests as `"<action> <name>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.requests).iter().map(|r| format!("{} {}", r.action, r.name)).collect()
    }

    /// Recorded requests.
    #[must_use]
    pub fn requests(&self) -> Vec<ServiceRequest> {
        lock(&self.requests).clone()
    }

    fn handle(&self, request: &ServiceRequest) -> Result<()> {
        lock(&self.requests).push(request.clone());
        if lock(&self.failing).contains(&request.action) {
            return Err(UpgradeError::ServiceControlFailed {
                service: request.name.clone(),
                action: request.action.to_string(),
                reason: "simulated failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl ServiceManager for RecordingServiceManager {
    fn control<'a>(
        &'a self,
        request: &'a ServiceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.handle(request) })
    }
}

/// [`WorkerLauncher`] that records launches instead of spawning.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<(PathBuf, Vec<String>)>>,
    fail: bool,
}

impl RecordingLauncher {
    /// Record launches but report every spawn as failed.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Recorded `(executable, args)` pairs.
    #[must_use]
    pub fn launches(&self) -> Vec<(PathBuf, Vec<String>)> {
        lock(&self.launches).clone()
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn spawn_detached(&self, executable: &Path, args: &[String]) -> Result<u32> {
        let mut launches = lock(&self.launches);
        launches.push((executable.to_path_buf(), args.to_vec()));
        if self.fail {
            anyhow::bail!("simulated spawn failure for {}", executable.display());
        }
        Ok(40_000 + launches.len() as u32)
    }
}
