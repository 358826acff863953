//! Integration test suite for binswap
//!
//! End-to-end upgrade attempts against temp directories, with the network,
//! the service manager and process spawning replaced by recording fakes from
//! `binswap_cli::test_utils`. The `cli` tests drive the real binary.
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **direct**: in-process replacement with backup and service restart
//! - **dispatch**: Linux upgrader-service and Windows worker hand-off, then the worker run
//! - **cli**: argument handling and exit codes of the `binswap` binary

mod cli;
mod direct;
mod dispatch;

use binswap_cli::test_utils::{FakeFetcher, RecordingLauncher, RecordingServiceManager};
use binswap_cli::upgrade::{RetryPolicy, UpgradeOptions, UpgradeSettings, Upgrader};
use binswap_cli::utils::platform::Platform;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const OLD_BINARY: &[u8] = b"old binary";

/// A target binary and working directory inside one temp dir, with recording collaborators.
pub struct Host {
    _temp: TempDir,
    pub target: PathBuf,
    pub work_dir: PathBuf,
    pub services: Arc<RecordingServiceManager>,
    pub launcher: Arc<RecordingLauncher>,
}

impl Host {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let bin_dir = temp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let target = bin_dir.join("edge-agent");
        std::fs::write(&target, OLD_BINARY).unwrap();

        Self {
            target,
            work_dir: temp.path().join("state").join("upgrade"),
            services: Arc::new(RecordingServiceManager::default()),
            launcher: Arc::new(RecordingLauncher::default()),
            _temp: temp,
        }
    }

    pub fn upgrader(&self, platform: Platform, fetcher: Arc<FakeFetcher>) -> Upgrader {
        Upgrader::new(platform)
            .with_fetcher(fetcher)
            .with_service_manager(self.services.clone())
            .with_launcher(self.launcher.clone())
            .with_settings(UpgradeSettings {
                worker_executable: Some(PathBuf::from("/opt/edge/bin/binswap")),
                retry: RetryPolicy {
                    timeout: Duration::from_secs(2),
                    interval: Duration::from_millis(20),
                },
                ..UpgradeSettings::default()
            })
    }

    pub fn options(&self) -> UpgradeOptions {
        UpgradeOptions {
            version: "1.4.0".to_string(),
            target_path: Some(self.target.clone()),
            work_dir: Some(self.work_dir.clone()),
            ..UpgradeOptions::default()
        }
    }

    pub fn with_service(&self) -> UpgradeOptions {
        UpgradeOptions {
            service_name: Some("edge-agent".to_string()),
            restart_service: true,
            ..self.options()
        }
    }
}
