//! Host-wide configuration for binswap.
//!
//! Holds the defaults an operator sets once per host: where releases are
//! published, a default mirror, where upgrade state lives and how long the
//! Windows worker waits for a locked binary. Per-attempt choices (version,
//! backup, service) stay on the command line.
//!
//! # Configuration File Location
//!
//! 1. `--config <path>`
//! 2. `BINSWAP_CONFIG_PATH`
//! 3. `<config dir>/binswap/config.toml` (`~/.config` on Linux,
//!    `~/Library/Application Support` on macOS, `%APPDATA%` on Windows)
//!
//! A missing file yields the defaults.
//!
//! # File Format
//!
//! ```toml
//! [release]
//! url_template = "https://github.com/acme/edge-agent/releases/download/{version}/{asset}"
//! latest_url_template = "https://github.com/acme/edge-agent/releases/latest/download/{asset}"
//! asset_prefix = "edge-agent"
//! mirror_url = "https://mirror.example"
//!
//! [upgrade]
//! work_dir = "/var/lib/edge-agent/upgrade"
//! replace_timeout_secs = 60
//! replace_retry_interval_ms = 500
//! ```

use crate::constants::{CONFIG_PATH_ENV, DEFAULT_REPLACE_RETRY_INTERVAL, DEFAULT_REPLACE_TIMEOUT};
use crate::upgrade::fetch::ReleaseSource;
use crate::upgrade::orchestrator::UpgradeSettings;
use crate::upgrade::replace::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

const fn default_replace_timeout_secs() -> u64 {
    DEFAULT_REPLACE_TIMEOUT.as_secs()
}

const fn default_replace_retry_interval_ms() -> u64 {
    DEFAULT_REPLACE_RETRY_INTERVAL.as_millis() as u64
}

/// `[upgrade]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeSection {
    /// Working directory for lock, plan and status files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Give up replacing a locked Windows binary after this many seconds
    #[serde(default = "default_replace_timeout_secs")]
    pub replace_timeout_secs: u64,

    /// Pause between Windows replace attempts, in milliseconds
    #[serde(default = "default_replace_retry_interval_ms")]
    pub replace_retry_interval_ms: u64,
}

impl Default for UpgradeSection {
    fn default() -> Self {
        Self {
            work_dir: None,
            replace_timeout_secs: default_replace_timeout_secs(),
            replace_retry_interval_ms: default_replace_retry_interval_ms(),
        }
    }
}

/// Host-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Release location and asset naming
    #[serde(default)]
    pub release: ReleaseSource,

    /// Upgrade state and timing
    #[serde(default)]
    pub upgrade: UpgradeSection,
}

impl Config {
    /// Load from the default location, or defaults if no file exists.
    pub async fn load() -> Result<Self> {
        Self::load_with_optional(None).await
    }

    /// Load from `path` if given, otherwise from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub async fn load_with_optional(path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(&path).await;
        }

        let path = Self::default_path()?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            Self::load_from(&path).await
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load and parse a specific file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Default configuration file path, honoring `BINSWAP_CONFIG_PATH`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine configuration directory"))?;
        Ok(config_dir.join("binswap").join("config.toml"))
    }

    /// Windows replace retry bounds.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.upgrade.replace_timeout_secs),
            interval: Duration::from_millis(self.upgrade.replace_retry_interval_ms),
        }
    }

    /// Settings for an [`Upgrader`](crate::upgrade::Upgrader).
    #[must_use]
    pub fn upgrade_settings(&self) -> UpgradeSettings {
        UpgradeSettings {
            release: self.release.clone(),
            retry: self.retry_policy(),
            work_dir: self.upgrade.work_dir.clone(),
            worker_executable: None,
        }
    }
}
