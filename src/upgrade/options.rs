use crate::constants::LATEST_VERSION;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Caller-supplied parameters of one upgrade attempt.
///
/// Options are immutable once an attempt starts. They are copied verbatim into
/// the persisted [`Plan`](crate::upgrade::plan::Plan) so a worker running in a
/// different process sees exactly what the requester asked for, with the
/// target path and working directory already resolved.
///
/// # Examples
///
/// ```rust,no_run
/// use binswap_cli::upgrade::UpgradeOptions;
///
/// let options = UpgradeOptions {
///     version: "v1.4.0".to_string(),
///     backup: true,
///     service_name: Some("edge-agent".to_string()),
///     restart_service: true,
///     ..UpgradeOptions::default()
/// };
/// assert!(options.wants_service_restart());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeOptions {
    /// Release version to install, `"latest"` by default.
    pub version: String,

    /// Fully-qualified download URL. Takes priority over version/asset resolution.
    pub download_url: Option<String>,

    /// Mirror prefix placed in front of the upstream release URL.
    pub mirror_url: Option<String>,

    /// Whether the mirror prefix is applied.
    pub use_mirror: bool,

    /// Outbound HTTP/HTTPS proxy used by the fetcher.
    pub http_proxy: Option<String>,

    /// Executable to replace. Defaults to the running executable.
    pub target_path: Option<PathBuf>,

    /// Copy the replaced executable aside to `<target>.bak`.
    pub backup: bool,

    /// OS service controlling the target binary.
    pub service_name: Option<String>,

    /// Restart `service_name` after the replacement.
    pub restart_service: bool,

    /// Directory holding the lock, plan and status files.
    pub work_dir: Option<PathBuf>,

    /// Extra arguments passed through to service control.
    pub service_args: Vec<String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            version: LATEST_VERSION.to_string(),
            download_url: None,
            mirror_url: None,
            use_mirror: false,
            http_proxy: None,
            target_path: None,
            backup: false,
            service_name: None,
            restart_service: false,
            work_dir: None,
            service_args: Vec::new(),
        }
    }
}

impl UpgradeOptions {
    /// The service to restart, if a restart was requested for a named service.
    #[must_use]
    pub fn restart_target(&self) -> Option<&str> {
        if !self.restart_service {
            return None;
        }
        self.service_name.as_deref().map(str::trim).filter(|name| !name.is_empty())
    }

    /// Whether a named service must be restarted after replacement.
    #[must_use]
    pub fn wants_service_restart(&self) -> bool {
        self.restart_target().is_some()
    }
}
