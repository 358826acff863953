//! Global constants used throughout the binswap codebase.
//!
//! File names, schema versions, release URL templates and timing defaults
//! live here so every component agrees on the on-disk layout.

use std::time::Duration;

/// Name of the instance lock file inside the working directory.
pub const LOCK_FILE_NAME: &str = "upgrade.lock";

/// Name of the single-slot plan file inside the working directory.
pub const PLAN_FILE_NAME: &str = "plan.json";

/// Name of the status file inside the working directory.
pub const STATUS_FILE_NAME: &str = "status.json";

/// Schema version written into, and required from, plan and status records.
pub const SCHEMA_VERSION: u32 = 1;

/// Suffix appended to the target file name for the staged artifact.
pub const STAGED_SUFFIX: &str = ".new";

/// Suffix appended to the target file name for the backup copy.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix used on Windows to displace a running image when no backup is requested.
pub const DISPLACED_SUFFIX: &str = ".old";

/// Version string that selects the most recent release.
pub const LATEST_VERSION: &str = "latest";

/// Prefix of release asset names (`{prefix}-{os}-{arch}`).
pub const DEFAULT_ASSET_PREFIX: &str = "binswap";

/// Release download URL for a pinned version.
pub const DEFAULT_RELEASE_URL_TEMPLATE: &str =
    "https://github.com/binswap/binswap/releases/download/{version}/{asset}";

/// Release download URL for the latest release.
pub const DEFAULT_LATEST_URL_TEMPLATE: &str =
    "https://github.com/binswap/binswap/releases/latest/download/{asset}";

/// Suffix of the dedicated upgrader service name (`{service}-upgrader`).
pub const UPGRADER_SERVICE_SUFFIX: &str = "-upgrader";

/// Hidden CLI subcommand that re-enters the worker entry point.
pub const WORKER_COMMAND: &str = "upgrade-worker";

/// Persistent working directory used on Linux when running as root.
pub const SYSTEM_WORK_DIR: &str = "/var/lib/binswap/upgrade";

/// Directory name under the OS temp dir used otherwise.
pub const TEMP_WORK_DIR_NAME: &str = "binswap-upgrade";

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "BINSWAP_CONFIG_PATH";

/// Default bound for the Windows replace retry loop (60 seconds).
pub const DEFAULT_REPLACE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between Windows replace attempts (500ms).
pub const DEFAULT_REPLACE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Systemd unit written for the oneshot upgrader service.
///
/// `{{plan_path}}` is filled in by the orchestrator; the remaining placeholders
/// are substituted by the service manager at install time.
pub const UPGRADER_UNIT_TEMPLATE: &str = "[Unit]
Description={{description}}
ConditionPathExists={{plan_path}}
After=network-online.target

[Service]
Type=oneshot
ExecStart={{executable}} {{arguments}}
WorkingDirectory={{working_directory}}
Restart=no
RemainAfterExit=no

[Install]
WantedBy=multi-user.target
";
