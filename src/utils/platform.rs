//! Platform detection and release-asset naming
//!
//! The upgrade engine resolves the host's OS and CPU architecture exactly once,
//! into a [`Platform`] value, and every platform-dependent decision (asset
//! name, executable container format, replacement strategy, dispatch branch)
//! is taken from that value through ordinary control flow. Tests construct a
//! [`Platform`] directly to exercise any branch on any host.
//!
//! # Architecture Detection
//!
//! The architecture is read from the running kernel rather than taken from the
//! toolchain's compile-time constant, because the binary and the kernel can
//! legitimately differ (a 32-bit userland on a 64-bit kernel, for instance):
//!
//! | Platform | Source | Fallback |
//! |----------|--------|----------|
//! | Unix-like | `uname -m` | `std::env::consts::ARCH` |
//! | Windows | `PROCESSOR_ARCHITEW6432`, then `PROCESSOR_ARCHITECTURE` | `std::env::consts::ARCH` |
//!
//! # Examples
//!
//! ```rust,no_run
//! use binswap_cli::utils::platform::Platform;
//!
//! # fn example() -> anyhow::Result<()> {
//! let platform = Platform::detect();
//! let asset = platform.asset_name("binswap")?;
//! println!("{platform} downloads {asset}");
//! # Ok(())
//! # }
//! ```

use crate::constants::{SYSTEM_WORK_DIR, TEMP_WORK_DIR_NAME};
use crate::core::UpgradeError;
use anyhow::Result;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

/// Operating system family of the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Os {
    /// Linux
    Linux,
    /// macOS
    MacOs,
    /// Windows
    Windows,
    /// FreeBSD
    FreeBsd,
    /// Any other OS, by its `std::env::consts::OS` name
    Other(String),
}

impl Os {
    /// The OS the binary was compiled for.
    #[must_use]
    pub fn current() -> Self {
        Self::from_name(std::env::consts::OS)
    }

    /// Parse an OS name as reported by `std::env::consts::OS`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "linux" => Self::Linux,
            "macos" | "darwin" => Self::MacOs,
            "windows" => Self::Windows,
            "freebsd" => Self::FreeBsd,
            other => Self::Other(other.to_string()),
        }
    }

    /// Identifier used in release asset names.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "darwin",
            Self::Windows => "windows",
            Self::FreeBsd => "freebsd",
            Self::Other(name) => name,
        }
    }

    /// Whether the OS keeps an unlinked executable's inode alive for running processes.
    #[must_use]
    pub const fn is_unix_like(&self) -> bool {
        !matches!(self, Self::Windows)
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized machine architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86_64 / amd64
    X86_64,
    /// aarch64 / arm64
    Aarch64,
    /// 32-bit ARMv7
    Armv7,
    /// 32-bit ARMv6
    Armv6,
    /// 32-bit x86
    X86,
    /// Anything else, as reported by the kernel
    Other(String),
}

impl Arch {
    /// Normalize a machine string from `uname -m`, Windows environment, or
    /// `std::env::consts::ARCH`.
    #[must_use]
    pub fn normalize(machine: &str) -> Self {
        let machine = machine.trim().to_ascii_lowercase();
        match machine.as_str() {
            "x86_64" | "amd64" | "x64" => Self::X86_64,
            "aarch64" | "arm64" | "armv8l" | "aarch64_be" => Self::Aarch64,
            "i386" | "i486" | "i586" | "i686" | "x86" => Self::X86,
            // std::env::consts::ARCH reports every 32-bit ARM as "arm"
            "arm" => Self::Armv7,
            m if m.starts_with("armv7") => Self::Armv7,
            m if m.starts_with("armv6") => Self::Armv6,
            _ => Self::Other(machine),
        }
    }

    /// Architecture name as written in logs and error messages.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Armv7 => "armv7",
            Self::Armv6 => "armv6",
            Self::X86 => "x86",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS and architecture of the host performing an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system family
    pub os: Os,
    /// Machine architecture
    pub arch: Arch,
}

impl Platform {
    /// Construct a platform explicitly.
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch,
        }
    }

    /// Detect the running platform, preferring the kernel's view of the architecture.
    #[must_use]
    pub fn detect() -> Self {
        let os = Os::current();
        let arch = match kernel_machine(&os) {
            Some(machine) => Arch::normalize(&machine),
            None => {
                debug!("Kernel architecture query failed, using compile-time value");
                Arch::normalize(std::env::consts::ARCH)
            }
        };
        debug!(os = %os, arch = %arch, "Detected platform");
        Self::new(os, arch)
    }

    /// Resolve the published release asset name for this platform.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::UnsupportedPlatform`] for any OS/architecture
    /// pair without a published asset.
    pub fn asset_name(&self, prefix: &str) -> Result<String> {
        let arch = match (&self.os, &self.arch) {
            (Os::Linux, Arch::X86_64) => "amd64",
            (Os::Linux, Arch::Aarch64) => "arm64",
            (Os::Linux, Arch::Armv7) => "armv7",
            (Os::Linux, Arch::Armv6) => "armv6",
            (Os::FreeBsd | Os::MacOs | Os::Windows, Arch::X86_64) => "amd64",
            (Os::FreeBsd | Os::MacOs | Os::Windows, Arch::Aarch64) => "arm64",
            _ => {
                return Err(UpgradeError::UnsupportedPlatform {
                    os: self.os.to_string(),
                    arch: self.arch.to_string(),
                }
                .into());
            }
        };

        let extension = if self.os == Os::Windows {
            ".exe"
        } else {
            ""
        };
        Ok(format!("{prefix}-{}-{arch}{extension}", self.os))
    }

    /// Default working directory for lock, plan and status files.
    ///
    /// Linux hosts running as root get a persistent location so a reboot does
    /// not lose a plan before the upgrader service consumes it.
    #[must_use]
    pub fn default_work_dir(&self) -> PathBuf {
        if self.os == Os::Linux && is_root() {
            PathBuf::from(SYSTEM_WORK_DIR)
        } else {
            std::env::temp_dir().join(TEMP_WORK_DIR_NAME)
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

fn kernel_machine(os: &Os) -> Option<String> {
    if *os == Os::Windows {
        return std::env::var("PROCESSOR_ARCHITEW6432")
            .or_else(|_| std::env::var("PROCESSOR_ARCHITECTURE"))
            .ok()
            .filter(|value| !value.trim().is_empty());
    }

    let output = Command::new("uname").arg("-m").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let machine = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if machine.is_empty() {
        None
    } else {
        Some(machine)
    }
}

/// Whether the process runs with effective uid 0 (Linux only).
fn is_root() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| effective_uid(&status))
        .is_some_and(|uid| uid == 0)
}

fn effective_uid(status: &str) -> Option<u32> {
    // Uid:	real	effective	saved	fs
    let line = status.lines().find(|line| line.starts_with("Uid:"))?;
    line.split_whitespace().nth(2)?.parse().ok()
}
