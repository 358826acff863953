//! Minimal OS service control.
//!
//! The upgrade engine needs four things from the host's service manager: stop
//! and start the service that runs the target binary, and install/uninstall
//! the oneshot upgrader unit on Linux. [`ServiceManager`] is the seam;
//! [`SystemServiceManager`] drives the host's own tooling:
//!
//! | OS | Tool | Supported actions |
//! |----|------|-------------------|
//! | Linux | `systemctl` | install, uninstall, start, stop |
//! | Windows | `sc.exe` | install, uninstall, start, stop |
//! | macOS | `launchctl` | start, stop |
//! | FreeBSD | `service` | start, stop |
//!
//! Service arguments from the upgrade options are passed to the tool ahead of
//! the action, e.g. `systemctl --user start edge-agent`.

use crate::core::UpgradeError;
use crate::utils::fs::atomic_write;
use crate::utils::platform::Os;
use anyhow::{Context, Result};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Operation requested from the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    /// Register a new service
    Install,
    /// Remove a registered service
    Uninstall,
    /// Start a registered service
    Start,
    /// Stop a running service
    Stop,
}

impl ServiceAction {
    /// Lower-case action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a service being installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Human-readable description
    pub description: String,
    /// Program the service runs
    pub executable: PathBuf,
    /// Arguments to the program
    pub arguments: Vec<String>,
    /// Working directory of the service
    pub working_directory: PathBuf,
    /// Raw unit template with `{{executable}}`, `{{arguments}}`,
    /// `{{working_directory}}` and `{{description}}` placeholders
    pub unit_template: Option<String>,
}

/// One call into the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Service name
    pub name: String,
    /// Extra arguments for the service tool
    pub args: Vec<String>,
    /// Requested operation
    pub action: ServiceAction,
    /// Service definition, used by [`ServiceAction::Install`]
    pub options: Option<ServiceOptions>,
    /// Queue a start without waiting for it to finish (systemd only)
    pub no_block: bool,
}

impl ServiceRequest {
    /// A request without a service definition.
    #[must_use]
    pub fn new(name: impl Into<String>, action: ServiceAction, args: &[String]) -> Self {
        Self {
            name: name.into(),
            args: args.to_vec(),
            action,
            options: None,
            no_block: false,
        }
    }

    /// Return as soon as the start is queued instead of waiting for its result.
    ///
    /// Needed when the started unit stops the caller's own service.
    #[must_use]
    pub fn without_blocking(mut self) -> Self {
        self.no_block = true;
        self
    }

    /// An install request for `options`.
    #[must_use]
    pub fn install(name: impl Into<String>, options: ServiceOptions, args: &[String]) -> Self {
        Self {
            options: Some(options),
            ..Self::new(name, ServiceAction::Install, args)
        }
    }
}

/// Controls OS services.
pub trait ServiceManager: Send + Sync {
    /// Perform `request`.
    ///
    /// Failures are reported as [`UpgradeError::ServiceControlFailed`].
    fn control<'a>(
        &'a self,
        request: &'a ServiceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Substitute the service placeholders in `template`.
///
/// Arguments containing whitespace are double-quoted.
#[must_use]
pub fn render_template(template: &str, options: &ServiceOptions) -> String {
    let arguments = options
        .arguments
        .iter()
        .map(|arg| {
            if arg.chars().any(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    template
        .replace("{{executable}}", &options.executable.display().to_string())
        .replace("{{arguments}}", &arguments)
        .replace("{{working_directory}}", &options.working_directory.display().to_string())
        .replace("{{description}}", &options.description)
}

/// A tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: &'static str,
    args: Vec<String>,
}

impl Invocation {
    fn new(program: &'static str, args: &[String], rest: &[&str]) -> Self {
        let mut all = args.to_vec();
        all.extend(rest.iter().map(|s| (*s).to_string()));
        Self {
            program,
            args: all,
        }
    }
}

/// [`ServiceManager`] backed by the host's service tooling.
#[derive(Debug, Clone)]
pub struct SystemServiceManager {
    os: Os,
    unit_dir: PathBuf,
}

impl SystemServiceManager {
    /// Manager for `os`, writing systemd units to `/etc/systemd/system`.
    #[must_use]
    pub fn new(os: Os) -> Self {
        Self {
            os,
            unit_dir: PathBuf::from(SYSTEMD_UNIT_DIR),
        }
    }

    /// Write systemd units to a different directory.
    #[must_use]
    pub fn with_unit_dir(mut self, unit_dir: PathBuf) -> Self {
        self.unit_dir = unit_dir;
        self
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{name}.service"))
    }

    fn failed(request: &ServiceRequest, reason: impl Into<String>) -> UpgradeError {
        UpgradeError::ServiceControlFailed {
            service: request.name.clone(),
            action: request.action.to_string(),
            reason: reason.into(),
        }
    }

    /// Tool invocations for `request`, in order.
    fn plan(&self, request: &ServiceRequest) -> Result<Vec<Invocation>> {
        let name = request.name.as_str();
        let args = request.args.as_slice();

        let invocations = match (&self.os, request.action) {
            (Os::Linux, ServiceAction::Install) => vec![
                Invocation::new("systemctl", args, &["daemon-reload"]),
                Invocation::new("systemctl", args, &["enable", name]),
            ],
            (Os::Linux, ServiceAction::Uninstall) => {
                vec![Invocation::new("systemctl", args, &["disable", name])]
            }
            (Os::Linux, ServiceAction::Start) if request.no_block => {
                vec![Invocation::new("systemctl", args, &["start", "--no-block", name])]
            }
            (Os::Linux, ServiceAction::Start) => {
                vec![Invocation::new("systemctl", args, &["start", name])]
            }
            (Os::Linux, ServiceAction::Stop) => {
                vec![Invocation::new("systemctl", args, &["stop", name])]
            }
            (Os::Windows, ServiceAction::Install) => {
                let options = request
                    .options
                    .as_ref()
                    .ok_or_else(|| Self::failed(request, "missing service definition"))?;
                let mut bin_path = format!("\"{}\"", options.executable.display());
                for arg in &options.arguments {
                    bin_path.push(' ');
                    bin_path.push_str(arg);
                }
                vec![Invocation::new(
                    "sc.exe",
                    args,
                    &[
                        "create",
                        name,
                        "binPath=",
                        bin_path.as_str(),
                        "start=",
                        "demand",
                        "DisplayName=",
                        options.description.as_str(),
                    ],
                )]
            }
            (Os::Windows, ServiceAction::Uninstall) => {
                vec![Invocation::new("sc.exe", args, &["delete", name])]
            }
            (Os::Windows, ServiceAction::Start) => {
                vec![Invocation::new("sc.exe", args, &["start", name])]
            }
            (Os::Windows, ServiceAction::Stop) => {
                vec![Invocation::new("sc.exe", args, &["stop", name])]
            }
            (Os::MacOs, ServiceAction::Start) => {
                vec![Invocation::new("launchctl", args, &["start", name])]
            }
            (Os::MacOs, ServiceAction::Stop) => {
                vec![Invocation::new("launchctl", args, &["stop", name])]
            }
            (Os::FreeBsd, ServiceAction::Start) => {
                vec![Invocation::new("service", args, &[name, "start"])]
            }
            (Os::FreeBsd, ServiceAction::Stop) => {
                vec![Invocation::new("service", args, &[name, "stop"])]
            }
            (os, action) => {
                return Err(Self::failed(request, format!("{action} is not supported on {os}")).into());
            }
        };
        Ok(invocations)
    }

    async fn run(&self, request: &ServiceRequest) -> Result<()> {
        let invocations = self.plan(request)?;

        if self.os == Os::Linux && request.action == ServiceAction::Install {
            self.write_unit(request)?;
        }

        for invocation in &invocations {
            run_tool(request, invocation).await?;
        }

        if self.os == Os::Linux && request.action == ServiceAction::Uninstall {
            let unit = self.unit_path(&request.name);
            crate::utils::fs::remove_file_if_exists(&unit)
                .map_err(|e| Self::failed(request, format!("{e:#}")))?;
            run_tool(request, &Invocation::new("systemctl", &request.args, &["daemon-reload"]))
                .await?;
        }

        info!(service = %request.name, action = %request.action, "Service control completed");
        Ok(())
    }

    fn write_unit(&self, request: &ServiceRequest) -> Result<PathBuf> {
        let options = request
            .options
            .as_ref()
            .ok_or_else(|| Self::failed(request, "missing service definition"))?;
        let template = options
            .unit_template
            .as_deref()
            .ok_or_else(|| Self::failed(request, "missing unit template"))?;

        let unit = self.unit_path(&request.name);
        atomic_write(&unit, render_template(template, options).as_bytes())
            .with_context(|| format!("Failed to write unit file: {}", unit.display()))
            .map_err(|e| Self::failed(request, format!("{e:#}")))?;
        debug!(unit = %unit.display(), "Unit file written");
        Ok(unit)
    }

    /// Directory systemd units are written to.
    #[must_use]
    pub fn unit_dir(&self) -> &Path {
        &self.unit_dir
    }
}

impl ServiceManager for SystemServiceManager {
    fn control<'a>(
        &'a self,
        request: &'a ServiceRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.run(request))
    }
}

async fn run_tool(request: &ServiceRequest, invocation: &Invocation) -> Result<()> {
    debug!(
        program = invocation.program,
        args = %invocation.args.join(" "),
        "Executing service command"
    );

    let output = Command::new(invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            SystemServiceManager::failed(request, format!("failed to run {}: {e}", invocation.program))
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let reason = if stderr.is_empty() {
        format!("{} exited with {}", invocation.program, output.status)
    } else {
        stderr
    };
    Err(SystemServiceManager::failed(request, reason).into())
}
