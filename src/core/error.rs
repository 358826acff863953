//! Error handling for binswap
//!
//! This module provides the typed error taxonomy of the upgrade engine and the
//! user-facing error rendering used by the CLI. The error system follows two rules:
//! 1. **Strongly-typed errors** so callers can tell a benign contention signal
//!    ([`UpgradeError::AlreadyInProgress`]) from a fatal one
//!    ([`UpgradeError::UnsupportedPlatform`])
//! 2. **User-friendly messages** with actionable suggestions for operators
//!
//! # Architecture
//!
//! - [`UpgradeError`] - Enumerated failure modes of an upgrade attempt
//! - [`VerifyError`] - Structural verification failures of a staged binary
//! - [`ErrorContext`] - Wrapper that adds details and a suggestion for display
//!
//! Library functions return [`anyhow::Result`] with an [`UpgradeError`] as the
//! root cause, so any caller can recover the typed variant:
//!
//! ```rust,no_run
//! use binswap_cli::core::UpgradeError;
//!
//! fn is_contention(err: &anyhow::Error) -> bool {
//!     matches!(
//!         err.downcast_ref::<UpgradeError>(),
//!         Some(UpgradeError::AlreadyInProgress { .. })
//!     )
//! }
//! ```

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// Structural verification failures for a staged executable.
///
/// None of these are retried: a staged file that fails verification is never
/// trusted for installation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The staged file has zero length.
    #[error("staged binary is empty")]
    Empty,

    /// The staged file could not be opened or read.
    #[error("staged binary could not be read: {reason}")]
    Unreadable {
        /// Underlying I/O error
        reason: String,
    },

    /// The file does not carry the executable container header expected on this platform.
    #[error("not a valid {expected} executable")]
    InvalidFormat {
        /// Container format the host expects (e.g. "ELF", "Mach-O", "PE")
        expected: String,
    },

    /// The container declares a machine type other than the host architecture.
    #[error("architecture mismatch: host is {expected}, binary targets {found}")]
    ArchitectureMismatch {
        /// Architecture of the host performing the upgrade
        expected: String,
        /// Architecture declared by the binary header
        found: String,
    },
}

/// The main error type for upgrade operations
///
/// Each variant maps to one failure class of an upgrade attempt. All fields
/// are plain strings so the error can be cloned into an [`ErrorContext`] and
/// rendered after the fact.
///
/// # Error Categories
///
/// - **Fatal, not retried**: [`UnsupportedPlatform`], [`VerificationFailed`], [`ScheduleFailed`]
/// - **Benign contention**: [`AlreadyInProgress`]
/// - **Per-attempt I/O**: [`DownloadFailed`], [`StageFailed`], [`ReplaceFailed`]
/// - **Non-fatal on restart**: [`ServiceControlFailed`]
/// - **Persisted records**: [`SchemaMismatch`], [`StatusNotFound`], [`InvalidPlan`]
///
/// [`UnsupportedPlatform`]: UpgradeError::UnsupportedPlatform
/// [`VerificationFailed`]: UpgradeError::VerificationFailed
/// [`ScheduleFailed`]: UpgradeError::ScheduleFailed
/// [`AlreadyInProgress`]: UpgradeError::AlreadyInProgress
/// [`DownloadFailed`]: UpgradeError::DownloadFailed
/// [`StageFailed`]: UpgradeError::StageFailed
/// [`ReplaceFailed`]: UpgradeError::ReplaceFailed
/// [`ServiceControlFailed`]: UpgradeError::ServiceControlFailed
/// [`SchemaMismatch`]: UpgradeError::SchemaMismatch
/// [`StatusNotFound`]: UpgradeError::StatusNotFound
/// [`InvalidPlan`]: UpgradeError::InvalidPlan
#[derive(Error, Debug, Clone)]
pub enum UpgradeError {
    /// No release asset is published for this OS/architecture pair
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform {
        /// Operating system identifier
        os: String,
        /// Normalized machine architecture
        arch: String,
    },

    /// Another upgrade attempt holds the instance lock
    #[error("an upgrade is already in progress (lock held at {lock_path})")]
    AlreadyInProgress {
        /// Path of the lock file
        lock_path: String,
    },

    /// The fetcher could not download the artifact
    #[error("failed to download {url}: {reason}")]
    DownloadFailed {
        /// URL that was requested
        url: String,
        /// Transport or HTTP failure description
        reason: String,
    },

    /// The fetched artifact could not be staged next to the target
    #[error("failed to stage binary at {path}: {reason}")]
    StageFailed {
        /// Staging path
        path: String,
        /// Underlying failure
        reason: String,
    },

    /// The staged artifact failed structural verification
    #[error("verification of {path} failed: {source}")]
    VerificationFailed {
        /// Path of the verified file
        path: String,
        /// What the verifier rejected
        #[source]
        source: VerifyError,
    },

    /// The live executable could not be replaced
    #[error("failed to replace {target}: {reason}")]
    ReplaceFailed {
        /// Target executable path
        target: String,
        /// Underlying failure
        reason: String,
        /// Whether the previous binary was restored from its backup
        rolled_back: bool,
    },

    /// The OS service manager rejected a control action
    #[error("service '{service}' {action} failed: {reason}")]
    ServiceControlFailed {
        /// Service name
        service: String,
        /// Action that failed (install, uninstall, start, stop)
        action: String,
        /// Output or error from the service manager
        reason: String,
    },

    /// The upgrade could not be handed off to a worker or upgrader service
    #[error("failed to schedule upgrade worker: {reason}")]
    ScheduleFailed {
        /// Underlying failure
        reason: String,
    },

    /// A persisted record was written by an incompatible schema
    #[error("{path} has schema version {found}, expected {expected}")]
    SchemaMismatch {
        /// Record path
        path: String,
        /// Schema version this build reads
        expected: u32,
        /// Schema version found in the file
        found: u32,
    },

    /// No status has been recorded in the working directory
    #[error("no upgrade status recorded at {path}")]
    StatusNotFound {
        /// Expected status path
        path: String,
    },

    /// A plan file exists but cannot be parsed
    #[error("invalid upgrade plan {path}: {reason}")]
    InvalidPlan {
        /// Plan path
        path: String,
        /// Parse failure
        reason: String,
    },

    /// Configuration file problem
    #[error("configuration error: {message}")]
    ConfigError {
        /// Description of the configuration error
        message: String,
    },

    /// Catch-all wrapper for errors without a dedicated variant
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
    },
}

/// Error context wrapper that provides user-friendly error information
///
/// Details are displayed in yellow, suggestions in green, the error itself in
/// bold red.
///
/// ```rust,no_run
/// use binswap_cli::core::{ErrorContext, UpgradeError};
///
/// let context = ErrorContext::new(UpgradeError::ScheduleFailed {
///     reason: "systemctl not found".to_string(),
/// })
/// .with_suggestion("Run the upgrade on a host managed by systemd");
/// context.display();
/// ```
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying upgrade error
    pub error: UpgradeError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: UpgradeError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add additional details explaining the error
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Display the error context to stderr with terminal colors
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into an [`ErrorContext`] with a suggestion tailored to the failure.
///
/// Typed [`UpgradeError`]s anywhere in the chain are recognized; other errors
/// keep their full cause chain in the message.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    if let Some(upgrade_error) = error.chain().find_map(|e| e.downcast_ref::<UpgradeError>()) {
        return create_error_context(upgrade_error.clone());
    }

    let permission_denied = error
        .chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|e| e.kind() == std::io::ErrorKind::PermissionDenied);
    if permission_denied {
        return ErrorContext::new(UpgradeError::Other {
            message: format!("{error:#}"),
        })
        .with_suggestion(
            "Re-run with elevated permissions (sudo/Administrator) or check ownership of the target and working directory",
        );
    }

    ErrorContext::new(UpgradeError::Other {
        message: format!("{error:#}"),
    })
}

fn create_error_context(error: UpgradeError) -> ErrorContext {
    match &error {
        UpgradeError::UnsupportedPlatform {
            ..
        } => ErrorContext::new(error)
            .with_details("No release asset is published for this operating system and CPU")
            .with_suggestion("Pass --url with a binary built for this host"),
        UpgradeError::AlreadyInProgress {
            ..
        } => ErrorContext::new(error)
            .with_details("Only one upgrade may run per installation at a time")
            .with_suggestion("Wait for the running attempt to finish, then poll `binswap upgrade-status`"),
        UpgradeError::DownloadFailed {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Check network connectivity, the requested version, or configure --proxy / --use-mirror"),
        UpgradeError::VerificationFailed {
            ..
        } => ErrorContext::new(error)
            .with_details("The downloaded file is not an executable for this host")
            .with_suggestion("Check that the requested asset matches the host OS and architecture"),
        UpgradeError::ReplaceFailed {
            rolled_back,
            ..
        } => {
            let details = if *rolled_back {
                "The previous binary was restored from its backup"
            } else {
                "No backup was taken; the target may need manual inspection"
            };
            ErrorContext::new(error)
                .with_details(details)
                .with_suggestion("Check write permissions on the target directory")
        }
        UpgradeError::ScheduleFailed {
            ..
        } => ErrorContext::new(error)
            .with_details("Nothing was dispatched; the running binary is unchanged"),
        UpgradeError::SchemaMismatch {
            ..
        } => ErrorContext::new(error)
            .with_suggestion("Remove the stale record or run the matching binswap version"),
        UpgradeError::StatusNotFound {
            ..
        } => ErrorContext::new(error).with_details(
            "A missing status with a present plan means the upgrade is in progress or crashed before completing",
        ),
        _ => ErrorContext::new(error),
    }
}
