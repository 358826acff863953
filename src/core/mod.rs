//! Core types shared across binswap
//!
//! The core module holds the error taxonomy used by every upgrade component:
//! - [`UpgradeError`] - Enumerated failure modes of an upgrade attempt
//! - [`VerifyError`] - Rejections from the binary verifier
//! - [`ErrorContext`] - User-friendly error wrapper with suggestions and details
//! - [`user_friendly_error`] - Convert any error to the user-friendly format
//!
//! ```rust,no_run
//! use binswap_cli::core::{UpgradeError, user_friendly_error};
//!
//! let err = anyhow::Error::from(UpgradeError::StatusNotFound {
//!     path: "/tmp/binswap-upgrade/status.json".to_string(),
//! });
//! user_friendly_error(err).display();
//! ```

pub mod error;

pub use error::{ErrorContext, UpgradeError, VerifyError, user_friendly_error};
