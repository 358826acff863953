//! Durable plan and status records.
//!
//! A [`Plan`] describes the intent of one upgrade attempt and is the only
//! thing that crosses the dispatch boundary to a worker process or upgrader
//! service. A [`Status`] records the terminal outcome of a dispatched attempt
//! for external polling.
//!
//! Both live in the working directory as pretty-printed JSON:
//!
//! ```text
//! <work_dir>/plan.json     single slot, overwritten by every new attempt
//! <work_dir>/status.json   outcome of the last completed worker run
//! ```
//!
//! Records carry a `schema_version`. A reader refuses any version other than
//! [`SCHEMA_VERSION`](crate::constants::SCHEMA_VERSION) with
//! [`UpgradeError::SchemaMismatch`] before looking at the rest of the document.

use crate::constants::{PLAN_FILE_NAME, SCHEMA_VERSION, STATUS_FILE_NAME};
use crate::core::UpgradeError;
use crate::upgrade::options::UpgradeOptions;
use crate::utils::fs::{atomic_write, remove_file_if_exists};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persisted intent of one upgrade attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Record schema version
    pub schema_version: u32,
    /// When the plan was written
    pub created_at: DateTime<Utc>,
    /// Process that requested the upgrade
    pub requesting_pid: u32,
    /// Options of the attempt, with target path and working directory resolved
    pub options: UpgradeOptions,
}

/// Terminal outcome of a worker-executed upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Record schema version
    pub schema_version: u32,
    /// When the outcome was recorded
    pub updated_at: DateTime<Utc>,
    /// Whether the binary was replaced
    pub success: bool,
    /// Human-readable outcome, including warnings on success
    pub message: String,
}

#[derive(Deserialize)]
struct SchemaProbe {
    schema_version: Option<u32>,
}

/// Path of the plan file in `work_dir`.
#[must_use]
pub fn plan_path(work_dir: &Path) -> PathBuf {
    work_dir.join(PLAN_FILE_NAME)
}

/// Path of the status file in `work_dir`.
#[must_use]
pub fn status_path(work_dir: &Path) -> PathBuf {
    work_dir.join(STATUS_FILE_NAME)
}

/// Write a new plan for `options`, replacing any previous plan.
pub fn write_plan(work_dir: &Path, options: &UpgradeOptions) -> Result<PathBuf> {
    let plan = Plan {
        schema_version: SCHEMA_VERSION,
        created_at: Utc::now(),
        requesting_pid: std::process::id(),
        options: options.clone(),
    };

    let path = plan_path(work_dir);
    let content = serde_json::to_vec_pretty(&plan).context("Failed to serialize upgrade plan")?;
    atomic_write(&path, &content)
        .with_context(|| format!("Failed to write upgrade plan: {}", path.display()))?;

    debug!(path = %path.display(), "Upgrade plan written");
    Ok(path)
}

/// Read and validate a plan.
///
/// # Errors
///
/// - I/O errors, including a missing file
/// - [`UpgradeError::SchemaMismatch`] for any other schema version
/// - [`UpgradeError::InvalidPlan`] for malformed JSON
pub fn read_plan(path: &Path) -> Result<Plan> {
    let content = std::fs::read(path)
        .with_context(|| format!("Failed to read upgrade plan: {}", path.display()))?;

    decode_versioned(path, &content).map_err(|e| match e.downcast::<UpgradeError>() {
        Ok(typed) => typed.into(),
        Err(other) => UpgradeError::InvalidPlan {
            path: path.display().to_string(),
            reason: format!("{other:#}"),
        }
        .into(),
    })
}

/// Delete a consumed plan. A missing plan is not an error.
pub fn remove_plan(path: &Path) -> Result<()> {
    remove_file_if_exists(path)
        .with_context(|| format!("Failed to remove upgrade plan: {}", path.display()))
}

/// Record the outcome of an attempt.
pub fn write_status(work_dir: &Path, success: bool, message: impl Into<String>) -> Result<()> {
    let status = Status {
        schema_version: SCHEMA_VERSION,
        updated_at: Utc::now(),
        success,
        message: message.into(),
    };

    let path = status_path(work_dir);
    let content =
        serde_json::to_vec_pretty(&status).context("Failed to serialize upgrade status")?;
    atomic_write(&path, &content)
        .with_context(|| format!("Failed to write upgrade status: {}", path.display()))?;

    debug!(path = %path.display(), success, "Upgrade status written");
    Ok(())
}

/// Read the last recorded outcome from `work_dir`.
///
/// # Errors
///
/// - [`UpgradeError::StatusNotFound`] if no status was ever written
/// - [`UpgradeError::SchemaMismatch`] for any other schema version
pub fn read_status(work_dir: &Path) -> Result<Status> {
    let path = status_path(work_dir);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(UpgradeError::StatusNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read upgrade status: {}", path.display()));
        }
    };

    decode_versioned(&path, &content)
}

fn decode_versioned<T: DeserializeOwned>(path: &Path, content: &[u8]) -> Result<T> {
    let probe: SchemaProbe = serde_json::from_slice(content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let found = probe.schema_version.unwrap_or(0);
    if found != SCHEMA_VERSION {
        return Err(UpgradeError::SchemaMismatch {
            path: path.display().to_string(),
            expected: SCHEMA_VERSION,
            found,
        }
        .into());
    }

    serde_json::from_slice(content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_options(work_dir: &Path) -> UpgradeOptions {
        UpgradeOptions {
            version: "v1.2.3".to_string(),
            mirror_url: Some("https://mirror.example/".to_string()),
            use_mirror: true,
            target_path: Some(work_dir.join("svc")),
            backup: true,
            service_name: Some("edge-agent".to_string()),
            restart_service: true,
            work_dir: Some(work_dir.to_path_buf()),
            service_args: vec!["--user".to_string()],
            ..UpgradeOptions::default()
        }
    }

    #[test]
    fn test_plan_round_trip() {
        let temp = TempDir::new().unwrap();
        let options = sample_options(temp.path());

        let path = write_plan(temp.path(), &options).unwrap();
        assert_eq!(path, temp.path().join("plan.json"));

        let plan = read_plan(&path).unwrap();
        assert_eq!(plan.schema_version, SCHEMA_VERSION);
        assert_eq!(plan.requesting_pid, std::process::id());
        assert_eq!(plan.options, options);
    }

    #[test]
    fn test_new_plan_overwrites_previous() {
        let temp = TempDir::new().unwrap();
        let first = sample_options(temp.path());
        let second = UpgradeOptions {
            version: "v2.0.0".to_string(),
            ..first.clone()
        };

        write_plan(temp.path(), &first).unwrap();
        let path = write_plan(temp.path(), &second).unwrap();
        assert_eq!(read_plan(&path).unwrap().options.version, "v2.0.0");
    }

    #[test]
    fn test_future_schema_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = plan_path(temp.path());
        std::fs::write(
            &path,
            r#"{"schema_version": 2, "created_at": "2026-01-01T00:00:00Z", "requesting_pid": 1,
                "options": {"version": "v9", "rollout_wave": 3}}"#,
        )
        .unwrap();

        let err = read_plan(&path).unwrap_err();
        match err.downcast_ref::<UpgradeError>() {
            Some(UpgradeError::SchemaMismatch {
                expected,
                found,
                ..
            }) => {
                assert_eq!(*expected, SCHEMA_VERSION);
                assert_eq!(*found, 2);
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_schema_version_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = plan_path(temp.path());
        std::fs::write(&path, r#"{"options": {}}"#).unwrap();

        let err = read_plan(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::SchemaMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn test_garbage_plan_is_invalid() {
        let temp = TempDir::new().unwrap();
        let path = plan_path(temp.path());
        std::fs::write(&path, b"not json").unwrap();

        let err = read_plan(&path).unwrap_err();
        assert!(matches!(err.downcast_ref::<UpgradeError>(), Some(UpgradeError::InvalidPlan { .. })));
    }

    #[test]
    fn test_remove_plan_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = write_plan(temp.path(), &sample_options(temp.path())).unwrap();
        remove_plan(&path).unwrap();
        remove_plan(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_status_round_trip_and_not_found() {
        let temp = TempDir::new().unwrap();

        let err = read_status(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::StatusNotFound { .. })
        ));

        write_status(temp.path(), false, "verification failed").unwrap();
        write_status(temp.path(), true, "upgraded").unwrap();

        let status = read_status(temp.path()).unwrap();
        assert!(status.success);
        assert_eq!(status.message, "upgraded");
        assert_eq!(status.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_status_schema_mismatch() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            status_path(temp.path()),
            r#"{"schema_version": 7, "updated_at": "2026-01-01T00:00:00Z", "success": true, "message": ""}"#,
        )
        .unwrap();

        let err = read_status(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpgradeError>(),
            Some(UpgradeError::SchemaMismatch { found: 7, .. })
        ));
    }
}
