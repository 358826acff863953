use anyhow::Result;
use assert_cmd::Command;
use binswap_cli::upgrade::plan::write_status;
use predicates::prelude::*;
use tempfile::TempDir;

/// `binswap` isolated from any configuration on the host.
fn binswap(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("binswap").unwrap();
    cmd.env("BINSWAP_CONFIG_PATH", temp.path().join("absent.toml"))
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_hides_worker_command() {
    let temp = TempDir::new().unwrap();
    binswap(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upgrade-status"))
        .stdout(predicate::str::contains("upgrade-worker").not());
}

#[test]
fn test_worker_without_plan_is_noop() {
    let temp = TempDir::new().unwrap();
    let plan = temp.path().join("upgrade").join("plan.json");

    binswap(&temp).args(["upgrade-worker", "--plan"]).arg(&plan).assert().success();
    assert!(!temp.path().join("upgrade").join("status.json").exists());
}

#[test]
fn test_worker_with_corrupt_plan_records_failure() -> Result<()> {
    let temp = TempDir::new()?;
    let work_dir = temp.path().join("upgrade");
    std::fs::create_dir_all(&work_dir)?;
    let plan = work_dir.join("plan.json");
    std::fs::write(&plan, "{ not json")?;

    binswap(&temp).args(["upgrade-worker", "--plan"]).arg(&plan).assert().failure();

    binswap(&temp)
        .args(["upgrade-status", "--json", "--work-dir"])
        .arg(&work_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": false"));
    Ok(())
}

#[test]
fn test_status_missing_is_error() {
    let temp = TempDir::new().unwrap();
    binswap(&temp)
        .args(["upgrade-status", "--work-dir"])
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("no upgrade status recorded"));
}

#[test]
fn test_status_reports_recorded_outcome() -> Result<()> {
    let temp = TempDir::new()?;
    write_status(temp.path(), true, "Upgraded /usr/local/bin/edge-agent to v1.4.0")?;

    binswap(&temp)
        .args(["upgrade-status", "--work-dir"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("v1.4.0"));

    binswap(&temp)
        .args(["upgrade-status", "--json", "--work-dir"])
        .arg(temp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": true"))
        .stdout(predicate::str::contains("\"schema_version\": 1"));
    Ok(())
}

#[test]
fn test_explicit_config_must_exist() {
    let temp = TempDir::new().unwrap();
    binswap(&temp)
        .args(["upgrade-status", "--config"])
        .arg(temp.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn test_restart_without_service_is_usage_error() {
    let temp = TempDir::new().unwrap();
    binswap(&temp)
        .args(["upgrade", "--restart-service"])
        .assert()
        .failure()
        .code(2);
}
