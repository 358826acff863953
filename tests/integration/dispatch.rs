use crate::{Host, OLD_BINARY};
use anyhow::Result;
use binswap_cli::core::UpgradeError;
use binswap_cli::test_utils::{FakeFetcher, binaries};
use binswap_cli::upgrade::paths::{backup_path, displaced_path, stage_path};
use binswap_cli::upgrade::plan::{plan_path, read_plan};
use binswap_cli::upgrade::{ServiceAction, UpgradeOptions, read_upgrade_status};
use binswap_cli::utils::platform::{Arch, Os, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn worker_args(plan: &Path) -> Vec<String> {
    vec!["upgrade-worker".to_string(), "--plan".to_string(), plan.display().to_string()]
}

/// Linux with a service restart: plan + upgrader unit now, swap when the unit runs the worker.
#[tokio::test]
async fn test_linux_upgrader_service_round_trip() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Linux, Arch::X86_64);
    let payload = binaries::for_platform(&platform);
    let upgrader = host.upgrader(platform, Arc::new(FakeFetcher::new(payload.clone())));
    let options = UpgradeOptions {
        backup: true,
        ..host.with_service()
    };

    let outcome = upgrader.start_upgrade(&options).await?;

    assert!(outcome.dispatched);
    assert_eq!(outcome.service_name.as_deref(), Some("edge-agent-upgrader"));
    let plan = outcome.plan_path.clone().unwrap();
    assert_eq!(plan, plan_path(&host.work_dir));
    assert_eq!(std::fs::read(&host.target)?, OLD_BINARY);
    assert_eq!(std::fs::read(stage_path(&host.target))?, payload);
    assert_eq!(
        host.services.calls(),
        vec![
            "uninstall edge-agent-upgrader",
            "install edge-agent-upgrader",
            "start edge-agent-upgrader"
        ]
    );

    let install = host
        .services
        .requests()
        .into_iter()
        .find(|r| r.action == ServiceAction::Install)
        .unwrap();
    let unit = install.options.unwrap();
    assert_eq!(unit.executable, PathBuf::from("/opt/edge/bin/binswap"));
    assert_eq!(unit.arguments, worker_args(&plan));
    assert!(unit.unit_template.unwrap().contains(&plan.display().to_string()));

    let recorded = read_plan(&plan)?;
    assert_eq!(recorded.options.version, "1.4.0");
    assert!(recorded.options.target_path.is_some());
    assert_eq!(recorded.requesting_pid, std::process::id());

    // What the upgrader unit does once started.
    upgrader.run_worker(&plan).await?;

    assert_eq!(std::fs::read(&host.target)?, payload);
    assert_eq!(std::fs::read(backup_path(&host.target))?, OLD_BINARY);
    assert!(!plan.exists());
    assert_eq!(host.services.calls()[3..].to_vec(), vec!["stop edge-agent", "start edge-agent"]);

    let status = read_upgrade_status(&host.work_dir)?;
    assert!(status.success, "{}", status.message);
    assert!(status.message.contains("1.4.0"));

    // The unit may fire again, e.g. after a reboot; without a plan it does nothing.
    upgrader.run_worker(&plan).await?;
    assert_eq!(host.services.calls().len(), 5);
    assert_eq!(read_upgrade_status(&host.work_dir)?, status);
    Ok(())
}

/// Windows: detached worker retries the swap and displaces the old binary.
#[tokio::test]
async fn test_windows_worker_round_trip() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Windows, Arch::X86_64);
    let payload = binaries::for_platform(&platform);
    let upgrader = host.upgrader(platform, Arc::new(FakeFetcher::new(payload.clone())));

    let outcome = upgrader.start_upgrade(&host.options()).await?;

    assert!(outcome.dispatched);
    let plan = outcome.plan_path.clone().unwrap();
    let launches = host.launcher.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].0, PathBuf::from("/opt/edge/bin/binswap"));
    assert_eq!(launches[0].1, worker_args(&plan));
    assert_eq!(std::fs::read(&host.target)?, OLD_BINARY);
    assert!(host.services.calls().is_empty());

    upgrader.run_worker(&plan).await?;

    assert_eq!(std::fs::read(&host.target)?, payload);
    assert!(!backup_path(&host.target).exists());
    assert!(!displaced_path(&host.target).exists());
    assert!(!stage_path(&host.target).exists());
    assert!(read_upgrade_status(&host.work_dir)?.success);
    Ok(())
}

/// A staged binary tampered with after dispatch fails the worker, which records why.
#[tokio::test]
async fn test_worker_rejects_tampered_staged_binary() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Linux, Arch::Aarch64);
    let upgrader =
        host.upgrader(platform.clone(), Arc::new(FakeFetcher::new(binaries::for_platform(&platform))));

    let outcome = upgrader.start_upgrade(&host.with_service()).await?;
    let plan = outcome.plan_path.unwrap();
    std::fs::write(stage_path(&host.target), b"#!/bin/sh\necho pwned\n")?;

    let err = upgrader.run_worker(&plan).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::VerificationFailed { .. })
    ));
    assert_eq!(std::fs::read(&host.target)?, OLD_BINARY);
    assert!(plan.exists());

    let status = read_upgrade_status(&host.work_dir)?;
    assert!(!status.success);
    assert!(!status.message.is_empty());
    Ok(())
}

/// A dispatched plan blocks nothing: the lock is free for the next attempt.
#[tokio::test]
async fn test_new_attempt_overwrites_pending_plan() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Windows, Arch::Aarch64);
    let upgrader =
        host.upgrader(platform.clone(), Arc::new(FakeFetcher::new(binaries::for_platform(&platform))));

    upgrader.start_upgrade(&host.options()).await?;
    let second = upgrader
        .start_upgrade(&UpgradeOptions {
            version: "1.5.0".to_string(),
            ..host.options()
        })
        .await?;

    let plan = read_plan(&second.plan_path.unwrap())?;
    assert_eq!(plan.options.version, "1.5.0");
    assert_eq!(host.launcher.launches().len(), 2);
    Ok(())
}
