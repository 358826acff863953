use crate::{Host, OLD_BINARY};
use anyhow::Result;
use binswap_cli::core::UpgradeError;
use binswap_cli::test_utils::{FakeFetcher, binaries};
use binswap_cli::upgrade::fetch::HttpFetcher;
use binswap_cli::upgrade::paths::{backup_path, stage_path};
use binswap_cli::upgrade::{UpgradeOptions, read_upgrade_status};
use binswap_cli::utils::platform::{Arch, Os, Platform};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A non-Linux, non-Windows host replaces the binary in-process and keeps a backup.
#[tokio::test]
async fn test_direct_upgrade_with_backup() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::MacOs, Arch::Aarch64);
    let payload = binaries::for_platform(&platform);
    let fetcher = Arc::new(FakeFetcher::new(payload.clone()));
    let upgrader = host.upgrader(platform, fetcher.clone());

    let outcome = upgrader
        .start_upgrade(&UpgradeOptions {
            backup: true,
            ..host.options()
        })
        .await?;

    assert!(!outcome.dispatched);
    assert!(outcome.plan_path.is_none());
    assert_eq!(std::fs::read(&host.target)?, payload);
    assert_eq!(std::fs::read(backup_path(&host.target))?, OLD_BINARY);
    assert!(!stage_path(&host.target).exists());

    assert_eq!(
        fetcher.requested_urls(),
        vec!["https://github.com/binswap/binswap/releases/download/v1.4.0/binswap-darwin-arm64"]
    );
    assert!(host.services.calls().is_empty());

    // Only workers record a status.
    let err = read_upgrade_status(&host.work_dir).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::StatusNotFound { .. })
    ));
    Ok(())
}

/// The service is bounced after a direct replacement on FreeBSD.
#[tokio::test]
async fn test_direct_upgrade_restarts_service() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::FreeBsd, Arch::X86_64);
    let payload = binaries::for_platform(&platform);
    let upgrader = host.upgrader(platform, Arc::new(FakeFetcher::new(payload.clone())));

    let outcome = upgrader.start_upgrade(&host.with_service()).await?;

    assert!(!outcome.dispatched);
    assert_eq!(std::fs::read(&host.target)?, payload);
    assert!(!backup_path(&host.target).exists());
    assert_eq!(host.services.calls(), vec!["stop edge-agent", "start edge-agent"]);
    Ok(())
}

/// A release built for another CPU never reaches the target.
#[tokio::test]
async fn test_foreign_architecture_is_rejected() -> Result<()> {
    let host = Host::new();
    let upgrader = host.upgrader(
        Platform::new(Os::FreeBsd, Arch::X86_64),
        Arc::new(FakeFetcher::new(binaries::elf_for(&Arch::Aarch64))),
    );

    let err = upgrader.start_upgrade(&host.options()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::VerificationFailed { .. })
    ));
    assert_eq!(std::fs::read(&host.target)?, OLD_BINARY);
    assert!(!stage_path(&host.target).exists());

    // The lock was released, so a corrected attempt goes through.
    let retry = host.upgrader(
        Platform::new(Os::FreeBsd, Arch::X86_64),
        Arc::new(FakeFetcher::new(binaries::elf_for(&Arch::X86_64))),
    );
    assert!(!retry.start_upgrade(&host.options()).await?.dispatched);
    Ok(())
}

/// Download failures surface as typed errors and leave the target alone.
#[tokio::test]
async fn test_download_failure_keeps_target() -> Result<()> {
    let host = Host::new();
    let upgrader =
        host.upgrader(Platform::new(Os::MacOs, Arch::X86_64), Arc::new(FakeFetcher::failing()));

    let err = upgrader.start_upgrade(&host.options()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::DownloadFailed { .. })
    ));
    assert_eq!(std::fs::read(&host.target)?, OLD_BINARY);
    Ok(())
}

/// Linux without a service replaces in-process, like any other Unix host.
#[tokio::test]
async fn test_linux_without_service_replaces_directly() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Linux, Arch::X86_64);
    let payload = binaries::for_platform(&platform);
    let upgrader = host.upgrader(platform, Arc::new(FakeFetcher::new(payload.clone())));

    let outcome = upgrader
        .start_upgrade(&UpgradeOptions {
            backup: true,
            ..host.options()
        })
        .await?;

    assert!(!outcome.dispatched);
    assert_eq!(std::fs::read(&host.target)?, payload);
    assert_eq!(std::fs::read(backup_path(&host.target))?, OLD_BINARY);
    assert!(host.services.calls().is_empty());
    assert!(host.launcher.launches().is_empty());
    Ok(())
}

/// Naming a service without asking for a restart does not dispatch on Linux.
#[tokio::test]
async fn test_linux_service_without_restart_replaces_directly() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Linux, Arch::Aarch64);
    let payload = binaries::for_platform(&platform);
    let upgrader = host.upgrader(platform, Arc::new(FakeFetcher::new(payload.clone())));

    let outcome = upgrader
        .start_upgrade(&UpgradeOptions {
            backup: true,
            restart_service: false,
            ..host.with_service()
        })
        .await?;

    assert!(!outcome.dispatched);
    assert_eq!(outcome.service_name.as_deref(), Some("edge-agent"));
    assert_eq!(std::fs::read(&host.target)?, payload);
    assert_eq!(std::fs::read(backup_path(&host.target))?, OLD_BINARY);
    assert!(host.services.calls().is_empty());
    Ok(())
}

/// The default fetcher downloads over HTTP and leaves nothing in its download directory.
#[tokio::test]
async fn test_linux_upgrade_over_http() -> Result<()> {
    let host = Host::new();
    let platform = Platform::new(Os::Linux, Arch::X86_64);
    let payload = binaries::for_platform(&platform);
    let downloads = tempfile::TempDir::new()?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let body = payload.clone();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let upgrader = host
        .upgrader(platform, Arc::new(FakeFetcher::new(Vec::new())))
        .with_fetcher(Arc::new(HttpFetcher::with_dir(downloads.path().to_path_buf())));
    let outcome = upgrader
        .start_upgrade(&UpgradeOptions {
            download_url: Some(format!("http://{addr}/edge-agent")),
            ..host.options()
        })
        .await?;
    server.await?;

    assert!(!outcome.dispatched);
    assert_eq!(std::fs::read(&host.target)?, payload);
    assert_eq!(std::fs::read_dir(downloads.path())?.count(), 0);
    Ok(())
}
