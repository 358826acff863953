//! Download URL resolution, fetching, and staging next to the target.
//!
//! The fetch itself is delegated to a [`Fetcher`]; [`HttpFetcher`] is the
//! default. Whatever file the fetcher hands back is then *copied* (never
//! moved) to `<target>.new` by [`stage`], so the staged artifact always sits
//! on the target's filesystem and the later replacement is a plain rename.

use crate::constants::{
    DEFAULT_ASSET_PREFIX, DEFAULT_LATEST_URL_TEMPLATE, DEFAULT_RELEASE_URL_TEMPLATE,
    LATEST_VERSION,
};
use crate::core::UpgradeError;
use crate::upgrade::options::UpgradeOptions;
use crate::upgrade::paths::stage_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const DOWNLOAD_FILE_PREFIX: &str = "binswap-download-";

/// Where releases are published.
///
/// Templates use `{version}` and `{asset}` placeholders. This is also the
/// `[release]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseSource {
    /// Template for a pinned release
    pub url_template: String,
    /// Template for the latest release
    pub latest_url_template: String,
    /// Asset name prefix, e.g. `binswap` in `binswap-linux-amd64`
    pub asset_prefix: String,
    /// Mirror prefix used when the options ask for a mirror but name none
    pub mirror_url: Option<String>,
}

impl Default for ReleaseSource {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_RELEASE_URL_TEMPLATE.to_string(),
            latest_url_template: DEFAULT_LATEST_URL_TEMPLATE.to_string(),
            asset_prefix: DEFAULT_ASSET_PREFIX.to_string(),
            mirror_url: None,
        }
    }
}

/// Normalize a requested version into a release tag.
///
/// `None` means "latest". Semver-looking versions gain a `v` prefix; anything
/// else is used as-is.
#[must_use]
pub fn normalize_version(version: &str) -> Option<String> {
    let version = version.trim();
    if version.is_empty() || version.eq_ignore_ascii_case(LATEST_VERSION) {
        return None;
    }

    let bare = version.strip_prefix('v').unwrap_or(version);
    if semver::Version::parse(bare).is_ok() {
        Some(format!("v{bare}"))
    } else {
        Some(version.to_string())
    }
}

/// Build the URL the new binary is downloaded from.
///
/// An explicit `download_url` wins verbatim. Otherwise the release template is
/// rendered and, when `use_mirror` is set and a mirror is known, prefixed as
/// `{mirror}/{upstream}`.
#[must_use]
pub fn build_download_url(options: &UpgradeOptions, release: &ReleaseSource, asset: &str) -> String {
    if let Some(url) = options.download_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        return url.to_string();
    }

    let upstream = match normalize_version(&options.version) {
        Some(tag) => release.url_template.replace("{version}", &tag).replace("{asset}", asset),
        None => release.latest_url_template.replace("{asset}", asset),
    };

    if !options.use_mirror {
        return upstream;
    }

    let mirror = options
        .mirror_url
        .as_deref()
        .or(release.mirror_url.as_deref())
        .map(|m| m.trim().trim_end_matches('/'))
        .filter(|m| !m.is_empty());

    match mirror {
        Some(mirror) => format!("{mirror}/{upstream}"),
        None => upstream,
    }
}

/// Retrieves a release artifact to a local file.
///
/// The returned [`TempPath`] deletes the file when dropped, so a download
/// never outlives the attempt that asked for it.
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, optionally through `http_proxy`, returning the local file.
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        http_proxy: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<TempPath>> + Send + 'a>>;
}

/// Downloads over HTTP(S) with `reqwest`, into the OS temp directory.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    download_dir: PathBuf,
}

impl HttpFetcher {
    /// Download into `std::env::temp_dir()`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dir(std::env::temp_dir())
    }

    /// Download into a specific directory.
    #[must_use]
    pub const fn with_dir(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
        }
    }

    async fn download(&self, url: &str, http_proxy: Option<&str>) -> Result<TempPath> {
        let failed = |reason: String| UpgradeError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
        if let Some(proxy) = http_proxy.map(str::trim).filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| failed(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| failed(e.to_string()))?;

        debug!(url, proxy = http_proxy.unwrap_or(""), "Downloading release asset");
        let mut response = client.get(url).send().await.map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")).into());
        }

        tokio::fs::create_dir_all(&self.download_dir).await.with_context(|| {
            format!("Failed to create download directory: {}", self.download_dir.display())
        })?;
        let (file, path) = tempfile::Builder::new()
            .prefix(DOWNLOAD_FILE_PREFIX)
            .tempfile_in(&self.download_dir)
            .with_context(|| {
                format!("Failed to create download file in {}", self.download_dir.display())
            })?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed(e.to_string()))? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write download file: {}", path.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(url, bytes = written, path = %path.display(), "Downloaded release asset");
        Ok(path)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        http_proxy: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<TempPath>> + Send + 'a>> {
        Box::pin(self.download(url, http_proxy))
    }
}

/// Copy a fetched artifact to `<target>.new` and make it executable.
///
/// Any stale staged file from an earlier attempt is removed first. The copy
/// is fsynced before returning.
///
/// # Errors
///
/// Returns [`UpgradeError::StageFailed`] if any step fails.
pub async fn stage(fetched: &Path, target: &Path) -> Result<PathBuf> {
    let staged = stage_path(target);
    let failed = |step: &str, e: std::io::Error| UpgradeError::StageFailed {
        path: staged.display().to_string(),
        reason: format!("{step}: {e}"),
    };

    match tokio::fs::remove_file(&staged).await {
        Ok(()) => debug!(path = %staged.display(), "Removed stale staged file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(failed("remove stale staged file", e).into()),
    }

    tokio::fs::copy(fetched, &staged).await.map_err(|e| failed("copy", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| failed("set permissions", e))?;
    }

    // Flushing needs a writable handle on Windows.
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&staged)
        .await
        .map_err(|e| failed("open", e))?;
    file.sync_all().await.map_err(|e| failed("sync", e))?;

    debug!(from = %fetched.display(), to = %staged.display(), "Staged new binary");
    Ok(staged)
}
