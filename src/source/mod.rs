//! Update-source plugins.
//!
//! Each module implements [`UpdateSource`] for one update origin:
//!
//! | Source | Origin | Check mechanism |
//! |--------|--------|-----------------|
//! | [`GithubSource`] | GitHub releases | REST API + asset regex |
//! | [`FlatpakSource`] | Flatpak apps | `flatpak remote-ls --updates` |
//! | [`SnapSource`] | Snap apps | `snap refresh --list` |
//! | [`AptSource`] | Native packages | `apt list --upgradable` |
//! | [`WebSource`] | Scraped web pages | HTTP GET + version regex |
//! | [`JetbrainsSource`] | JetBrains release feed | product-code API |
//!
//! Any network or process failure inside a plugin method is caught at the
//! plugin boundary and surfaced as `UpdateStatus::Error` with a message; it
//! never aborts a batch check.

mod apt;
mod flatpak;
mod github;
mod jetbrains;
mod snap;
mod web;

pub use apt::AptSource;
pub use flatpak::FlatpakSource;
pub use github::GithubSource;
pub use jetbrains::JetbrainsSource;
pub use snap::SnapSource;
pub use web::WebSource;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backup::BackupManager;
use crate::config::Config;
use crate::detect::VersionDetector;
use crate::error::SourceError;
use crate::model::{DownloadResult, InstallResult, SoftwareInfo, SourceType, UninstallResult};
use crate::store::VersionStore;

/// Contract every update source implements.
///
/// `check` takes the item by value and returns it refreshed, so concurrent
/// checks never alias; it must not touch unrelated items.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Human-readable name ("GitHub Releases").
    fn name(&self) -> &'static str;

    /// The source type this plugin claims.
    fn source_type(&self) -> SourceType;

    /// Enumerates the software this source tracks.
    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError>;

    /// Refreshes `latest_version` and `status` for one item.
    async fn check(&self, software: SoftwareInfo) -> SoftwareInfo;

    /// Downloads the update artifact for an item.
    async fn download(&self, software: &SoftwareInfo) -> DownloadResult;

    /// Installs a previously downloaded artifact.
    async fn install(&self, software: &SoftwareInfo, download: &DownloadResult) -> InstallResult;

    /// Full update cycle: download, install, cleanup.
    ///
    /// The downloaded artifact is removed on every path, including install
    /// failure.
    async fn update(&self, software: &SoftwareInfo) -> InstallResult {
        info!("starting update for {}", software.name);

        let download = self.download(software).await;
        if !download.success {
            return InstallResult::failed(format!(
                "Download failed: {}",
                download.error_message.as_deref().unwrap_or("unknown error")
            ));
        }

        let result = self.install(software, &download).await;
        self.cleanup(&download);

        match &result.success {
            true => info!(
                "updated {} to {}",
                software.name,
                result.new_version.as_deref().unwrap_or("latest")
            ),
            false => error!(
                "failed to update {}: {}",
                software.name,
                result.error_message.as_deref().unwrap_or("unknown error")
            ),
        }
        result
    }

    /// Removes a downloaded artifact. Best effort.
    fn cleanup(&self, download: &DownloadResult) {
        if let Some(path) = &download.file_path {
            if path.exists() {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("cleaned up {}", path.display()),
                    Err(e) => warn!("failed to clean up {}: {e}", path.display()),
                }
            }
        }
    }

    /// Uninstalls the software. Sources without native uninstall report
    /// failure instead of pretending.
    async fn uninstall(&self, _software: &SoftwareInfo) -> UninstallResult {
        UninstallResult::failed(
            SourceError::Unsupported("uninstall is not available for this source type".into())
                .to_string(),
        )
    }
}

/// Builds the plugin list for the enabled sections of `config`, in the
/// claiming order used by the engine.
pub fn enabled_sources(
    config: &Config,
    store: Arc<VersionStore>,
    backups: Arc<Mutex<BackupManager>>,
) -> Vec<Box<dyn UpdateSource>> {
    let mut sources: Vec<Box<dyn UpdateSource>> = Vec::new();

    if config.github.enabled {
        let detector = VersionDetector::new(store.clone());
        sources.push(Box::new(GithubSource::new(
            config.github.clone(),
            detector,
            backups,
        )));
    }
    if config.flatpak.enabled {
        sources.push(Box::new(FlatpakSource::new()));
    }
    if config.snap.enabled {
        sources.push(Box::new(SnapSource::new()));
    }
    if config.apt.enabled {
        sources.push(Box::new(AptSource::new(config.apt.clone())));
    }
    if config.web.enabled {
        sources.push(Box::new(WebSource::new(config.web.clone())));
    }
    if config.jetbrains.enabled {
        sources.push(Box::new(JetbrainsSource::new(config.jetbrains.clone())));
    }

    sources
}

/// Runs an external command with a hard deadline.
///
/// Timeouts and spawn failures both map to [`SourceError::Unreachable`];
/// there is no retry, per the engine's failure policy.
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    timeout_secs: u64,
) -> Result<String, SourceError> {
    let future = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output();

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), future)
        .await
        .map_err(|_| {
            SourceError::Unreachable(format!("{program} timed out after {timeout_secs}s"))
        })?
        .map_err(|e| SourceError::Unreachable(format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        return Err(SourceError::Unreachable(if stderr.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            stderr.to_string()
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a command under pkexec, mapping authorization refusal and
/// cancellation to [`SourceError::PermissionDenied`].
pub(crate) async fn run_privileged(args: &[&str], timeout_secs: u64) -> Result<String, SourceError> {
    let future = tokio::process::Command::new("pkexec")
        .args(args)
        .stdin(Stdio::null())
        .output();

    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), future)
        .await
        .map_err(|_| {
            SourceError::Unreachable(format!(
                "pkexec {} timed out after {timeout_secs}s",
                args.first().unwrap_or(&"")
            ))
        })?
        .map_err(|e| SourceError::Unreachable(format!("failed to run pkexec: {e}")))?;

    if !output.status.success() {
        return Err(crate::error::pkexec_failure(
            output.status,
            &String::from_utf8_lossy(&output.stderr),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Shared HTTP client with the crate's user agent.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("omniup/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}
