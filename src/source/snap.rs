use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SourceError;
use crate::model::{
    DownloadResult, InstallResult, SoftwareInfo, SourceType, UninstallResult, UpdateStatus,
};

use super::{run_command, UpdateSource};

const LIST_TIMEOUT: u64 = 30;
const REFRESH_LIST_TIMEOUT: u64 = 30;
const REFRESH_TIMEOUT: u64 = 300;
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Runtime snaps that are not user-facing applications.
const SYSTEM_SNAPS: &[&str] = &["core", "core18", "core20", "core22", "core24", "snapd", "bare"];

struct RefreshCache {
    fetched_at: Instant,
    available: HashMap<String, String>,
}

/// Updates Snap packages through the `snap` CLI. `snap refresh --list` is
/// the authority on pending updates, same contract as the Flatpak source.
pub struct SnapSource {
    cache: Mutex<Option<RefreshCache>>,
}

impl SnapSource {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    fn is_system_snap(name: &str) -> bool {
        SYSTEM_SNAPS.contains(&name)
            || name.starts_with("gtk-common-themes")
            || name.starts_with("gnome-")
            || name.starts_with("kde-frameworks")
    }

    async fn pending_refreshes(&self) -> Result<HashMap<String, String>, SourceError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Ok(entry.available.clone());
            }
        }

        // "All snaps up to date." goes to stderr with exit 0, so an empty
        // table here simply means nothing is pending.
        let output = run_command("snap", &["refresh", "--list"], REFRESH_LIST_TIMEOUT).await?;

        let mut available = HashMap::new();
        for line in output.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let [name, version, ..] = fields.as_slice() {
                available.insert(name.to_string(), version.to_string());
            }
        }
        debug!("{} snap refreshes pending", available.len());

        *cache = Some(RefreshCache {
            fetched_at: Instant::now(),
            available: available.clone(),
        });
        Ok(available)
    }
}

#[async_trait]
impl UpdateSource for SnapSource {
    fn name(&self) -> &'static str {
        "Snap"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Snap
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        let output = run_command("snap", &["list"], LIST_TIMEOUT).await?;

        let mut software = Vec::new();
        for line in output.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, version, ..] = fields.as_slice() else {
                continue;
            };
            if Self::is_system_snap(name) {
                continue;
            }
            software.push(
                SoftwareInfo::new(*name, *name, *version, SourceType::Snap)
                    .with_url(format!("https://snapcraft.io/{name}")),
            );
        }
        Ok(software)
    }

    async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
        match self.pending_refreshes().await {
            Ok(available) => match available.get(&software.id) {
                Some(version) => {
                    software.status = UpdateStatus::UpdateAvailable;
                    software.latest_version = Some(version.clone());
                    software.error_message = None;
                }
                None => {
                    software.status = UpdateStatus::UpToDate;
                    software.latest_version = Some(software.installed_version.clone());
                    software.error_message = None;
                }
            },
            Err(e) => software.mark_error(e.to_string()),
        }
        software
    }

    async fn download(&self, _software: &SoftwareInfo) -> DownloadResult {
        DownloadResult::ok(None)
    }

    async fn install(&self, software: &SoftwareInfo, _download: &DownloadResult) -> InstallResult {
        match run_command("snap", &["refresh", &software.id], REFRESH_TIMEOUT).await {
            Ok(_) => InstallResult::ok(software.latest_version.clone()),
            Err(e) => InstallResult::failed(e.to_string()),
        }
    }

    async fn uninstall(&self, software: &SoftwareInfo) -> UninstallResult {
        match run_command("snap", &["remove", &software.id], REFRESH_TIMEOUT).await {
            Ok(_) => UninstallResult::ok(),
            Err(e) => UninstallResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_snaps_are_filtered() {
        assert!(SnapSource::is_system_snap("core22"));
        assert!(SnapSource::is_system_snap("snapd"));
        assert!(SnapSource::is_system_snap("gnome-42-2204"));
        assert!(!SnapSource::is_system_snap("firefox"));
        assert!(!SnapSource::is_system_snap("bitwarden"));
    }

    #[tokio::test]
    async fn pending_refresh_marks_update_available() {
        let source = SnapSource::new();
        {
            let mut cache = source.cache.lock().await;
            *cache = Some(RefreshCache {
                fetched_at: Instant::now(),
                available: HashMap::from([("firefox".to_string(), "131.0-2".to_string())]),
            });
        }

        let checked = source
            .check(SoftwareInfo::new("firefox", "firefox", "130.0", SourceType::Snap))
            .await;
        assert_eq!(checked.status, UpdateStatus::UpdateAvailable);
        assert_eq!(checked.latest_version.as_deref(), Some("131.0-2"));

        let checked = source
            .check(SoftwareInfo::new("vlc", "vlc", "3.0.20", SourceType::Snap))
            .await;
        assert_eq!(checked.status, UpdateStatus::UpToDate);
    }
}
