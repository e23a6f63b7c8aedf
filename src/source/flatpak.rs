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
const REMOTE_TIMEOUT: u64 = 15;
const UPDATE_TIMEOUT: u64 = 300;

/// How long a fetched remote update list stays valid. A single check pass
/// over many apps hits the remote once instead of once per app.
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(crate) struct InstalledApp {
    pub id: String,
    pub name: String,
    pub version: String,
}

struct UpdateCache {
    fetched_at: Instant,
    available: HashMap<String, String>,
}

/// Updates Flatpak applications through the `flatpak` CLI.
///
/// The remote update list is authoritative: an app absent from
/// `flatpak remote-ls --updates` is up to date even when version strings
/// disagree, since Flatpak versions are free-form metadata.
pub struct FlatpakSource {
    cache: Mutex<Option<UpdateCache>>,
}

impl FlatpakSource {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(None),
        }
    }

    pub(crate) async fn installed_apps() -> Result<Vec<InstalledApp>, SourceError> {
        let output = run_command(
            "flatpak",
            &["list", "--app", "--columns=application,version,name"],
            LIST_TIMEOUT,
        )
        .await?;

        let mut apps = Vec::new();
        for line in output.lines() {
            let fields: Vec<&str> = line.split('\t').collect();
            if let [id, version, name, ..] = fields.as_slice() {
                apps.push(InstalledApp {
                    id: id.trim().to_string(),
                    name: name.trim().to_string(),
                    version: version.trim().to_string(),
                });
            }
        }
        Ok(apps)
    }

    /// Returns app ids with pending updates, mapped to the new version
    /// string when the remote advertises one.
    async fn available_updates(&self) -> Result<HashMap<String, String>, SourceError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Ok(entry.available.clone());
            }
        }

        let output = run_command(
            "flatpak",
            &["remote-ls", "--updates", "--app", "--columns=application,version"],
            REMOTE_TIMEOUT,
        )
        .await?;

        let mut available = HashMap::new();
        for line in output.lines() {
            let mut fields = line.split('\t');
            if let Some(id) = fields.next() {
                let version = fields.next().unwrap_or("").trim().to_string();
                available.insert(id.trim().to_string(), version);
            }
        }
        debug!("{} flatpak updates pending", available.len());

        *cache = Some(UpdateCache {
            fetched_at: Instant::now(),
            available: available.clone(),
        });
        Ok(available)
    }
}

#[async_trait]
impl UpdateSource for FlatpakSource {
    fn name(&self) -> &'static str {
        "Flatpak"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Flatpak
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        let apps = Self::installed_apps().await?;
        Ok(apps
            .into_iter()
            .map(|app| {
                let version = if app.version.is_empty() {
                    "unknown".to_string()
                } else {
                    app.version
                };
                SoftwareInfo::new(&app.id, &app.name, version, SourceType::Flatpak)
                    .with_url(format!("https://flathub.org/apps/{}", app.id))
            })
            .collect())
    }

    async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
        match self.available_updates().await {
            Ok(available) => match available.get(&software.id) {
                Some(version) => {
                    software.status = UpdateStatus::UpdateAvailable;
                    software.latest_version = if version.is_empty() {
                        Some("latest".to_string())
                    } else {
                        Some(version.clone())
                    };
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

    // Flatpak fetches its own artifacts during install.
    async fn download(&self, _software: &SoftwareInfo) -> DownloadResult {
        DownloadResult::ok(None)
    }

    async fn install(&self, software: &SoftwareInfo, _download: &DownloadResult) -> InstallResult {
        match run_command("flatpak", &["update", "-y", &software.id], UPDATE_TIMEOUT).await {
            Ok(_) => InstallResult::ok(software.latest_version.clone()),
            Err(e) => InstallResult::failed(e.to_string()),
        }
    }

    async fn uninstall(&self, software: &SoftwareInfo) -> UninstallResult {
        match run_command("flatpak", &["uninstall", "-y", &software.id], UPDATE_TIMEOUT).await {
            Ok(_) => UninstallResult::ok(),
            Err(e) => UninstallResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_from_remote_list_means_up_to_date() {
        let source = FlatpakSource::new();
        {
            let mut cache = source.cache.lock().await;
            *cache = Some(UpdateCache {
                fetched_at: Instant::now(),
                available: HashMap::from([(
                    "org.telegram.desktop".to_string(),
                    "5.0.1".to_string(),
                )]),
            });
        }

        let pending = SoftwareInfo::new(
            "org.telegram.desktop",
            "Telegram",
            "4.9.0",
            SourceType::Flatpak,
        );
        let checked = source.check(pending).await;
        assert_eq!(checked.status, UpdateStatus::UpdateAvailable);
        assert_eq!(checked.latest_version.as_deref(), Some("5.0.1"));

        // Installed version even looks older than some upstream release, but
        // the remote has nothing pending, so it is up to date.
        let current = SoftwareInfo::new("com.spotify.Client", "Spotify", "1.2.0", SourceType::Flatpak);
        let checked = source.check(current).await;
        assert_eq!(checked.status, UpdateStatus::UpToDate);
        assert_eq!(checked.latest_version.as_deref(), Some("1.2.0"));
    }
}
