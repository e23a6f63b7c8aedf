use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::SourceSection;
use crate::detect::dpkg_version;
use crate::error::SourceError;
use crate::model::{
    DownloadResult, InstallResult, SoftwareInfo, SourceType, UninstallResult, UpdateStatus,
};

use super::{run_command, run_privileged, UpdateSource};

const LIST_TIMEOUT: u64 = 30;
const INSTALL_TIMEOUT: u64 = 300;
const CACHE_TTL: Duration = Duration::from_secs(60);

fn upgradable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "nano/noble-updates 7.2-2.1 amd64 [upgradable from: 7.2-2]"
    RE.get_or_init(|| {
        Regex::new(r"^([^/\s]+)/\S+\s+(\S+)\s+\S+\s+\[upgradable from:\s+([^\]]+)\]")
            .expect("static regex")
    })
}

#[derive(Debug, Clone)]
struct Upgradable {
    new_version: String,
    old_version: String,
}

struct AptCache {
    fetched_at: Instant,
    upgradable: HashMap<String, Upgradable>,
}

/// Tracks APT packages. With no explicit package list the whole set of
/// upgradable packages is reported, which is why this source ships
/// disabled by default.
pub struct AptSource {
    section: SourceSection,
    cache: Mutex<Option<AptCache>>,
}

impl AptSource {
    pub fn new(section: SourceSection) -> Self {
        Self {
            section,
            cache: Mutex::new(None),
        }
    }

    /// Runs `apt update` so the upgradable list reflects current mirrors.
    pub async fn refresh_package_list() -> Result<(), SourceError> {
        run_privileged(&["apt", "update"], INSTALL_TIMEOUT).await?;
        Ok(())
    }

    fn parse_upgradable(output: &str) -> HashMap<String, Upgradable> {
        let mut upgradable = HashMap::new();
        for line in output.lines() {
            if let Some(caps) = upgradable_regex().captures(line) {
                upgradable.insert(
                    caps[1].to_string(),
                    Upgradable {
                        new_version: caps[2].to_string(),
                        old_version: caps[3].to_string(),
                    },
                );
            }
        }
        upgradable
    }

    async fn upgradable(&self) -> Result<HashMap<String, Upgradable>, SourceError> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < CACHE_TTL {
                return Ok(entry.upgradable.clone());
            }
        }

        let output = run_command("apt", &["list", "--upgradable"], LIST_TIMEOUT).await?;
        let upgradable = Self::parse_upgradable(&output);
        debug!("{} apt packages upgradable", upgradable.len());

        *cache = Some(AptCache {
            fetched_at: Instant::now(),
            upgradable: upgradable.clone(),
        });
        Ok(upgradable)
    }
}

#[async_trait]
impl UpdateSource for AptSource {
    fn name(&self) -> &'static str {
        "APT"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Apt
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        if !self.section.packages.is_empty() {
            let mut software = Vec::new();
            for spec in &self.section.packages {
                let installed = dpkg_version(&spec.id)
                    .await
                    .unwrap_or_else(|| "not installed".to_string());
                software.push(SoftwareInfo::new(
                    &spec.id,
                    spec.display_name(),
                    installed,
                    SourceType::Apt,
                ));
            }
            return Ok(software);
        }

        let upgradable = self.upgradable().await?;
        Ok(upgradable
            .into_iter()
            .map(|(name, entry)| {
                let mut info =
                    SoftwareInfo::new(&name, &name, entry.old_version, SourceType::Apt);
                info.latest_version = Some(entry.new_version);
                info.status = UpdateStatus::UpdateAvailable;
                info
            })
            .collect())
    }

    async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
        match self.upgradable().await {
            Ok(upgradable) => match upgradable.get(&software.id) {
                Some(entry) => {
                    software.status = UpdateStatus::UpdateAvailable;
                    software.latest_version = Some(entry.new_version.clone());
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
        let result = run_privileged(
            &["apt", "install", "-y", "--only-upgrade", &software.id],
            INSTALL_TIMEOUT,
        )
        .await;
        match result {
            Ok(_) => {
                let new_version = dpkg_version(&software.id).await;
                InstallResult::ok(new_version.or_else(|| software.latest_version.clone()))
            }
            Err(e) => InstallResult::failed(e.to_string()),
        }
    }

    async fn uninstall(&self, software: &SoftwareInfo) -> UninstallResult {
        match run_privileged(&["apt", "remove", "-y", &software.id], INSTALL_TIMEOUT).await {
            Ok(_) => UninstallResult::ok(),
            Err(e) => UninstallResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upgradable_listing() {
        let output = "\
Listing... Done
nano/noble-updates 7.2-2.1 amd64 [upgradable from: 7.2-2]
libssl3t64/noble-security 3.0.13-0ubuntu3.4 amd64 [upgradable from: 3.0.13-0ubuntu3.2]
firefox/noble 131.0+build1 amd64
";
        let upgradable = AptSource::parse_upgradable(output);
        assert_eq!(upgradable.len(), 2);
        let nano = &upgradable["nano"];
        assert_eq!(nano.new_version, "7.2-2.1");
        assert_eq!(nano.old_version, "7.2-2");
        // Lines without the upgradable marker are ignored.
        assert!(!upgradable.contains_key("firefox"));
    }
}
