use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::{PackageSpec, SourceSection};
use crate::error::SourceError;
use crate::model::{DownloadResult, InstallResult, SoftwareInfo, SourceType, UpdateStatus};
use crate::version;

use super::UpdateSource;

const API_URL: &str = "https://data.services.jetbrains.com/products/releases";
const API_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
struct ProductRelease {
    version: String,
    #[serde(default)]
    build: Option<String>,
}

/// Checks JetBrains IDEs against the official releases API. JetBrains
/// own updaters handle installation, so this source is check-only.
pub struct JetbrainsSource {
    section: SourceSection,
    client: reqwest::Client,
}

impl JetbrainsSource {
    pub fn new(section: SourceSection) -> Self {
        Self {
            section,
            client: super::http_client(),
        }
    }

    fn spec(&self, id: &str) -> Option<&PackageSpec> {
        self.section.packages.iter().find(|p| p.id == id)
    }

    async fn fetch_latest(&self, code: &str) -> Result<ProductRelease, SourceError> {
        let response = self
            .client
            .get(API_URL)
            .query(&[("code", code), ("latest", "true"), ("type", "release")])
            .timeout(API_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        // The API keys releases by product code even for single-code queries.
        let releases: HashMap<String, Vec<ProductRelease>> = response
            .json()
            .await
            .map_err(|e| SourceError::ParseFailure(e.to_string()))?;

        releases
            .get(code)
            .and_then(|list| list.first())
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("no releases for product code {code}")))
    }

    /// Reads the installed build number from the IDE's `build.txt`, e.g.
    /// "AI-223.8836.35" for Android Studio.
    fn installed_build(spec: &PackageSpec) -> Option<String> {
        let candidates = [
            PathBuf::from("/opt").join(&spec.id).join("build.txt"),
            dirs::home_dir()?.join(format!(".local/share/{}/build.txt", spec.id)),
        ];
        candidates
            .iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn installed_version(&self, spec: &PackageSpec) -> String {
        if let Some(build) = Self::installed_build(spec) {
            return build;
        }
        if let Some(version) = &spec.installed_version {
            return version.clone();
        }
        "unknown".to_string()
    }
}

#[async_trait]
impl UpdateSource for JetbrainsSource {
    fn name(&self) -> &'static str {
        "JetBrains"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Jetbrains
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        let mut software = Vec::new();
        for spec in &self.section.packages {
            let installed = self.installed_version(spec);
            software.push(
                SoftwareInfo::new(&spec.id, spec.display_name(), installed, SourceType::Jetbrains)
                    .with_url("https://www.jetbrains.com".to_string())
                    .with_description(spec.description.clone()),
            );
        }
        Ok(software)
    }

    async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
        let Some(spec) = self.spec(&software.id) else {
            software.mark_error("Package not found in configuration");
            return software;
        };
        let Some(code) = spec.product_code.as_deref() else {
            software.mark_error("No product code configured");
            return software;
        };

        match self.fetch_latest(code).await {
            Ok(release) => {
                // Marketing versions like "2022.3.1" recycle across
                // channels; the build number is the reliable ordering when
                // both sides carry one.
                let newer = match (&release.build, software.installed_version.contains('.')) {
                    (Some(build), true) if looks_like_build(&software.installed_version) => {
                        debug!(
                            "comparing builds {build} vs {}",
                            software.installed_version
                        );
                        version::compare_builds(build, &software.installed_version)
                            == std::cmp::Ordering::Greater
                    }
                    _ => version::is_newer(&release.version, &software.installed_version),
                };
                software.status = if newer {
                    UpdateStatus::UpdateAvailable
                } else {
                    UpdateStatus::UpToDate
                };
                software.latest_version = Some(release.version);
                software.error_message = None;
            }
            Err(e) => software.mark_error(e.to_string()),
        }
        software
    }

    async fn download(&self, _software: &SoftwareInfo) -> DownloadResult {
        DownloadResult::failed(
            SourceError::Unsupported("JetBrains products update through their own tooling".into())
                .to_string(),
        )
    }

    async fn install(&self, software: &SoftwareInfo, _download: &DownloadResult) -> InstallResult {
        InstallResult::failed(toolbox_update_error(&software.name).to_string())
    }

    async fn update(&self, software: &SoftwareInfo) -> InstallResult {
        InstallResult::failed(toolbox_update_error(&software.name).to_string())
    }
}

fn toolbox_update_error(name: &str) -> SourceError {
    SourceError::Unsupported(format!(
        "{name} updates through JetBrains Toolbox or its built-in updater"
    ))
}

/// Build identifiers are a short branch number followed by a long build
/// counter, optionally behind a product prefix: "223.8836.35" or
/// "AI-223.8836.35". Marketing versions like "2022.3.1" share the dotted
/// numeric shape but not the segment widths.
fn looks_like_build(s: &str) -> bool {
    let numeric = s.rsplit('-').next().unwrap_or(s);
    let parts: Vec<&str> = numeric.split('.').collect();
    if parts.len() < 2
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }
    parts[0].len() <= 3 && parts[1].len() >= 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_identifiers_are_recognized() {
        assert!(looks_like_build("223.8836.35"));
        assert!(looks_like_build("AI-223.8836.35"));
        assert!(!looks_like_build("2022.3.1-beta"));
        assert!(!looks_like_build("unknown"));
    }

    #[test]
    fn marketing_versions_compare_as_versions_not_builds() {
        // A configured "2022.3.1" must not be weighed against the feed's
        // build number, where 2022 would dwarf the branch segment.
        assert!(!looks_like_build("2022.3.1"));
        assert!(!looks_like_build("2023.1"));
        assert!(version::is_newer("2023.1", "2022.3.1"));
    }

    #[test]
    fn release_payload_parses() {
        let body = r#"{"AI": [{"version": "2022.3.1", "build": "223.8836.35",
                     "type": "release"}]}"#;
        let releases: HashMap<String, Vec<ProductRelease>> =
            serde_json::from_str(body).unwrap();
        let release = releases["AI"].first().unwrap();
        assert_eq!(release.version, "2022.3.1");
        assert_eq!(release.build.as_deref(), Some("223.8836.35"));
    }
}
