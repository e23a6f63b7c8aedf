use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::config::{PackageSpec, SourceSection};
use crate::detect::{dpkg_version, VersionDetector};
use crate::error::SourceError;
use crate::model::{DownloadResult, InstallResult, SoftwareInfo, SourceType, UpdateStatus};
use crate::version;

use super::{run_privileged, UpdateSource};

const API_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Updates software from GitHub repository releases.
///
/// Installed versions resolve through dpkg, the configured
/// `installed_version`, then the version-detector chain, defaulting to
/// "unknown" rather than failing. Install dispatches on the downloaded
/// asset's extension: native package, tarball extracted to `/opt`, or
/// AppImage copied to `~/Applications`.
pub struct GithubSource {
    section: SourceSection,
    client: reqwest::Client,
    detector: VersionDetector,
    backups: Arc<Mutex<BackupManager>>,
}

impl GithubSource {
    pub fn new(
        section: SourceSection,
        detector: VersionDetector,
        backups: Arc<Mutex<BackupManager>>,
    ) -> Self {
        Self {
            section,
            client: super::http_client(),
            detector,
            backups,
        }
    }

    fn spec(&self, id: &str) -> Option<&PackageSpec> {
        self.section.packages.iter().find(|p| p.id == id)
    }

    /// Normalizes a repository identifier to `owner/name`, stripping any
    /// full-URL prefix.
    pub(crate) fn normalize_repo(repo: &str) -> String {
        if let Some(idx) = repo.find("github.com/") {
            let tail = &repo[idx + "github.com/".len()..];
            let parts: Vec<&str> = tail.split('/').filter(|s| !s.is_empty()).collect();
            if parts.len() >= 2 {
                return format!("{}/{}", parts[0], parts[1]);
            }
        }
        repo.trim_end_matches('/').to_string()
    }

    async fn fetch_latest_release(&self, repo: &str) -> Result<Release, SourceError> {
        let repo = Self::normalize_repo(repo);
        if repo.split('/').count() < 2 {
            return Err(SourceError::ParseFailure(format!(
                "invalid repository format: {repo}"
            )));
        }

        let url = format!("https://api.github.com/repos/{repo}/releases/latest");
        let mut request = self.client.get(&url).timeout(API_TIMEOUT);
        if let Some(token) = &self.section.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        match response.status().as_u16() {
            403 | 429 => {
                let remaining = response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("?");
                debug!("GitHub rate limit remaining: {remaining}");
                Err(SourceError::RateLimited(format!(
                    "GitHub API rate limit exceeded for {repo}"
                )))
            }
            404 => Err(SourceError::NotFound(format!(
                "repository '{repo}' not found"
            ))),
            s if s >= 400 => Err(SourceError::Unreachable(format!(
                "GitHub API error {s} for {repo}"
            ))),
            _ => response
                .json::<Release>()
                .await
                .map_err(|e| SourceError::ParseFailure(e.to_string())),
        }
    }

    fn find_asset<'r>(
        release: &'r Release,
        pattern: &str,
    ) -> Result<&'r ReleaseAsset, SourceError> {
        let regex = Regex::new(pattern)
            .map_err(|e| SourceError::ParseFailure(format!("invalid asset pattern: {e}")))?;
        release
            .assets
            .iter()
            .find(|a| regex.is_match(&a.name))
            .ok_or_else(|| {
                SourceError::ParseFailure(format!("no release asset matches '{pattern}'"))
            })
    }

    async fn installed_version(&self, spec: &PackageSpec) -> String {
        if let Some(version) = dpkg_version(&spec.id).await {
            return version;
        }
        if let Some(version) = &spec.installed_version {
            return version.clone();
        }
        if let Some(version) = self.detector.detect(&spec.id, spec.name.as_deref()).await {
            return version;
        }
        "unknown".to_string()
    }

    async fn install_native_package(
        &self,
        file_path: &Path,
        software: &SoftwareInfo,
    ) -> InstallResult {
        // Snapshot the current package so a failed upgrade is at least
        // reportable.
        {
            let mut backups = self.backups.lock().await;
            if let Err(e) = backups
                .backup_native_package(&software.id, &software.installed_version)
                .await
            {
                warn!("could not create backup for {}: {e}", software.id);
            }
        }

        match run_privileged(&["dpkg", "-i", &file_path.to_string_lossy()], 120).await {
            Ok(_) => {
                let new_version = dpkg_version(&software.id).await;
                InstallResult::ok(new_version.or_else(|| software.latest_version.clone()))
            }
            Err(e) => InstallResult::failed(e.to_string()),
        }
    }

    async fn install_tarball(&self, file_path: &Path, software: &SoftwareInfo) -> InstallResult {
        let app_name = software.name.replace(' ', "");
        let install_dir = PathBuf::from("/opt").join(&app_name);

        let staging = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => return InstallResult::failed(format!("could not create staging dir: {e}")),
        };

        if let Err(e) = extract_tar_gz(file_path, staging.path()) {
            return InstallResult::failed(format!("tar extraction failed: {e}"));
        }

        // Tarballs usually wrap everything in a single top-level directory.
        let source_dir = match single_subdirectory(staging.path()) {
            Some(dir) => dir,
            None => staging.path().to_path_buf(),
        };

        let script = format!(
            "rm -rf '{0}' && cp -r '{1}' '{0}' && chmod -R 755 '{0}'",
            install_dir.display(),
            source_dir.display()
        );
        match run_privileged(&["bash", "-c", &script], 60).await {
            Ok(_) => {
                if let Err(e) = write_desktop_entry(software, &install_dir) {
                    warn!("failed to create desktop entry for {}: {e}", software.id);
                }
                InstallResult::ok(software.latest_version.clone())
            }
            Err(e) => InstallResult::failed(e.to_string()),
        }
    }

    fn install_appimage(&self, file_path: &Path, software: &SoftwareInfo) -> InstallResult {
        let Some(home) = dirs::home_dir() else {
            return InstallResult::failed("home directory not found");
        };
        let apps_dir = home.join("Applications");
        if let Err(e) = std::fs::create_dir_all(&apps_dir) {
            return InstallResult::failed(format!("could not create {}: {e}", apps_dir.display()));
        }

        let dest = apps_dir.join(format!("{}.AppImage", software.name.replace(' ', "_")));
        if let Err(e) = std::fs::copy(file_path, &dest) {
            return InstallResult::failed(format!("failed to install AppImage: {e}"));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
            {
                return InstallResult::failed(format!("failed to mark executable: {e}"));
            }
        }
        InstallResult::ok(software.latest_version.clone())
    }
}

#[async_trait]
impl UpdateSource for GithubSource {
    fn name(&self) -> &'static str {
        "GitHub Releases"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Github
    }

    async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
        let mut software = Vec::new();
        for spec in &self.section.packages {
            let repo = spec
                .repo
                .as_deref()
                .map(Self::normalize_repo)
                .unwrap_or_default();
            let installed = self.installed_version(spec).await;

            software.push(
                SoftwareInfo::new(&spec.id, spec.display_name(), installed, SourceType::Github)
                    .with_url(format!("https://github.com/{repo}/releases"))
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
        let Some(repo) = spec.repo.as_deref() else {
            software.mark_error("No repository configured");
            return software;
        };

        match self.fetch_latest_release(repo).await {
            Ok(release) => {
                let latest = release.tag_name.trim_start_matches('v').to_string();
                software.status = if version::is_newer(&latest, &software.installed_version) {
                    UpdateStatus::UpdateAvailable
                } else {
                    UpdateStatus::UpToDate
                };
                software.latest_version = Some(latest);
                software.error_message = None;
            }
            Err(e) => software.mark_error(e.to_string()),
        }
        software
    }

    async fn download(&self, software: &SoftwareInfo) -> DownloadResult {
        let Some(spec) = self.spec(&software.id) else {
            return DownloadResult::failed("Package not found in configuration");
        };
        let (Some(repo), Some(pattern)) = (spec.repo.as_deref(), spec.asset_pattern.as_deref())
        else {
            return DownloadResult::failed("Repository or asset pattern not configured");
        };

        let release = match self.fetch_latest_release(repo).await {
            Ok(release) => release,
            Err(e) => return DownloadResult::failed(e.to_string()),
        };
        let asset = match Self::find_asset(&release, pattern) {
            Ok(asset) => asset,
            Err(e) => return DownloadResult::failed(e.to_string()),
        };

        let target = std::env::temp_dir().join(&asset.name);
        info!("downloading {} to {}", asset.browser_download_url, target.display());

        let response = match self
            .client
            .get(&asset.browser_download_url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => response,
            Err(e) => return DownloadResult::failed(format!("Download failed: {e}")),
        };
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return DownloadResult::failed(format!("Download failed: {e}")),
        };
        if let Err(e) = std::fs::write(&target, &bytes) {
            return DownloadResult::failed(format!("Could not write {}: {e}", target.display()));
        }

        let checksum = hex::encode(Sha256::digest(&bytes));
        debug!("downloaded {} sha256={checksum}", asset.name);

        DownloadResult {
            checksum: Some(checksum),
            ..DownloadResult::ok(Some(target))
        }
    }

    async fn install(&self, software: &SoftwareInfo, download: &DownloadResult) -> InstallResult {
        let Some(file_path) = download.file_path.as_deref().filter(|p| p.exists()) else {
            return InstallResult::failed("Download file not found");
        };

        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if filename.ends_with(".deb") {
            self.install_native_package(file_path, software).await
        } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
            self.install_tarball(file_path, software).await
        } else if filename.ends_with(".appimage") {
            self.install_appimage(file_path, software)
        } else {
            InstallResult::failed(format!("Unsupported file format: {filename}"))
        }
    }
}

fn extract_tar_gz(file_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(file_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

fn single_subdirectory(dir: &Path) -> Option<PathBuf> {
    let entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    match entries.as_slice() {
        [only] if only.path().is_dir() => Some(only.path()),
        _ => None,
    }
}

fn write_desktop_entry(software: &SoftwareInfo, install_dir: &Path) -> anyhow::Result<()> {
    // Executables are usually named after the app; try a couple of spellings.
    let candidates = [
        software.name.replace(' ', ""),
        software.name.to_lowercase().replace(' ', ""),
    ];
    let Some(exec_name) = candidates.iter().find(|c| install_dir.join(c).exists()) else {
        return Ok(());
    };

    let Some(home) = dirs::home_dir() else {
        return Ok(());
    };
    let desktop_file = home
        .join(".local/share/applications")
        .join(format!("{}.desktop", software.id));
    std::fs::create_dir_all(desktop_file.parent().expect("has parent"))?;

    let content = format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name={name}\n\
         Exec={dir}/{exec} -- %u\n\
         Icon={id}\n\
         Terminal=false\n\
         StartupWMClass={exec}\n\
         X-AppImage-Version={version}\n",
        name = software.name,
        dir = install_dir.display(),
        exec = exec_name,
        id = software.id,
        version = software.latest_version.as_deref().unwrap_or(""),
    );
    std::fs::write(&desktop_file, content)?;
    info!("created desktop entry at {}", desktop_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_repo_strips_url_prefix() {
        assert_eq!(
            GithubSource::normalize_repo("https://github.com/Jackett/Jackett/releases"),
            "Jackett/Jackett"
        );
        assert_eq!(
            GithubSource::normalize_repo("github.com/owner/name/"),
            "owner/name"
        );
        assert_eq!(GithubSource::normalize_repo("owner/name"), "owner/name");
    }

    #[test]
    fn find_asset_matches_by_pattern() {
        let release = Release {
            tag_name: "v0.21.1".to_string(),
            assets: vec![
                ReleaseAsset {
                    name: "Jackett.Binaries.Windows.zip".to_string(),
                    browser_download_url: "https://example.invalid/win".to_string(),
                },
                ReleaseAsset {
                    name: "Jackett.Binaries.LinuxAMDx64.tar.gz".to_string(),
                    browser_download_url: "https://example.invalid/linux".to_string(),
                },
            ],
        };
        let asset =
            GithubSource::find_asset(&release, r"Jackett\.Binaries\.LinuxAMDx64\.tar\.gz$")
                .unwrap();
        assert_eq!(asset.browser_download_url, "https://example.invalid/linux");

        let err = GithubSource::find_asset(&release, r".*_amd64\.deb$").unwrap_err();
        assert!(matches!(err, SourceError::ParseFailure(_)));
    }

    #[test]
    fn extracted_tarball_round_trips() {
        let work = tempfile::tempdir().unwrap();
        let tarball = work.path().join("app.tar.gz");

        // Build a small archive with one nested file.
        let file = std::fs::File::create(&tarball).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let payload_dir = work.path().join("App");
        std::fs::create_dir_all(&payload_dir).unwrap();
        std::fs::write(payload_dir.join("app.bin"), b"contents").unwrap();
        builder.append_dir_all("App", &payload_dir).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = work.path().join("out");
        extract_tar_gz(&tarball, &dest).unwrap();
        assert_eq!(
            std::fs::read(dest.join("App/app.bin")).unwrap(),
            b"contents"
        );
        assert_eq!(single_subdirectory(&dest).unwrap(), dest.join("App"));
    }
}
