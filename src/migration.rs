//! Flatpak-to-native migration advisor.
//!
//! Suggests native builds for installed Flatpak apps by resolving each app
//! id to an upstream GitHub repository and looking up its latest release.
//! Release lookups degrade gracefully: a fresh cache entry is served
//! first, then a live API call, then a stale cache entry, and finally a
//! static version table, so advice survives rate limiting and offline use.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::model::{InstallResult, SoftwareInfo};
use crate::platform;
use crate::source::run_command;
use crate::version;

const CACHE_TTL_SECS: i64 = 3600;
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Flatpak app ids with a known upstream repository. `None` marks apps
/// confirmed to have no native GitHub-released build, which stops the
/// pattern guesser from fabricating one.
static KNOWN_MAPPINGS: &[(&str, Option<&str>)] = &[
    ("org.telegram.desktop", Some("telegramdesktop/tdesktop")),
    ("md.obsidian.Obsidian", Some("obsidianmd/obsidian-releases")),
    ("com.obsproject.Studio", Some("obsproject/obs-studio")),
    ("org.signal.Signal", Some("signalapp/Signal-Desktop")),
    ("net.ankiweb.Anki", Some("ankitects/anki")),
    ("org.flameshot.Flameshot", Some("flameshot-org/flameshot")),
    ("com.bitwarden.desktop", Some("bitwarden/clients")),
    ("org.localsend.localsend_app", Some("localsend/localsend")),
    ("net.lutris.Lutris", Some("lutris/lutris")),
    ("io.freetubeapp.FreeTube", Some("FreeTubeApp/FreeTube")),
    ("com.spotify.Client", None),
    ("com.discordapp.Discord", None),
    ("com.slack.Slack", None),
    ("us.zoom.Zoom", None),
];

/// Last-resort versions for when both the API and the cache are empty.
/// These go stale by design; is_newer is advisory anyway.
static STATIC_VERSIONS: &[(&str, &str)] = &[
    ("telegramdesktop/tdesktop", "5.8.5"),
    ("obsidianmd/obsidian-releases", "1.8.9"),
    ("obsproject/obs-studio", "31.0.2"),
    ("signalapp/Signal-Desktop", "7.48.0"),
    ("flameshot-org/flameshot", "12.1.0"),
];

#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub version: String,
}

/// Seam for release lookups so the fallback chain is testable without
/// network access.
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    async fn fetch_latest(&self, repo: &str) -> Result<ReleaseInfo, SourceError>;
}

pub struct GithubReleaseFetcher {
    client: reqwest::Client,
}

impl GithubReleaseFetcher {
    pub fn new() -> Self {
        Self {
            client: crate::source::http_client(),
        }
    }
}

impl Default for GithubReleaseFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseFetcher for GithubReleaseFetcher {
    async fn fetch_latest(&self, repo: &str) -> Result<ReleaseInfo, SourceError> {
        #[derive(Deserialize)]
        struct Release {
            tag_name: String,
        }

        let url = format!("https://api.github.com/repos/{repo}/releases/latest");
        let response = self
            .client
            .get(&url)
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        match response.status().as_u16() {
            403 | 429 => Err(SourceError::RateLimited(format!(
                "GitHub API rate limit exceeded for {repo}"
            ))),
            404 => Err(SourceError::NotFound(format!("repository '{repo}' not found"))),
            s if s >= 400 => Err(SourceError::Unreachable(format!("GitHub API error {s}"))),
            _ => {
                let release: Release = response
                    .json()
                    .await
                    .map_err(|e| SourceError::ParseFailure(e.to_string()))?;
                Ok(ReleaseInfo {
                    version: release.tag_name.trim_start_matches('v').to_string(),
                })
            }
        }
    }
}

/// A Flatpak app with a plausible native replacement.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationCandidate {
    pub flatpak_id: String,
    pub flatpak_name: String,
    pub flatpak_version: String,
    pub repo: String,
    pub native_version: String,
    /// Whether the native release looks newer. Advisory only; a candidate
    /// is offered either way since leaving the sandbox may be the point.
    pub is_newer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRelease {
    version: String,
    fetched_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: HashMap<String, CachedRelease>,
}

pub struct MigrationAdvisor {
    fetcher: Box<dyn ReleaseFetcher>,
    cache_path: PathBuf,
    cache: Mutex<CacheFile>,
    flatpak_data_root: PathBuf,
}

impl MigrationAdvisor {
    pub fn new(fetcher: Box<dyn ReleaseFetcher>) -> Self {
        let data_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/root"))
            .join(".var/app");
        Self::with_paths(fetcher, platform::migration_cache_file(), data_root)
    }

    pub fn with_paths(
        fetcher: Box<dyn ReleaseFetcher>,
        cache_path: PathBuf,
        flatpak_data_root: PathBuf,
    ) -> Self {
        let cache = std::fs::read_to_string(&cache_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self {
            fetcher,
            cache_path,
            cache: Mutex::new(cache),
            flatpak_data_root,
        }
    }

    /// Maps a Flatpak app id to an upstream repository: the known table
    /// first, then the reverse-DNS GitHub id patterns.
    pub fn resolve_repo(flatpak_id: &str) -> Option<String> {
        if let Some((_, repo)) = KNOWN_MAPPINGS.iter().find(|(id, _)| *id == flatpak_id) {
            return repo.map(str::to_string);
        }

        for prefix in ["com.github.", "io.github."] {
            if let Some(rest) = flatpak_id.strip_prefix(prefix) {
                let parts: Vec<&str> = rest.splitn(2, '.').collect();
                if let [user, repo] = parts.as_slice() {
                    return Some(format!("{user}/{repo}"));
                }
            }
        }
        None
    }

    fn cached(&self, repo: &str) -> Option<(String, bool)> {
        let cache = self.cache.lock().expect("cache lock");
        cache.entries.get(repo).map(|entry| {
            let fresh = Utc::now().timestamp() - entry.fetched_at < CACHE_TTL_SECS;
            (entry.version.clone(), fresh)
        })
    }

    fn remember(&self, repo: &str, version: &str) {
        let mut cache = self.cache.lock().expect("cache lock");
        cache.entries.insert(
            repo.to_string(),
            CachedRelease {
                version: version.to_string(),
                fetched_at: Utc::now().timestamp(),
            },
        );
        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*cache) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.cache_path, json) {
                    warn!("could not persist migration cache: {e}");
                }
            }
            Err(e) => warn!("could not serialize migration cache: {e}"),
        }
    }

    /// Latest release for a repository, through the fallback chain:
    /// fresh cache, live API, stale cache, static table.
    pub async fn latest_release(&self, repo: &str) -> Result<String, SourceError> {
        if let Some((version, true)) = self.cached(repo) {
            return Ok(version);
        }

        match self.fetcher.fetch_latest(repo).await {
            Ok(release) => {
                self.remember(repo, &release.version);
                Ok(release.version)
            }
            Err(e) => {
                if let Some((version, _)) = self.cached(repo) {
                    debug!("live lookup for {repo} failed ({e}), serving stale cache");
                    return Ok(version);
                }
                if let Some((_, version)) =
                    STATIC_VERSIONS.iter().find(|(r, _)| *r == repo)
                {
                    debug!("live lookup for {repo} failed ({e}), serving static version");
                    return Ok(version.to_string());
                }
                Err(e)
            }
        }
    }

    /// Builds migration candidates for the given Flatpak apps. Apps with
    /// no resolvable repository are skipped silently.
    pub async fn find_alternatives(&self, apps: &[SoftwareInfo]) -> Vec<MigrationCandidate> {
        let mut candidates = Vec::new();
        for app in apps {
            let Some(repo) = Self::resolve_repo(&app.id) else {
                continue;
            };
            match self.latest_release(&repo).await {
                Ok(native_version) => {
                    let is_newer = app.installed_version == "unknown"
                        || version::is_newer(&native_version, &app.installed_version);
                    candidates.push(MigrationCandidate {
                        flatpak_id: app.id.clone(),
                        flatpak_name: app.name.clone(),
                        flatpak_version: app.installed_version.clone(),
                        repo,
                        native_version,
                        is_newer,
                    });
                }
                Err(e) => warn!("no release information for {repo}: {e}"),
            }
        }
        candidates
    }

    /// Replaces a Flatpak app with its native build.
    ///
    /// The app's sandbox data is backed up before anything runs. If the
    /// installer fails the backup is discarded and the Flatpak remains
    /// untouched. On success the sandboxed config and data are copied into
    /// the native XDG locations best-effort, then the Flatpak is removed.
    pub async fn migrate<F, Fut>(
        &self,
        candidate: &MigrationCandidate,
        install: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InstallResult>,
    {
        let app_data = self.flatpak_data_root.join(&candidate.flatpak_id);
        let staging = tempfile::tempdir().context("could not create staging directory")?;
        let backup = staging.path().join("data");

        if app_data.exists() {
            copy_tree(&app_data, &backup)
                .with_context(|| format!("could not back up {}", app_data.display()))?;
            info!("backed up {} sandbox data", candidate.flatpak_id);
        }

        let result = install().await;
        if !result.success {
            // TempDir drop discards the backup; the Flatpak was never touched.
            bail!(
                "native install failed, {} left as-is: {}",
                candidate.flatpak_name,
                result
                    .error_message
                    .as_deref()
                    .unwrap_or("unknown error")
            );
        }

        if backup.exists() {
            self.restore_user_data(&backup);
        }

        match run_command(
            "flatpak",
            &["uninstall", "-y", &candidate.flatpak_id],
            300,
        )
        .await
        {
            Ok(_) => info!("removed Flatpak {}", candidate.flatpak_id),
            Err(e) => warn!(
                "native install succeeded but Flatpak removal failed: {e}; \
                 remove {} manually",
                candidate.flatpak_id
            ),
        }
        Ok(())
    }

    /// Copies sandboxed `config/` and `data/` into the native XDG dirs.
    /// Failures are logged, not fatal; the native app starts fresh where a
    /// copy did not land.
    fn restore_user_data(&self, backup: &Path) {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let targets = [
            (backup.join("config"), home.join(".config")),
            (backup.join("data"), home.join(".local/share")),
        ];
        for (src, dst) in targets {
            if !src.is_dir() {
                continue;
            }
            if let Err(e) = copy_tree(&src, &dst) {
                warn!("could not restore {} to {}: {e}", src.display(), dst.display());
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedFetcher {
        responses: Mutex<Vec<Result<ReleaseInfo, SourceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<ReleaseInfo, SourceError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReleaseFetcher for ScriptedFetcher {
        async fn fetch_latest(&self, _repo: &str) -> Result<ReleaseInfo, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(SourceError::Unreachable("exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn advisor(fetcher: ScriptedFetcher, dir: &Path) -> MigrationAdvisor {
        MigrationAdvisor::with_paths(
            Box::new(fetcher),
            dir.join("cache.json"),
            dir.join("var-app"),
        )
    }

    #[test]
    fn repo_resolution_uses_table_then_patterns() {
        assert_eq!(
            MigrationAdvisor::resolve_repo("org.telegram.desktop").as_deref(),
            Some("telegramdesktop/tdesktop")
        );
        // Known to have no native release; the pattern guess must not fire.
        assert_eq!(MigrationAdvisor::resolve_repo("com.spotify.Client"), None);
        assert_eq!(
            MigrationAdvisor::resolve_repo("com.github.someuser.sometool").as_deref(),
            Some("someuser/sometool")
        );
        assert_eq!(MigrationAdvisor::resolve_repo("org.gnome.Boxes"), None);
    }

    #[tokio::test]
    async fn rate_limited_lookup_falls_back_to_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            Ok(ReleaseInfo {
                version: "5.0.0".to_string(),
            }),
            Err(SourceError::RateLimited("limit".to_string())),
        ]);
        let advisor = advisor(fetcher, dir.path());

        // First lookup populates the cache.
        assert_eq!(
            advisor.latest_release("telegramdesktop/tdesktop").await.unwrap(),
            "5.0.0"
        );

        // Expire the entry so the next lookup goes live, fails, and lands
        // on the stale cached value.
        {
            let mut cache = advisor.cache.lock().unwrap();
            cache
                .entries
                .get_mut("telegramdesktop/tdesktop")
                .unwrap()
                .fetched_at -= CACHE_TTL_SECS + 10;
        }
        assert_eq!(
            advisor.latest_release("telegramdesktop/tdesktop").await.unwrap(),
            "5.0.0"
        );
    }

    #[tokio::test]
    async fn empty_cache_falls_back_to_static_table() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher =
            ScriptedFetcher::new(vec![Err(SourceError::Unreachable("offline".to_string()))]);
        let advisor = advisor(fetcher, dir.path());

        let version = advisor
            .latest_release("obsproject/obs-studio")
            .await
            .unwrap();
        assert_eq!(version, "31.0.2");

        // A repo in neither cache nor static table surfaces the error.
        assert!(advisor.latest_release("nobody/nothing").await.is_err());
    }

    struct SharedFetcher(std::sync::Arc<ScriptedFetcher>);

    #[async_trait]
    impl ReleaseFetcher for SharedFetcher {
        async fn fetch_latest(&self, repo: &str) -> Result<ReleaseInfo, SourceError> {
            self.0.fetch_latest(repo).await
        }
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_network() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = std::sync::Arc::new(ScriptedFetcher::new(vec![Ok(ReleaseInfo {
            version: "1.0.0".to_string(),
        })]));
        let advisor = MigrationAdvisor::with_paths(
            Box::new(SharedFetcher(scripted.clone())),
            dir.path().join("cache.json"),
            dir.path().join("var-app"),
        );

        advisor.latest_release("lutris/lutris").await.unwrap();
        advisor.latest_release("lutris/lutris").await.unwrap();
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_install_leaves_flatpak_data_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(Vec::new());
        let advisor = advisor(fetcher, dir.path());

        let app_data = dir.path().join("var-app/org.telegram.desktop");
        std::fs::create_dir_all(app_data.join("config")).unwrap();
        std::fs::write(app_data.join("config/settings.ini"), b"key=value").unwrap();

        let candidate = MigrationCandidate {
            flatpak_id: "org.telegram.desktop".to_string(),
            flatpak_name: "Telegram".to_string(),
            flatpak_version: "4.9.0".to_string(),
            repo: "telegramdesktop/tdesktop".to_string(),
            native_version: "5.0.0".to_string(),
            is_newer: true,
        };
        let result = advisor
            .migrate(&candidate, || async {
                InstallResult::failed("download failed")
            })
            .await;

        assert!(result.is_err());
        assert_eq!(
            std::fs::read(app_data.join("config/settings.ini")).unwrap(),
            b"key=value"
        );
    }

    #[tokio::test]
    async fn candidates_are_offered_even_when_not_newer() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![Ok(ReleaseInfo {
            version: "4.0.0".to_string(),
        })]);
        let advisor = advisor(fetcher, dir.path());

        let apps = vec![SoftwareInfo::new(
            "org.telegram.desktop",
            "Telegram",
            "5.1.0",
            SourceType::Flatpak,
        )];
        let candidates = advisor.find_alternatives(&apps).await;
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].is_newer);
    }
}
