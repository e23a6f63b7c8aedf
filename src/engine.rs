use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backup::BackupManager;
use crate::config::{Config, PackageSpec};
use crate::history::UpdateHistory;
use crate::model::{InstallResult, SoftwareInfo, SourceType, UninstallResult};
use crate::platform;
use crate::source::{enabled_sources, UpdateSource};
use crate::store::VersionStore;

/// How many update checks run at once. Wide enough to overlap network
/// latency, narrow enough to stay under API rate limits.
const CHECK_WIDTH: usize = 4;

/// Owns the plugin list and the persistent state files, and coordinates
/// checking and installing across all sources.
pub struct UpdateEngine {
    sources: Vec<Box<dyn UpdateSource>>,
    config: Config,
    config_path: PathBuf,
    history: UpdateHistory,
    store: Arc<VersionStore>,
    backups: Arc<Mutex<BackupManager>>,
}

impl UpdateEngine {
    pub fn new() -> Self {
        Self::with_paths(
            platform::config_file(),
            platform::history_file(),
            platform::version_store_file(),
            platform::backup_dir(),
        )
    }

    pub fn with_paths(
        config_path: PathBuf,
        history_path: PathBuf,
        store_path: PathBuf,
        backup_dir: PathBuf,
    ) -> Self {
        let config = Config::load_from(&config_path);
        let store = Arc::new(VersionStore::open(store_path));
        let backups = Arc::new(Mutex::new(BackupManager::open(backup_dir)));
        let sources = enabled_sources(&config, store.clone(), backups.clone());

        Self {
            sources,
            config,
            config_path,
            history: UpdateHistory::open(history_path),
            store,
            backups,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn history(&self) -> &UpdateHistory {
        &self.history
    }

    pub fn store(&self) -> Arc<VersionStore> {
        self.store.clone()
    }

    pub fn backups(&self) -> Arc<Mutex<BackupManager>> {
        self.backups.clone()
    }

    fn source_for(&self, ty: SourceType) -> Option<&dyn UpdateSource> {
        self.sources
            .iter()
            .find(|s| s.source_type() == ty)
            .map(|s| s.as_ref())
    }

    /// Everything the enabled sources track, paired with the index of the
    /// source that claimed each item. Ignored entries are dropped here so
    /// no later stage sees them.
    async fn tracked_with_sources(&self) -> Vec<(usize, SoftwareInfo)> {
        let mut items = Vec::new();
        for (idx, source) in self.sources.iter().enumerate() {
            match source.tracked().await {
                Ok(tracked) => {
                    items.extend(
                        tracked
                            .into_iter()
                            .filter(|s| !self.config.is_ignored(&s.id))
                            .map(|s| (idx, s)),
                    );
                }
                Err(e) => warn!("could not enumerate {} software: {e}", source.name()),
            }
        }
        items
    }

    pub async fn tracked_software(&self) -> Vec<SoftwareInfo> {
        self.tracked_with_sources()
            .await
            .into_iter()
            .map(|(_, s)| s)
            .collect()
    }

    /// Checks every tracked item for updates. Always returns one result
    /// per tracked item: a failed check comes back with `Error` status
    /// rather than disappearing from the list.
    pub async fn check_all(&self, parallel: bool) -> Vec<SoftwareInfo> {
        let items = self.tracked_with_sources().await;
        info!("checking {} tracked items", items.len());

        if parallel {
            stream::iter(items)
                .map(|(idx, item)| {
                    let source = &self.sources[idx];
                    async move { source.check(item).await }
                })
                .buffer_unordered(CHECK_WIDTH)
                .collect()
                .await
        } else {
            let mut checked = Vec::new();
            for (idx, item) in items {
                checked.push(self.sources[idx].check(item).await);
            }
            checked
        }
    }

    pub async fn updates_available(&self, parallel: bool) -> Vec<SoftwareInfo> {
        self.check_all(parallel)
            .await
            .into_iter()
            .filter(|s| s.has_update())
            .collect()
    }

    /// Runs the full update cycle for one item and records the outcome.
    ///
    /// Callers must not run two installs for the same id concurrently;
    /// nothing here serializes package-manager access.
    pub async fn install_update(&mut self, software: &SoftwareInfo) -> InstallResult {
        let Some(source) = self.source_for(software.source_type) else {
            return InstallResult::failed(format!(
                "no enabled source handles {}",
                software.source_type
            ));
        };

        let result = source.update(software).await;

        let new_version = result
            .new_version
            .clone()
            .or_else(|| software.latest_version.clone())
            .unwrap_or_else(|| "unknown".to_string());
        self.history.add(
            &software.id,
            &software.name,
            software.source_type,
            &software.installed_version,
            &new_version,
            result.success,
            result.error_message.clone(),
        );

        if result.success {
            self.store
                .set(&software.id, &new_version, software.source_type.as_str());
            self.persist_installed_version(software, &new_version);
        }
        result
    }

    /// Applies every pending update one at a time. Package managers do not
    /// tolerate concurrent invocations, so there is no parallel variant.
    pub async fn install_all(&mut self) -> Vec<(SoftwareInfo, InstallResult)> {
        let pending = self.updates_available(true).await;
        let mut results = Vec::with_capacity(pending.len());
        for software in pending {
            let result = self.install_update(&software).await;
            results.push((software, result));
        }
        results
    }

    pub async fn uninstall_software(&mut self, software: &SoftwareInfo) -> UninstallResult {
        let Some(source) = self.source_for(software.source_type) else {
            return UninstallResult::failed(format!(
                "no enabled source handles {}",
                software.source_type
            ));
        };
        let result = source.uninstall(software).await;
        if result.success {
            self.store.remove(&software.id);
        }
        result
    }

    /// Adds or amends a tracked package, normalizing unwieldy ids and
    /// deduplicating against existing entries case-insensitively.
    /// Returns the id the package is stored under.
    pub fn add_package(&mut self, ty: SourceType, mut spec: PackageSpec) -> Result<String> {
        spec.id = normalize_package_id(&spec);
        let id = spec.id.clone();

        let section = self
            .config
            .section_mut(ty)
            .ok_or_else(|| anyhow!("packages cannot be added to source '{ty}'"))?;

        let existing = section.packages.iter_mut().find(|p| {
            p.id.eq_ignore_ascii_case(&spec.id)
                || matches!(
                    (&p.repo, &spec.repo),
                    (Some(a), Some(b)) if a.eq_ignore_ascii_case(b)
                )
        });
        match existing {
            Some(current) => {
                info!("merging {id} into existing entry {}", current.id);
                current.merge_from(&spec);
            }
            None => section.packages.push(spec),
        }

        self.config.save_to(&self.config_path)?;
        self.rebuild_sources();
        Ok(id)
    }

    /// Drops a tracked package from the configuration again, matching the
    /// id case-insensitively. A no-op when the id is not tracked.
    pub fn remove_package(&mut self, ty: SourceType, id: &str) -> Result<()> {
        let Some(section) = self.config.section_mut(ty) else {
            return Ok(());
        };
        let before = section.packages.len();
        section.packages.retain(|p| !p.id.eq_ignore_ascii_case(id));
        if section.packages.len() != before {
            self.config.save_to(&self.config_path)?;
            self.rebuild_sources();
        }
        Ok(())
    }

    pub fn ignore_package(&mut self, id: &str) -> Result<()> {
        if !self.config.is_ignored(id) {
            self.config.ignored.push(id.to_string());
            self.config.save_to(&self.config_path)?;
        }
        Ok(())
    }

    fn persist_installed_version(&mut self, software: &SoftwareInfo, new_version: &str) {
        let Some(section) = self.config.section_mut(software.source_type) else {
            return;
        };
        let Some(spec) = section
            .packages
            .iter_mut()
            .find(|p| p.id.eq_ignore_ascii_case(&software.id))
        else {
            return;
        };
        spec.installed_version = Some(new_version.to_string());
        if let Err(e) = self.config.save_to(&self.config_path) {
            warn!("could not persist installed version: {e}");
        }
    }

    fn rebuild_sources(&mut self) {
        self.sources = enabled_sources(&self.config, self.store.clone(), self.backups.clone());
    }

    #[cfg(test)]
    fn set_sources(&mut self, sources: Vec<Box<dyn UpdateSource>>) {
        self.sources = sources;
    }
}

/// Reverse-DNS ids like "com.github.someuser.some-very-long-project" make
/// terrible CLI handles; prefer the repository tail or the name.
fn normalize_package_id(spec: &PackageSpec) -> String {
    let ugly = spec.id.contains('.') && spec.id.len() > 30;
    if !ugly && !spec.id.is_empty() {
        return spec.id.clone();
    }

    if let Some(repo) = &spec.repo {
        if let Some(tail) = repo.rsplit('/').next().filter(|t| !t.is_empty()) {
            return tail.to_lowercase();
        }
    }
    if let Some(name) = &spec.name {
        return name.to_lowercase().replace(' ', "-");
    }
    spec.id.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::model::{DownloadResult, UpdateStatus};
    use async_trait::async_trait;

    struct FlakySource {
        ty: SourceType,
        items: Vec<SoftwareInfo>,
        fail_check: bool,
        install_version: Option<String>,
    }

    #[async_trait]
    impl UpdateSource for FlakySource {
        fn name(&self) -> &'static str {
            "test"
        }

        fn source_type(&self) -> SourceType {
            self.ty
        }

        async fn tracked(&self) -> Result<Vec<SoftwareInfo>, SourceError> {
            Ok(self.items.clone())
        }

        async fn check(&self, mut software: SoftwareInfo) -> SoftwareInfo {
            if self.fail_check {
                software.mark_error("simulated outage");
            } else {
                software.status = UpdateStatus::UpdateAvailable;
                software.latest_version = Some("9.0.0".to_string());
            }
            software
        }

        async fn download(&self, _software: &SoftwareInfo) -> DownloadResult {
            DownloadResult::ok(None)
        }

        async fn install(
            &self,
            _software: &SoftwareInfo,
            _download: &DownloadResult,
        ) -> InstallResult {
            match &self.install_version {
                Some(v) => InstallResult::ok(Some(v.clone())),
                None => InstallResult::failed("simulated install failure"),
            }
        }
    }

    fn test_engine(dir: &std::path::Path) -> UpdateEngine {
        UpdateEngine::with_paths(
            dir.join("config.json"),
            dir.join("history.json"),
            dir.join("versions.json"),
            dir.join("backups"),
        )
    }

    fn items(ty: SourceType, n: usize) -> Vec<SoftwareInfo> {
        (0..n)
            .map(|i| SoftwareInfo::new(format!("app-{i}"), format!("App {i}"), "1.0.0", ty))
            .collect()
    }

    #[tokio::test]
    async fn failing_source_yields_error_results_not_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        engine.set_sources(vec![
            Box::new(FlakySource {
                ty: SourceType::Github,
                items: items(SourceType::Github, 3),
                fail_check: true,
                install_version: None,
            }),
            Box::new(FlakySource {
                ty: SourceType::Snap,
                items: items(SourceType::Snap, 2),
                fail_check: false,
                install_version: None,
            }),
        ]);

        let checked = engine.check_all(true).await;
        assert_eq!(checked.len(), 5);
        let errors = checked
            .iter()
            .filter(|s| s.status == UpdateStatus::Error)
            .count();
        assert_eq!(errors, 3);
        assert!(checked
            .iter()
            .filter(|s| s.status == UpdateStatus::Error)
            .all(|s| s.error_message.as_deref() == Some("simulated outage")));
    }

    #[tokio::test]
    async fn install_outcome_lands_in_history_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        engine.set_sources(vec![Box::new(FlakySource {
            ty: SourceType::Github,
            items: Vec::new(),
            fail_check: false,
            install_version: Some("2.0.0".to_string()),
        })]);

        let mut software =
            SoftwareInfo::new("jackett", "Jackett", "1.0.0", SourceType::Github);
        software.latest_version = Some("2.0.0".to_string());
        software.status = UpdateStatus::UpdateAvailable;

        let result = engine.install_update(&software).await;
        assert!(result.success);
        assert_eq!(engine.store.get("jackett").as_deref(), Some("2.0.0"));

        let records = engine.history().for_software("jackett");
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].new_version, "2.0.0");
    }

    #[tokio::test]
    async fn persisted_version_matches_package_ids_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        engine.config.github.packages = vec![PackageSpec {
            id: "Jackett".to_string(),
            ..Default::default()
        }];
        engine.set_sources(vec![Box::new(FlakySource {
            ty: SourceType::Github,
            items: Vec::new(),
            fail_check: false,
            install_version: Some("2.0.0".to_string()),
        })]);

        let software = SoftwareInfo::new("jackett", "Jackett", "1.0.0", SourceType::Github);
        let result = engine.install_update(&software).await;
        assert!(result.success);
        assert_eq!(
            engine.config.github.packages[0].installed_version.as_deref(),
            Some("2.0.0")
        );
    }

    #[tokio::test]
    async fn failed_install_is_recorded_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        engine.set_sources(vec![Box::new(FlakySource {
            ty: SourceType::Github,
            items: Vec::new(),
            fail_check: false,
            install_version: None,
        })]);

        let software = SoftwareInfo::new("jackett", "Jackett", "1.0.0", SourceType::Github);
        let result = engine.install_update(&software).await;
        assert!(!result.success);
        assert!(engine.store.get("jackett").is_none());

        let failed = engine.history().failed();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn add_package_merges_same_repo_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());

        let before = engine.config.github.packages.len();
        engine
            .add_package(
                SourceType::Github,
                PackageSpec {
                    id: "myapp".to_string(),
                    repo: Some("Owner/MyApp".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        engine
            .add_package(
                SourceType::Github,
                PackageSpec {
                    id: "my-app".to_string(),
                    repo: Some("owner/myapp".to_string()),
                    asset_pattern: Some(r".*\.AppImage$".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(engine.config.github.packages.len(), before + 1);
        let spec = engine
            .config
            .github
            .packages
            .iter()
            .find(|p| p.repo.as_deref() == Some("owner/myapp"))
            .unwrap();
        assert_eq!(spec.asset_pattern.as_deref(), Some(r".*\.AppImage$"));
    }

    #[tokio::test]
    async fn removed_package_is_no_longer_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let before = engine.config.github.packages.len();

        engine
            .add_package(
                SourceType::Github,
                PackageSpec {
                    id: "myapp".to_string(),
                    repo: Some("owner/myapp".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        engine.remove_package(SourceType::Github, "MyApp").unwrap();

        assert_eq!(engine.config.github.packages.len(), before);
        assert!(!engine
            .config
            .github
            .packages
            .iter()
            .any(|p| p.id.eq_ignore_ascii_case("myapp")));
    }

    #[test]
    fn reverse_dns_ids_are_rewritten() {
        let spec = PackageSpec {
            id: "com.github.someuser.averylongprojectname".to_string(),
            repo: Some("someuser/AVeryLongProjectName".to_string()),
            ..Default::default()
        };
        assert_eq!(normalize_package_id(&spec), "averylongprojectname");

        let short = PackageSpec {
            id: "org.gnome.Boxes".to_string(),
            ..Default::default()
        };
        assert_eq!(normalize_package_id(&short), "org.gnome.Boxes");
    }
}
