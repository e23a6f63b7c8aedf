//! Snapshot-before-install backups with rollback.
//!
//! Backups live under one directory, one subtree per backup id, with a JSON
//! index mapping backup id to [`BackupRecord`]. The index is append-only:
//! entries are pruned by age and per-software retention count, never mutated.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{info, warn};

use crate::model::SourceType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub software_id: String,
    pub software_name: String,
    pub version: String,
    pub backup_path: String,
    pub created_at: String,
    pub source_type: SourceType,
    /// Where the backed-up artifact originally lived. Absent for native
    /// package backups, which record metadata only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    /// Whether the original artifact was a directory. Indexes written before
    /// this field existed lack it; restore then inspects the backup tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_is_dir: Option<bool>,
}

pub struct BackupManager {
    dir: PathBuf,
    index_path: PathBuf,
    backups: HashMap<String, BackupRecord>,
}

impl BackupManager {
    pub fn open(dir: PathBuf) -> Self {
        let index_path = dir.join("index.json");
        let backups = if index_path.exists() {
            fs::read_to_string(&index_path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
                .unwrap_or_else(|| {
                    warn!("failed to load backup index at {}", index_path.display());
                    HashMap::new()
                })
        } else {
            HashMap::new()
        };
        Self {
            dir,
            index_path,
            backups,
        }
    }

    fn new_backup_id(software_id: &str, version: &str) -> String {
        format!(
            "{}_{}_{}",
            software_id,
            version,
            Utc::now().format("%Y%m%d_%H%M%S")
        )
    }

    /// Records a native package's owned file list and metadata before an
    /// upgrade. The file contents are not copied, so a later rollback can
    /// only report what was affected.
    pub async fn backup_native_package(
        &mut self,
        package_id: &str,
        version: &str,
    ) -> Result<BackupRecord> {
        let files = run_dpkg(&["-L", package_id])
            .await
            .with_context(|| format!("package {package_id} not found in dpkg"))?;

        let backup_id = Self::new_backup_id(package_id, version);
        let backup_path = self.dir.join(&backup_id);
        fs::create_dir_all(&backup_path)?;
        fs::write(backup_path.join("files.txt"), &files)?;

        if let Ok(status) = run_dpkg(&["-s", package_id]).await {
            fs::write(backup_path.join("package_info.txt"), status)?;
        }

        let record = BackupRecord {
            software_id: package_id.to_string(),
            software_name: package_id.to_string(),
            version: version.to_string(),
            backup_path: backup_path.to_string_lossy().into_owned(),
            created_at: Utc::now().to_rfc3339(),
            source_type: SourceType::Dpkg,
            original_path: None,
            original_is_dir: None,
        };
        info!("created package backup for {package_id} v{version}");
        self.insert(backup_id, record.clone());
        Ok(record)
    }

    /// Copies a file or directory tree into the backup area and indexes it.
    pub fn backup_path(
        &mut self,
        source_path: &Path,
        software_id: &str,
        software_name: &str,
        version: &str,
        source_type: SourceType,
    ) -> Result<BackupRecord> {
        if !source_path.exists() {
            bail!("source path does not exist: {}", source_path.display());
        }

        let backup_id = Self::new_backup_id(software_id, version);
        let backup_path = self.dir.join(&backup_id);
        let is_dir = source_path.is_dir();

        if is_dir {
            copy_tree(source_path, &backup_path)?;
        } else {
            fs::create_dir_all(&backup_path)?;
            let file_name = source_path
                .file_name()
                .ok_or_else(|| anyhow!("source path has no file name"))?;
            fs::copy(source_path, backup_path.join(file_name))?;
        }

        let record = BackupRecord {
            software_id: software_id.to_string(),
            software_name: software_name.to_string(),
            version: version.to_string(),
            backup_path: backup_path.to_string_lossy().into_owned(),
            created_at: Utc::now().to_rfc3339(),
            source_type,
            original_path: Some(source_path.to_string_lossy().into_owned()),
            original_is_dir: Some(is_dir),
        };
        info!("created backup for {software_name} v{version}");
        self.insert(backup_id, record.clone());
        Ok(record)
    }

    /// Replaces the artifact at the backup's original path with the backed-up
    /// contents, for both single-file and directory-tree backups.
    pub fn restore(&self, backup_id: &str) -> Result<()> {
        let record = self
            .backups
            .get(backup_id)
            .ok_or_else(|| anyhow!("backup not found: {backup_id}"))?;
        let backup_path = Path::new(&record.backup_path);
        if !backup_path.exists() {
            bail!("backup contents missing: {}", record.backup_path);
        }

        let Some(original) = record.original_path.as_deref().map(Path::new) else {
            // Reinstalling an old native package would need the old archive
            // or the apt cache; failing loudly beats pretending.
            bail!("native package rollback is not implemented");
        };

        if original.exists() {
            if original.is_dir() {
                fs::remove_dir_all(original)?;
            } else {
                fs::remove_file(original)?;
            }
        }

        let restore_as_dir = match record.original_is_dir {
            Some(is_dir) => is_dir,
            // Index entries written before the flag existed.
            None => {
                let contents: Vec<_> =
                    fs::read_dir(backup_path)?.collect::<std::io::Result<_>>()?;
                !(contents.len() == 1 && contents[0].path().is_file())
            }
        };

        if restore_as_dir {
            copy_tree(backup_path, original)?;
        } else {
            let entry = fs::read_dir(backup_path)?
                .next()
                .ok_or_else(|| anyhow!("backup tree is empty: {}", record.backup_path))??;
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), original)?;
        }

        info!("restored {} v{}", record.software_name, record.version);
        Ok(())
    }

    pub fn list(&self, software_id: Option<&str>) -> Vec<(&str, &BackupRecord)> {
        let mut records: Vec<_> = self
            .backups
            .iter()
            .filter(|(_, r)| software_id.is_none_or(|id| r.software_id == id))
            .map(|(id, r)| (id.as_str(), r))
            .collect();
        records.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        records
    }

    /// Deletes backups older than `max_age_days`, then trims each software's
    /// remaining backups down to `max_per_software`, newest kept.
    pub fn cleanup_old_backups(&mut self, max_per_software: usize, max_age_days: i64) {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let mut by_software: HashMap<String, Vec<(String, DateTime<Utc>)>> = HashMap::new();

        for (backup_id, record) in self.backups.clone() {
            let created = DateTime::parse_from_rfc3339(&record.created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            if created < cutoff {
                info!("removing aged backup {backup_id}");
                self.delete(&backup_id);
                continue;
            }
            by_software
                .entry(record.software_id.clone())
                .or_default()
                .push((backup_id, created));
        }

        for (_, mut entries) in by_software {
            if entries.len() <= max_per_software {
                continue;
            }
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            for (backup_id, _) in entries.split_off(max_per_software) {
                info!("removing excess backup {backup_id}");
                self.delete(&backup_id);
            }
        }

        self.persist();
    }

    fn insert(&mut self, backup_id: String, record: BackupRecord) {
        self.backups.insert(backup_id, record);
        self.persist();
    }

    fn delete(&mut self, backup_id: &str) {
        if let Some(record) = self.backups.remove(backup_id) {
            let path = Path::new(&record.backup_path);
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(path) {
                    warn!("failed to delete backup tree {}: {e}", record.backup_path);
                }
            }
        }
    }

    fn persist(&self) {
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.dir)?;
            fs::write(&self.index_path, serde_json::to_string_pretty(&self.backups)?)
        };
        if let Err(e) = write() {
            warn!("failed to save backup index: {e}");
        }
    }
}

async fn run_dpkg(args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new("dpkg")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run dpkg")?;
    if !output.status.success() {
        bail!("dpkg {} failed", args.join(" "));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backup_round_trips_byte_for_byte() {
        let work = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());

        let original = work.path().join("app.AppImage");
        fs::write(&original, b"binary-contents-v1").unwrap();

        mgr.backup_path(&original, "app", "App", "1.0", SourceType::Github)
            .unwrap();
        let backup_id = mgr.list(Some("app"))[0].0.to_string();

        fs::remove_file(&original).unwrap();
        mgr.restore(&backup_id).unwrap();

        assert_eq!(fs::read(&original).unwrap(), b"binary-contents-v1");
    }

    #[test]
    fn directory_backup_round_trips() {
        let work = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());

        let original = work.path().join("telegram");
        fs::create_dir_all(original.join("nested")).unwrap();
        fs::write(original.join("Telegram"), b"elf").unwrap();
        fs::write(original.join("nested/data.bin"), b"payload").unwrap();

        mgr.backup_path(&original, "telegram", "Telegram", "5.9.0", SourceType::Github)
            .unwrap();
        let backup_id = mgr.list(Some("telegram"))[0].0.to_string();

        fs::remove_dir_all(&original).unwrap();
        mgr.restore(&backup_id).unwrap();

        assert_eq!(fs::read(original.join("Telegram")).unwrap(), b"elf");
        assert_eq!(fs::read(original.join("nested/data.bin")).unwrap(), b"payload");
    }

    #[test]
    fn single_file_directory_restores_as_directory() {
        let work = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());

        let original = work.path().join("appdir");
        fs::create_dir_all(&original).unwrap();
        fs::write(original.join("app.bin"), b"elf").unwrap();

        mgr.backup_path(&original, "appdir", "AppDir", "1.0", SourceType::Github)
            .unwrap();
        let backup_id = mgr.list(Some("appdir"))[0].0.to_string();

        fs::remove_dir_all(&original).unwrap();
        mgr.restore(&backup_id).unwrap();

        assert!(original.is_dir());
        assert_eq!(fs::read(original.join("app.bin")).unwrap(), b"elf");
    }

    #[test]
    fn cleanup_keeps_newest_per_software() {
        let work = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());

        let artifact = work.path().join("tool");
        fs::write(&artifact, b"x").unwrap();

        // Same software backed up three times with distinct ids.
        for (i, version) in ["1.0", "1.1", "1.2"].iter().enumerate() {
            let record = mgr
                .backup_path(&artifact, "tool", "Tool", version, SourceType::Github)
                .unwrap();
            // Force distinguishable, ordered timestamps.
            let id = mgr
                .backups
                .iter()
                .find(|(_, r)| r.created_at == record.created_at && r.version == *version)
                .map(|(id, _)| id.clone())
                .unwrap();
            mgr.backups.get_mut(&id).unwrap().created_at =
                (Utc::now() - Duration::minutes(10 - i as i64)).to_rfc3339();
        }

        mgr.cleanup_old_backups(1, 30);
        let remaining = mgr.list(Some("tool"));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.version, "1.2");
    }

    #[test]
    fn age_based_cleanup_removes_old_backups() {
        let work = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());

        let artifact = work.path().join("tool");
        fs::write(&artifact, b"x").unwrap();
        mgr.backup_path(&artifact, "tool", "Tool", "1.0", SourceType::Github)
            .unwrap();
        let id = mgr.list(Some("tool"))[0].0.to_string();
        mgr.backups.get_mut(&id).unwrap().created_at =
            (Utc::now() - Duration::days(90)).to_rfc3339();

        mgr.cleanup_old_backups(5, 30);
        assert!(mgr.list(Some("tool")).is_empty());
    }

    #[test]
    fn restoring_native_package_backup_reports_failure() {
        let backups = tempfile::tempdir().unwrap();
        let mut mgr = BackupManager::open(backups.path().to_path_buf());
        let backup_path = backups.path().join("pkg_1.0_x");
        fs::create_dir_all(&backup_path).unwrap();
        mgr.insert(
            "pkg_1.0_x".to_string(),
            BackupRecord {
                software_id: "pkg".to_string(),
                software_name: "pkg".to_string(),
                version: "1.0".to_string(),
                backup_path: backup_path.to_string_lossy().into_owned(),
                created_at: Utc::now().to_rfc3339(),
                source_type: SourceType::Dpkg,
                original_path: None,
                original_is_dir: None,
            },
        );
        let err = mgr.restore("pkg_1.0_x").unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }
}
