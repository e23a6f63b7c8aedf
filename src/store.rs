//! Persistent storage for installed versions.
//!
//! Some sources cannot self-report an installed version (tarball installs
//! under `/opt`, portable binaries without a version in the filename). The
//! store records the version omniup last installed, or one the user set
//! manually, and is consulted as last-resort version detection.
//!
//! The store is constructed by the caller and shared by reference with the
//! engine and the sources that need it; there is no process-wide instance.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVersion {
    pub version: String,
    /// How the version was determined: "install", "manual" or "detected".
    pub source: String,
    pub updated_at: String,
}

pub struct VersionStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, StoredVersion>>,
}

impl VersionStore {
    pub fn open(path: PathBuf) -> Self {
        let entries = if path.exists() {
            fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
                .unwrap_or_else(|| {
                    warn!("failed to load version store at {}", path.display());
                    HashMap::new()
                })
        } else {
            HashMap::new()
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, software_id: &str) -> Option<String> {
        let entries = self.entries.lock().expect("version store lock");
        entries
            .get(&software_id.to_lowercase())
            .map(|e| e.version.clone())
    }

    pub fn set(&self, software_id: &str, version: &str, source: &str) {
        let mut entries = self.entries.lock().expect("version store lock");
        entries.insert(
            software_id.to_lowercase(),
            StoredVersion {
                version: version.to_string(),
                source: source.to_string(),
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        self.persist(&entries);
    }

    pub fn remove(&self, software_id: &str) {
        let mut entries = self.entries.lock().expect("version store lock");
        if entries.remove(&software_id.to_lowercase()).is_some() {
            self.persist(&entries);
        }
    }

    pub fn all(&self) -> HashMap<String, String> {
        let entries = self.entries.lock().expect("version store lock");
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.version.clone()))
            .collect()
    }

    fn persist(&self, entries: &HashMap<String, StoredVersion>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(entries)?;
            fs::write(&self.path, json)
        };
        if let Err(e) = write() {
            warn!("failed to save version store: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_are_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("versions.json"));

        store.set("Telegram", "5.9.0", "install");
        assert_eq!(store.get("telegram").as_deref(), Some("5.9.0"));
        assert_eq!(store.get("TELEGRAM").as_deref(), Some("5.9.0"));
        assert!(store.get("other").is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("versions.json");

        VersionStore::open(path.clone()).set("xournalpp", "1.2.3", "manual");

        let reopened = VersionStore::open(path);
        assert_eq!(reopened.get("xournalpp").as_deref(), Some("1.2.3"));
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::open(dir.path().join("versions.json"));
        store.set("joplin", "2.0", "install");
        store.remove("joplin");
        assert!(store.get("joplin").is_none());
    }
}
