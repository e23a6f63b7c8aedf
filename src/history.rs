//! Append-only history of update operations.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::model::SourceType;

/// Records kept before the oldest are trimmed.
const MAX_RECORDS: usize = 500;

/// One immutable log entry; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub software_id: String,
    pub software_name: String,
    pub source_type: SourceType,
    pub old_version: String,
    pub new_version: String,
    pub timestamp: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    records: Vec<UpdateRecord>,
}

pub struct UpdateHistory {
    path: PathBuf,
    records: Vec<UpdateRecord>,
}

impl UpdateHistory {
    pub fn open(path: PathBuf) -> Self {
        let records = if path.exists() {
            fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<HistoryFile>(&content).ok())
                .map(|f| f.records)
                .unwrap_or_else(|| {
                    warn!("failed to load update history at {}", path.display());
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        Self { path, records }
    }

    /// Appends a record and persists, trimming the oldest entries past the
    /// retention cap.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        software_id: &str,
        software_name: &str,
        source_type: SourceType,
        old_version: &str,
        new_version: &str,
        success: bool,
        error_message: Option<String>,
    ) -> &UpdateRecord {
        self.records.push(UpdateRecord {
            software_id: software_id.to_string(),
            software_name: software_name.to_string(),
            source_type,
            old_version: old_version.to_string(),
            new_version: new_version.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            success,
            error_message,
        });
        if self.records.len() > MAX_RECORDS {
            let excess = self.records.len() - MAX_RECORDS;
            self.records.drain(..excess);
        }
        self.persist();
        self.records.last().expect("just pushed")
    }

    /// Most recent records, newest first.
    pub fn recent(&self, count: usize) -> Vec<&UpdateRecord> {
        self.records.iter().rev().take(count).collect()
    }

    pub fn for_software(&self, software_id: &str) -> Vec<&UpdateRecord> {
        self.records
            .iter()
            .filter(|r| r.software_id == software_id)
            .collect()
    }

    pub fn failed(&self) -> Vec<&UpdateRecord> {
        self.records.iter().filter(|r| !r.success).collect()
    }

    fn persist(&self) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = HistoryFile {
                records: self.records.clone(),
            };
            fs::write(&self.path, serde_json::to_string_pretty(&file)?)
        };
        if let Err(e) = write() {
            warn!("failed to save update history: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(dir: &tempfile::TempDir) -> UpdateHistory {
        UpdateHistory::open(dir.path().join("history.json"))
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut h = history(&dir);
            h.add(
                "jackett",
                "Jackett",
                SourceType::Github,
                "0.20.0",
                "0.21.1",
                true,
                None,
            );
        }
        let h = history(&dir);
        let recent = h.recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].new_version, "0.21.1");
        assert!(recent[0].success);
    }

    #[test]
    fn failed_filters_by_success_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = history(&dir);
        h.add("a", "A", SourceType::Flatpak, "1", "2", true, None);
        h.add(
            "b",
            "B",
            SourceType::Snap,
            "1",
            "2",
            false,
            Some("refresh timed out".to_string()),
        );
        assert_eq!(h.failed().len(), 1);
        assert_eq!(h.failed()[0].software_id, "b");
    }

    #[test]
    fn trims_oldest_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = history(&dir);
        for i in 0..(MAX_RECORDS + 10) {
            h.add(
                &format!("pkg{i}"),
                "Pkg",
                SourceType::Apt,
                "1",
                "2",
                true,
                None,
            );
        }
        assert_eq!(h.recent(usize::MAX).len(), MAX_RECORDS);
        // The newest record is still present, the oldest were dropped.
        assert_eq!(h.recent(1)[0].software_id, format!("pkg{}", MAX_RECORDS + 9));
        assert!(h.for_software("pkg0").is_empty());
    }
}
