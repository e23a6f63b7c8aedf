//! Persisted configuration handling.
//!
//! The configuration is a JSON document keyed by source type, each section
//! carrying an `enabled` flag and a `packages` list, plus a top-level
//! `ignored` id list and scanner source overrides:
//!
//! ```json
//! {
//!   "github": {
//!     "enabled": true,
//!     "packages": [
//!       {"id": "jackett", "name": "Jackett", "repo": "Jackett/Jackett",
//!        "asset_pattern": "Jackett\\.Binaries\\.LinuxAMDx64\\.tar\\.gz$"}
//!     ]
//!   },
//!   "ignored": []
//! }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::model::SourceType;

/// One tracked package inside a source section.
///
/// Which fields are meaningful depends on the source: `repo` and
/// `asset_pattern` for GitHub, `url` and `version_pattern` for web scraping,
/// `product_code` for JetBrains. `installed_version` is written back by the
/// engine after a successful install for sources that cannot self-report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PackageSpec {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PackageSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Folds the other spec's set fields into this one, keeping existing
    /// values where the other is silent. Used by add-package dedup.
    pub fn merge_from(&mut self, other: &PackageSpec) {
        if !other.id.is_empty() {
            self.id = other.id.clone();
        }
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(name);
        take!(repo);
        take!(url);
        take!(asset_pattern);
        take!(version_pattern);
        take!(installed_version);
        take!(product_code);
        take!(icon);
        take!(description);
    }
}

/// Configuration for one source type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    pub enabled: bool,
    pub packages: Vec<PackageSpec>,
    /// API token, used by the GitHub source to avoid rate limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            packages: Vec::new(),
            token: None,
        }
    }
}

/// The whole persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub github: SourceSection,
    pub flatpak: SourceSection,
    pub snap: SourceSection,
    pub apt: SourceSection,
    pub web: SourceSection,
    pub jetbrains: SourceSection,
    /// Ids excluded from scanning and update checks.
    pub ignored: Vec<String>,
    /// User-configured source overrides for scanner detections, keyed by id.
    pub overrides: std::collections::BTreeMap<String, crate::model::KnownSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: SourceSection {
                enabled: true,
                packages: vec![
                    PackageSpec {
                        id: "jackett".to_string(),
                        name: Some("Jackett".to_string()),
                        repo: Some("Jackett/Jackett".to_string()),
                        asset_pattern: Some(
                            r"Jackett\.Binaries\.LinuxAMDx64\.tar\.gz$".to_string(),
                        ),
                        ..Default::default()
                    },
                ],
                token: None,
            },
            flatpak: SourceSection::default(),
            snap: SourceSection::default(),
            // APT can list every upgradable package on the system, which is
            // far too broad for a tracked-software view.
            apt: SourceSection {
                enabled: false,
                ..Default::default()
            },
            web: SourceSection {
                enabled: true,
                packages: vec![
                    PackageSpec {
                        id: "devkinsta".to_string(),
                        name: Some("DevKinsta".to_string()),
                        url: Some("https://kinsta.com/devkinsta/".to_string()),
                        version_pattern: Some(r"Version\s+([\d.]+)".to_string()),
                        ..Default::default()
                    },
                    PackageSpec {
                        id: "local".to_string(),
                        name: Some("Local by Flywheel".to_string()),
                        url: Some("https://localwp.com/releases/".to_string()),
                        version_pattern: Some(r"(\d+\.\d+\.\d+)".to_string()),
                        ..Default::default()
                    },
                ],
                token: None,
            },
            jetbrains: SourceSection {
                enabled: true,
                packages: vec![PackageSpec {
                    id: "android-studio".to_string(),
                    name: Some("Android Studio".to_string()),
                    product_code: Some("AI".to_string()),
                    ..Default::default()
                }],
                token: None,
            },
            ignored: Vec::new(),
            overrides: Default::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults; a malformed file yields defaults with
    /// a logged warning rather than a hard failure.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("malformed config at {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("could not read config at {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Saves the configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn section(&self, ty: SourceType) -> Option<&SourceSection> {
        match ty {
            SourceType::Github => Some(&self.github),
            SourceType::Flatpak => Some(&self.flatpak),
            SourceType::Snap => Some(&self.snap),
            SourceType::Apt => Some(&self.apt),
            SourceType::Web => Some(&self.web),
            SourceType::Jetbrains => Some(&self.jetbrains),
            SourceType::Dpkg | SourceType::Detected => None,
        }
    }

    pub fn section_mut(&mut self, ty: SourceType) -> Option<&mut SourceSection> {
        match ty {
            SourceType::Github => Some(&mut self.github),
            SourceType::Flatpak => Some(&mut self.flatpak),
            SourceType::Snap => Some(&mut self.snap),
            SourceType::Apt => Some(&mut self.apt),
            SourceType::Web => Some(&mut self.web),
            SourceType::Jetbrains => Some(&mut self.jetbrains),
            SourceType::Dpkg | SourceType::Detected => None,
        }
    }

    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignored.iter().any(|i| i.eq_ignore_ascii_case(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json"));
        assert!(config.github.enabled);
        assert!(!config.apt.enabled);
        assert_eq!(config.github.packages[0].id, "jackett");
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = Config::load_from(&path);
        assert!(config.github.enabled);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.ignored.push("devkinsta".to_string());
        config.github.token = Some("token123".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert!(loaded.is_ignored("devkinsta"));
        assert!(loaded.is_ignored("DevKinsta"));
        assert_eq!(loaded.github.token.as_deref(), Some("token123"));
    }

    #[test]
    fn merge_from_keeps_existing_where_other_is_silent() {
        let mut existing = PackageSpec {
            id: "jackett".to_string(),
            name: Some("Jackett".to_string()),
            repo: Some("Jackett/Jackett".to_string()),
            installed_version: Some("0.20.0".to_string()),
            ..Default::default()
        };
        existing.merge_from(&PackageSpec {
            id: "jackett".to_string(),
            repo: Some("jackett/jackett".to_string()),
            ..Default::default()
        });
        assert_eq!(existing.repo.as_deref(), Some("jackett/jackett"));
        assert_eq!(existing.name.as_deref(), Some("Jackett"));
        assert_eq!(existing.installed_version.as_deref(), Some("0.20.0"));
    }
}
