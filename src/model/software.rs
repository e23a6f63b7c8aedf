use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Github,
    Flatpak,
    Snap,
    Apt,
    Web,
    Jetbrains,
    /// Scanner-only: detection resolved to a native system package.
    Dpkg,
    /// Scanner-only: detection with no matching update source.
    Detected,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Github => "github",
            SourceType::Flatpak => "flatpak",
            SourceType::Snap => "snap",
            SourceType::Apt => "apt",
            SourceType::Web => "web",
            SourceType::Jetbrains => "jetbrains",
            SourceType::Dpkg => "dpkg",
            SourceType::Detected => "detected",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceType::Github => "GitHub Releases",
            SourceType::Flatpak => "Flatpak",
            SourceType::Snap => "Snap",
            SourceType::Apt => "APT",
            SourceType::Web => "Web",
            SourceType::Jetbrains => "JetBrains",
            SourceType::Dpkg => "System Package",
            SourceType::Detected => "Detected",
        }
    }

    /// Source types backed by a real update-source plugin.
    pub fn pluggable() -> &'static [SourceType] {
        &[
            SourceType::Github,
            SourceType::Flatpak,
            SourceType::Snap,
            SourceType::Apt,
            SourceType::Web,
            SourceType::Jetbrains,
        ]
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(SourceType::Github),
            "flatpak" => Ok(SourceType::Flatpak),
            "snap" => Ok(SourceType::Snap),
            "apt" => Ok(SourceType::Apt),
            "web" => Ok(SourceType::Web),
            "jetbrains" => Ok(SourceType::Jetbrains),
            other => Err(format!(
                "unknown source: {other}. Use: github, flatpak, snap, apt, web, jetbrains"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    #[default]
    Unknown,
    UpToDate,
    UpdateAvailable,
    Error,
}

/// Canonical cross-source record for one trackable application.
///
/// Created by a plugin's enumeration or by the scanner, refreshed in place by
/// update checks, never deleted - each refresh cycle re-derives the full set.
///
/// Invariant: `status == UpdateAvailable` implies `latest_version` is present
/// and compares greater than `installed_version` under [`crate::version`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareInfo {
    pub id: String,
    pub name: String,
    pub installed_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: UpdateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SoftwareInfo {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        installed_version: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            installed_version: installed_version.into(),
            latest_version: None,
            source_type,
            source_url: None,
            icon: None,
            description: None,
            status: UpdateStatus::Unknown,
            error_message: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn has_update(&self) -> bool {
        self.status == UpdateStatus::UpdateAvailable
    }

    /// Formatted version for display: "1.0 → 2.0" while an update is pending.
    pub fn display_version(&self) -> String {
        match (&self.latest_version, self.has_update()) {
            (Some(latest), true) => format!("{} → {}", self.installed_version, latest),
            _ => self.installed_version.clone(),
        }
    }

    /// Marks the item failed with a UI-ready message.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = UpdateStatus::Error;
        self.error_message = Some(message.into());
    }
}

/// Outcome of a plugin download operation.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub success: bool,
    pub file_path: Option<PathBuf>,
    /// URL for manual download when the source cannot fetch directly.
    pub download_url: Option<String>,
    /// SHA-256 of the downloaded artifact.
    pub checksum: Option<String>,
    pub error_message: Option<String>,
}

impl DownloadResult {
    pub fn ok(file_path: Option<PathBuf>) -> Self {
        Self {
            success: true,
            file_path,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Outcome of a plugin install operation.
#[derive(Debug, Clone, Default)]
pub struct InstallResult {
    pub success: bool,
    pub new_version: Option<String>,
    pub error_message: Option<String>,
}

impl InstallResult {
    pub fn ok(new_version: Option<String>) -> Self {
        Self {
            success: true,
            new_version,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            new_version: None,
            error_message: Some(message.into()),
        }
    }
}

/// Outcome of a plugin uninstall operation.
#[derive(Debug, Clone)]
pub struct UninstallResult {
    pub success: bool,
    pub error_message: Option<String>,
}

impl UninstallResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_version_shows_arrow_only_for_pending_update() {
        let mut info = SoftwareInfo::new("jackett", "Jackett", "0.20.0", SourceType::Github);
        assert_eq!(info.display_version(), "0.20.0");

        info.latest_version = Some("0.21.1".to_string());
        info.status = UpdateStatus::UpdateAvailable;
        assert_eq!(info.display_version(), "0.20.0 → 0.21.1");

        info.status = UpdateStatus::UpToDate;
        assert_eq!(info.display_version(), "0.20.0");
    }

    #[test]
    fn mark_error_sets_status_and_message() {
        let mut info = SoftwareInfo::new("foo", "Foo", "1.0", SourceType::Web);
        info.mark_error("could not extract version");
        assert_eq!(info.status, UpdateStatus::Error);
        assert_eq!(
            info.error_message.as_deref(),
            Some("could not extract version")
        );
    }
}
