use serde::{Deserialize, Serialize};

use super::SourceType;
use crate::config::PackageSpec;

/// How a piece of software was found on disk.
///
/// The ordering given by [`InstallType::precedence`] drives the scanner's
/// dedup merge: a dpkg-resolved detection always wins, desktop entries beat
/// plain directory finds, and within a tier the first detection is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallType {
    /// Resolved to an installed dpkg package.
    Dpkg,
    /// Found under a fixed install directory such as `/opt`.
    OptDirectory,
    /// A portable binary (AppImage) in a user directory.
    PortableBinary,
    /// A system-wide desktop-entry file.
    DesktopEntrySystem,
    /// A per-user desktop-entry file.
    DesktopEntryUser,
}

impl InstallType {
    /// Merge priority; higher wins when two detections share an id.
    pub fn precedence(&self) -> u8 {
        match self {
            InstallType::Dpkg => 3,
            InstallType::DesktopEntrySystem | InstallType::DesktopEntryUser => 2,
            InstallType::OptDirectory | InstallType::PortableBinary => 1,
        }
    }
}

/// A known update source for a detected item: which plugin owns it and the
/// package entry to register with that plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownSource {
    pub source_type: SourceType,
    pub spec: PackageSpec,
}

/// The scanner's raw finding before source matching.
///
/// Ephemeral: produced and consumed within one scan pass. Several records for
/// the same real application are merged before being handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedSoftware {
    pub id: String,
    pub name: String,
    pub version: String,
    pub install_type: InstallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_source: Option<KnownSource>,
}

impl DetectedSoftware {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        install_type: InstallType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            install_type,
            install_path: None,
            executable: None,
            description: None,
            known_source: None,
        }
    }

    /// View of this detection as a canonical record, using the scanner-only
    /// pseudo source types for items no plugin claims.
    pub fn to_software_info(&self) -> super::SoftwareInfo {
        let source_type = match &self.known_source {
            Some(known) => known.source_type,
            None if self.install_type == InstallType::Dpkg => SourceType::Dpkg,
            None => SourceType::Detected,
        };
        super::SoftwareInfo::new(&self.id, &self.name, &self.version, source_type)
            .with_description(self.description.clone())
    }
}
