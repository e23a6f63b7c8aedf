//! Filesystem scanner for software installed outside any plugin's view.
//!
//! Three passes feed one merge step: desktop-entry files (resolved against
//! the dpkg database where possible), `/opt` directories, and portable
//! AppImage binaries. Detections sharing an id are merged by install-type
//! precedence, then paired with an update source via configured overrides
//! or the built-in known-app table.

pub mod appdb;

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::model::{DetectedSoftware, InstallType, KnownSource};
use crate::source::run_command;

const VERSION_FILES: &[&str] = &["version", "version.txt", "VERSION", ".version", "build.txt"];
const JSON_VERSION_FILES: &[&str] = &["package.json", "product.json", "resources/app/package.json"];

fn appimage_version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-_ ]v?(\d+(?:\.\d+)+)").expect("static regex"))
}

pub struct SoftwareScanner {
    overrides: BTreeMap<String, KnownSource>,
    ignored: Vec<String>,
}

impl SoftwareScanner {
    pub fn new(config: &Config) -> Self {
        Self {
            overrides: config.overrides.clone(),
            ignored: config.ignored.clone(),
        }
    }

    /// Runs all passes and returns one merged, source-matched detection
    /// per application.
    pub async fn scan(&self) -> Vec<DetectedSoftware> {
        let dpkg = installed_dpkg_versions().await;

        let mut detections = Vec::new();
        detections.extend(self.scan_desktop_entries(&dpkg));
        detections.extend(self.scan_opt_directories());
        detections.extend(self.scan_portable_binaries());
        info!("{} raw detections before merge", detections.len());

        let mut merged = merge_detections(detections);
        for detection in &mut merged {
            detection.known_source = self.match_source(detection);
        }
        merged.retain(|d| {
            !self
                .ignored
                .iter()
                .any(|ign| ign.eq_ignore_ascii_case(&d.id))
        });
        merged.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        merged
    }

    fn scan_desktop_entries(&self, dpkg: &HashMap<String, String>) -> Vec<DetectedSoftware> {
        let mut dirs = vec![(
            PathBuf::from("/usr/share/applications"),
            InstallType::DesktopEntrySystem,
        )];
        if let Some(home) = dirs::home_dir() {
            dirs.push((
                home.join(".local/share/applications"),
                InstallType::DesktopEntryUser,
            ));
        }

        let mut detections = Vec::new();
        for (dir, install_type) in dirs {
            for entry in WalkDir::new(&dir)
                .max_depth(2)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("desktop") {
                    continue;
                }
                let Ok(content) = std::fs::read_to_string(path) else {
                    continue;
                };
                if let Some(detection) =
                    desktop_entry_detection(path, &content, install_type, dpkg)
                {
                    detections.push(detection);
                }
            }
        }
        detections
    }

    fn scan_opt_directories(&self) -> Vec<DetectedSoftware> {
        let Ok(entries) = std::fs::read_dir("/opt") else {
            return Vec::new();
        };

        entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|entry| {
                let dir = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let version =
                    directory_version(&dir).unwrap_or_else(|| "unknown".to_string());
                debug!("/opt detection: {name} {version}");
                let mut detection = DetectedSoftware::new(
                    name.to_lowercase(),
                    name,
                    version,
                    InstallType::OptDirectory,
                );
                detection.install_path = Some(dir.to_string_lossy().to_string());
                detection
            })
            .collect()
    }

    fn scan_portable_binaries(&self) -> Vec<DetectedSoftware> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        let dirs = [
            home.join("Applications"),
            home.join(".local/bin"),
            home.join("AppImages"),
        ];

        let mut detections = Vec::new();
        for dir in dirs {
            for entry in WalkDir::new(&dir)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !filename.to_lowercase().ends_with(".appimage") {
                    continue;
                }
                let (name, version) = parse_appimage_filename(filename);
                let mut detection = DetectedSoftware::new(
                    name.to_lowercase().replace(' ', "-"),
                    name,
                    version,
                    InstallType::PortableBinary,
                );
                detection.install_path = Some(path.to_string_lossy().to_string());
                detection.executable = Some(filename.to_string());
                detections.push(detection);
            }
        }
        detections
    }

    fn match_source(&self, detection: &DetectedSoftware) -> Option<KnownSource> {
        if let Some(known) = self
            .overrides
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(&detection.id))
            .map(|(_, known)| known)
        {
            return Some(known.clone());
        }

        if let Some(app) = appdb::find_by_id(&detection.id) {
            return Some(app.to_known_source());
        }

        let desktop_name = match detection.install_type {
            InstallType::DesktopEntrySystem | InstallType::DesktopEntryUser | InstallType::Dpkg => {
                detection
                    .install_path
                    .as_deref()
                    .map(Path::new)
                    .and_then(|p| p.file_stem())
                    .and_then(|s| s.to_str())
            }
            _ => None,
        };
        appdb::find_match(&detection.name, desktop_name, detection.executable.as_deref())
            .map(|app| app.to_known_source())
    }
}

/// One dpkg-query pass instead of a process call per desktop entry.
async fn installed_dpkg_versions() -> HashMap<String, String> {
    let Ok(output) = run_command(
        "dpkg-query",
        &["-W", "-f", "${Package}\\t${Version}\\n"],
        30,
    )
    .await
    else {
        return HashMap::new();
    };

    output
        .lines()
        .filter_map(|line| {
            let (package, version) = line.split_once('\t')?;
            Some((package.to_string(), version.to_string()))
        })
        .collect()
}

fn desktop_entry_detection(
    path: &Path,
    content: &str,
    install_type: InstallType,
    dpkg: &HashMap<String, String>,
) -> Option<DetectedSoftware> {
    let entry = parse_desktop_entry(content)?;
    if entry.no_display || entry.entry_type.as_deref() != Some("Application") {
        return None;
    }
    let exec = entry.exec?;
    // Flatpak-exported entries are already covered by the flatpak source.
    if exec.contains("flatpak run") {
        return None;
    }

    let exec_name = exec
        .split_whitespace()
        .next()
        .map(|t| t.rsplit('/').next().unwrap_or(t))?
        .to_string();
    let name = entry.name?;
    let id = exec_name.to_lowercase();

    let (version, install_type) = match dpkg.get(&id) {
        Some(version) => (version.clone(), InstallType::Dpkg),
        None => ("unknown".to_string(), install_type),
    };

    let mut detection = DetectedSoftware::new(id, name, version, install_type);
    detection.install_path = Some(path.to_string_lossy().to_string());
    detection.executable = Some(exec_name);
    detection.description = entry.comment;
    Some(detection)
}

#[derive(Default)]
struct DesktopEntry {
    name: Option<String>,
    exec: Option<String>,
    comment: Option<String>,
    entry_type: Option<String>,
    no_display: bool,
}

/// Minimal `[Desktop Entry]` section parser; localized keys and other
/// sections are skipped.
fn parse_desktop_entry(content: &str) -> Option<DesktopEntry> {
    let mut entry = DesktopEntry::default();
    let mut in_main_section = false;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_main_section = line == "[Desktop Entry]";
            continue;
        }
        if !in_main_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "Name" => entry.name = Some(value.trim().to_string()),
            "Exec" => entry.exec = Some(value.trim().to_string()),
            "Comment" => entry.comment = Some(value.trim().to_string()),
            "Type" => entry.entry_type = Some(value.trim().to_string()),
            "NoDisplay" => entry.no_display = value.trim().eq_ignore_ascii_case("true"),
            _ => {}
        }
    }
    entry.name.is_some().then_some(entry)
}

fn directory_version(dir: &Path) -> Option<String> {
    for file in VERSION_FILES {
        if let Ok(content) = std::fs::read_to_string(dir.join(file)) {
            let first = content.lines().next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    for file in JSON_VERSION_FILES {
        if let Ok(content) = std::fs::read_to_string(dir.join(file)) {
            if let Ok(json) = serde_json::from_str::<Value>(&content) {
                if let Some(version) = json.get("version").and_then(Value::as_str) {
                    return Some(version.to_string());
                }
            }
        }
    }
    None
}

/// Splits "Joplin-2.14.20.AppImage" into a display name and version.
fn parse_appimage_filename(filename: &str) -> (String, String) {
    let stem = filename
        .strip_suffix(".AppImage")
        .or_else(|| filename.strip_suffix(".appimage"))
        .unwrap_or(filename);

    match appimage_version_regex().captures(stem) {
        Some(caps) => {
            let version = caps[1].to_string();
            let name_end = caps.get(0).map(|m| m.start()).unwrap_or(stem.len());
            let name = stem[..name_end].replace(['-', '_'], " ").trim().to_string();
            let name = if name.is_empty() {
                stem.to_string()
            } else {
                name
            };
            (name, version)
        }
        None => (stem.replace(['-', '_'], " "), "unknown".to_string()),
    }
}

/// Collapses duplicate detections of the same application, keeping the one
/// with the strictly highest install-type precedence. Within a tier the
/// first detection wins.
pub fn merge_detections(detections: Vec<DetectedSoftware>) -> Vec<DetectedSoftware> {
    let mut merged: Vec<DetectedSoftware> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for detection in detections {
        match index.get(&detection.id) {
            Some(&i) => {
                if detection.install_type.precedence() > merged[i].install_type.precedence() {
                    merged[i] = detection;
                }
            }
            None => {
                index.insert(detection.id.clone(), merged.len());
                merged.push(detection);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpkg_resolved_entry_wins_the_merge() {
        let detections = vec![
            DetectedSoftware::new("telegram-desktop", "telegram-desktop", "unknown",
                InstallType::OptDirectory),
            DetectedSoftware::new("telegram-desktop", "Telegram", "4.9.0",
                InstallType::Dpkg),
            DetectedSoftware::new("telegram-desktop", "Telegram Desktop", "unknown",
                InstallType::DesktopEntryUser),
        ];
        let merged = merge_detections(detections);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].install_type, InstallType::Dpkg);
        assert_eq!(merged[0].version, "4.9.0");
    }

    #[test]
    fn first_detection_wins_within_a_tier() {
        let detections = vec![
            DetectedSoftware::new("code", "Code System", "unknown",
                InstallType::DesktopEntrySystem),
            DetectedSoftware::new("code", "Code User", "unknown",
                InstallType::DesktopEntryUser),
        ];
        let merged = merge_detections(detections);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "Code System");
    }

    #[test]
    fn desktop_entry_parsing_skips_hidden_and_flatpak() {
        let content = "\
[Desktop Entry]
Type=Application
Name=Telegram Desktop
Comment=Messaging app
Exec=/usr/bin/telegram-desktop -- %u
";
        let dpkg = HashMap::from([(
            "telegram-desktop".to_string(),
            "4.9.0".to_string(),
        )]);
        let detection = desktop_entry_detection(
            Path::new("/usr/share/applications/telegramdesktop.desktop"),
            content,
            InstallType::DesktopEntrySystem,
            &dpkg,
        )
        .unwrap();
        assert_eq!(detection.id, "telegram-desktop");
        assert_eq!(detection.install_type, InstallType::Dpkg);
        assert_eq!(detection.version, "4.9.0");
        assert_eq!(detection.description.as_deref(), Some("Messaging app"));

        let hidden = "[Desktop Entry]\nType=Application\nName=X\nExec=x\nNoDisplay=true\n";
        assert!(desktop_entry_detection(
            Path::new("/tmp/x.desktop"),
            hidden,
            InstallType::DesktopEntrySystem,
            &HashMap::new(),
        )
        .is_none());

        let flatpak = "[Desktop Entry]\nType=Application\nName=X\n\
                       Exec=/usr/bin/flatpak run org.example.X\n";
        assert!(desktop_entry_detection(
            Path::new("/tmp/y.desktop"),
            flatpak,
            InstallType::DesktopEntrySystem,
            &HashMap::new(),
        )
        .is_none());
    }

    #[test]
    fn appimage_filenames_parse_name_and_version() {
        assert_eq!(
            parse_appimage_filename("Joplin-2.14.20.AppImage"),
            ("Joplin".to_string(), "2.14.20".to_string())
        );
        assert_eq!(
            parse_appimage_filename("Logseq-linux-x64-0.10.9.AppImage"),
            ("Logseq linux x64".to_string(), "0.10.9".to_string())
        );
        assert_eq!(
            parse_appimage_filename("sometool.AppImage"),
            ("sometool".to_string(), "unknown".to_string())
        );
    }

    #[test]
    fn json_version_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "app", "version": "1.85.2"}"#,
        )
        .unwrap();
        assert_eq!(directory_version(dir.path()).as_deref(), Some("1.85.2"));

        std::fs::write(dir.path().join("version.txt"), "2.0.0\n").unwrap();
        // Plain version files take priority over JSON manifests.
        assert_eq!(directory_version(dir.path()).as_deref(), Some("2.0.0"));
    }
}
