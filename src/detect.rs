//! Installed-version detection for packages outside any package database.
//!
//! Resolution order: dpkg query, then a per-application probe registry, then
//! the persisted [`VersionStore`], defaulting to `None` (caller shows
//! "unknown") rather than failing.

use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::store::VersionStore;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to probe one known application for its installed version.
struct Probe {
    /// Matched against the lowercased software id and display name.
    patterns: &'static [&'static str],
    /// Command plus args producing version text on stdout.
    command: &'static [&'static str],
    /// Capture group 1 extracts the version from the command output.
    version_regex: &'static str,
}

const PROBES: &[Probe] = &[
    Probe {
        patterns: &["telegram"],
        command: &["/opt/Telegram/Telegram", "-version"],
        version_regex: r"Telegram Desktop (\d[\d.]*)",
    },
    Probe {
        patterns: &["brave", "brave-browser"],
        command: &["brave-browser", "--version"],
        version_regex: r"(\d+\.\d+[\d.]*)",
    },
    Probe {
        patterns: &["code", "vscode"],
        command: &["code", "--version"],
        version_regex: r"^(\d+\.\d+[\d.]*)",
    },
    Probe {
        patterns: &["obs", "obs-studio"],
        command: &["obs", "--version"],
        version_regex: r"(\d+\.\d+[\d.]*)",
    },
    Probe {
        patterns: &["flameshot"],
        command: &["flameshot", "--version"],
        version_regex: r"v?(\d+\.\d+[\d.]*)",
    },
    Probe {
        patterns: &["anki"],
        command: &["anki", "--version"],
        version_regex: r"(\d+\.\d+[\d.]*)",
    },
    Probe {
        patterns: &["xournalpp", "xournal++"],
        command: &["xournalpp", "--version"],
        version_regex: r"(\d+\.\d+[\d.]*)",
    },
];

/// Version files checked under `/opt/<Name>` style install directories.
const OPT_VERSION_FILES: &[&str] = &["version.txt", "VERSION", "build.txt"];

pub struct VersionDetector {
    store: Arc<VersionStore>,
}

impl VersionDetector {
    pub fn new(store: Arc<VersionStore>) -> Self {
        Self { store }
    }

    /// Detects an installed version for `id`, trying dpkg, the probe
    /// registry, and finally the persisted store.
    pub async fn detect(&self, id: &str, name: Option<&str>) -> Option<String> {
        if let Some(version) = dpkg_version(id).await {
            return Some(version);
        }

        let id_lower = id.to_lowercase();
        let name_lower = name.map(str::to_lowercase);
        for probe in PROBES {
            let matched = probe.patterns.iter().any(|p| {
                id_lower.contains(p)
                    || name_lower.as_deref().is_some_and(|n| n.contains(p))
            });
            if !matched {
                continue;
            }
            if let Some(version) = run_probe(probe).await {
                debug!("probed version for {id}: {version}");
                return Some(version);
            }
        }

        if let Some(version) = opt_directory_version(&id_lower) {
            return Some(version);
        }

        if let Some(stored) = self.store.get(id) {
            debug!("using stored version for {id}: {stored}");
            return Some(stored);
        }
        None
    }
}

/// Queries dpkg for an installed package version.
pub async fn dpkg_version(package_id: &str) -> Option<String> {
    let output = timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new("dpkg-query")
            .args(["-W", "-f=${Version}", package_id])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

async fn run_probe(probe: &Probe) -> Option<String> {
    let (cmd, args) = probe.command.split_first()?;
    let output = timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let regex = Regex::new(probe.version_regex).ok()?;
    regex
        .captures(&stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn opt_directory_version(id_lower: &str) -> Option<String> {
    let candidates = [
        PathBuf::from("/opt").join(id_lower),
        PathBuf::from("/opt").join(capitalize(id_lower)),
    ];
    for dir in candidates {
        for file in OPT_VERSION_FILES {
            let path = dir.join(file);
            if let Ok(content) = std::fs::read_to_string(&path) {
                let first = content.lines().next().unwrap_or("").trim();
                if !first.is_empty() {
                    return Some(first.to_string());
                }
            }
        }
    }
    None
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_stored_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VersionStore::open(dir.path().join("versions.json")));
        store.set("some-untraceable-app", "3.1.4", "install");

        let detector = VersionDetector::new(store);
        let version = detector.detect("some-untraceable-app", None).await;
        assert_eq!(version.as_deref(), Some("3.1.4"));
    }

    #[tokio::test]
    async fn unknown_app_detects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VersionStore::open(dir.path().join("versions.json")));
        let detector = VersionDetector::new(store);
        assert!(detector
            .detect("definitely-not-installed-zzz", None)
            .await
            .is_none());
    }
}
