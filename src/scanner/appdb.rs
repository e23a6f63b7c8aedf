//! Built-in table of well-known applications and the GitHub repositories
//! that publish them, used to pair scanner detections with an update
//! source when no configured override matches.

use crate::config::PackageSpec;
use crate::model::{KnownSource, SourceType};

pub struct KnownApp {
    pub id: &'static str,
    pub name: &'static str,
    pub repo: &'static str,
    pub asset_pattern: Option<&'static str>,
    /// Desktop-file basenames (without `.desktop`) this app ships under.
    pub desktop_names: &'static [&'static str],
    pub executables: &'static [&'static str],
}

pub static KNOWN_APPS: &[KnownApp] = &[
    KnownApp {
        id: "telegram",
        name: "Telegram Desktop",
        repo: "telegramdesktop/tdesktop",
        asset_pattern: Some(r"tsetup\.\d.*\.tar\.xz$"),
        desktop_names: &["telegramdesktop", "telegram-desktop", "org.telegram.desktop"],
        executables: &["telegram-desktop", "Telegram"],
    },
    KnownApp {
        id: "signal",
        name: "Signal",
        repo: "signalapp/Signal-Desktop",
        asset_pattern: None,
        desktop_names: &["signal-desktop"],
        executables: &["signal-desktop"],
    },
    KnownApp {
        id: "obsidian",
        name: "Obsidian",
        repo: "obsidianmd/obsidian-releases",
        asset_pattern: Some(r"obsidian_.*_amd64\.deb$"),
        desktop_names: &["obsidian", "md.obsidian.Obsidian"],
        executables: &["obsidian"],
    },
    KnownApp {
        id: "anki",
        name: "Anki",
        repo: "ankitects/anki",
        asset_pattern: Some(r"anki-.*-linux-qt6\.tar\.zst$"),
        desktop_names: &["anki"],
        executables: &["anki"],
    },
    KnownApp {
        id: "xournalpp",
        name: "Xournal++",
        repo: "xournalpp/xournalpp",
        asset_pattern: Some(r"xournalpp-.*-Ubuntu.*\.deb$"),
        desktop_names: &["com.github.xournalpp.xournalpp", "xournalpp"],
        executables: &["xournalpp"],
    },
    KnownApp {
        id: "joplin",
        name: "Joplin",
        repo: "laurent22/joplin",
        asset_pattern: Some(r"Joplin-.*\.AppImage$"),
        desktop_names: &["appimagekit-joplin", "joplin"],
        executables: &["joplin"],
    },
    KnownApp {
        id: "logseq",
        name: "Logseq",
        repo: "logseq/logseq",
        asset_pattern: Some(r"Logseq-linux-x64-.*\.AppImage$"),
        desktop_names: &["logseq"],
        executables: &["logseq"],
    },
    KnownApp {
        id: "code",
        name: "Visual Studio Code",
        repo: "microsoft/vscode",
        asset_pattern: None,
        desktop_names: &["code", "visual-studio-code"],
        executables: &["code"],
    },
    KnownApp {
        id: "insomnia",
        name: "Insomnia",
        repo: "Kong/insomnia",
        asset_pattern: Some(r"Insomnia\.Core-.*\.deb$"),
        desktop_names: &["insomnia"],
        executables: &["insomnia"],
    },
    KnownApp {
        id: "obs",
        name: "OBS Studio",
        repo: "obsproject/obs-studio",
        asset_pattern: None,
        desktop_names: &["com.obsproject.Studio", "obs"],
        executables: &["obs"],
    },
    KnownApp {
        id: "kdenlive",
        name: "Kdenlive",
        repo: "KDE/kdenlive",
        asset_pattern: Some(r"kdenlive-.*\.AppImage$"),
        desktop_names: &["org.kde.kdenlive", "kdenlive"],
        executables: &["kdenlive"],
    },
    KnownApp {
        id: "flameshot",
        name: "Flameshot",
        repo: "flameshot-org/flameshot",
        asset_pattern: Some(r"flameshot-.*\.ubuntu-.*\.amd64\.deb$"),
        desktop_names: &["org.flameshot.Flameshot", "flameshot"],
        executables: &["flameshot"],
    },
    KnownApp {
        id: "bitwarden",
        name: "Bitwarden",
        repo: "bitwarden/clients",
        asset_pattern: Some(r"Bitwarden-.*-amd64\.deb$"),
        desktop_names: &["bitwarden"],
        executables: &["bitwarden"],
    },
    KnownApp {
        id: "localsend",
        name: "LocalSend",
        repo: "localsend/localsend",
        asset_pattern: Some(r"LocalSend-.*-linux-x86-64\.deb$"),
        desktop_names: &["localsend", "org.localsend.localsend_app"],
        executables: &["localsend", "localsend_app"],
    },
    KnownApp {
        id: "brave",
        name: "Brave Browser",
        repo: "brave/brave-browser",
        asset_pattern: Some(r"brave-browser_.*_amd64\.deb$"),
        desktop_names: &["brave-browser", "com.brave.Browser"],
        executables: &["brave", "brave-browser"],
    },
    KnownApp {
        id: "lutris",
        name: "Lutris",
        repo: "lutris/lutris",
        asset_pattern: Some(r"lutris_.*_all\.deb$"),
        desktop_names: &["net.lutris.Lutris", "lutris"],
        executables: &["lutris"],
    },
    KnownApp {
        id: "freetube",
        name: "FreeTube",
        repo: "FreeTubeApp/FreeTube",
        asset_pattern: Some(r"freetube_.*_amd64\.deb$"),
        desktop_names: &["freetube", "io.freetubeapp.FreeTube"],
        executables: &["freetube"],
    },
    KnownApp {
        id: "etcher",
        name: "balenaEtcher",
        repo: "balena-io/etcher",
        asset_pattern: Some(r"balena-etcher_.*_amd64\.deb$"),
        desktop_names: &["balena-etcher-electron", "balena-etcher"],
        executables: &["balena-etcher", "etcher"],
    },
];

impl KnownApp {
    pub fn to_known_source(&self) -> KnownSource {
        KnownSource {
            source_type: SourceType::Github,
            spec: PackageSpec {
                id: self.id.to_string(),
                name: Some(self.name.to_string()),
                repo: Some(self.repo.to_string()),
                asset_pattern: self.asset_pattern.map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn score(&self, name: &str, desktop_name: Option<&str>, executable: Option<&str>) -> u32 {
        let mut score = 0;
        let name_lower = name.to_lowercase();
        let known_lower = self.name.to_lowercase();

        if let Some(desktop) = desktop_name {
            let desktop = desktop.to_lowercase();
            if self.desktop_names.iter().any(|d| d.to_lowercase() == desktop) {
                score += 2;
            }
        }
        if let Some(exe) = executable {
            let exe = exe.to_lowercase();
            if self.executables.iter().any(|e| e.to_lowercase() == exe) {
                score += 2;
            }
        }

        if name_lower == known_lower || name_lower == self.id {
            score += 5;
        } else if name_lower.contains(&known_lower) || known_lower.contains(&name_lower) {
            score += 3;
        } else {
            // Shared significant words catch renames like "OBS" in
            // "OBS Studio (64bit)".
            for word in known_lower.split_whitespace().filter(|w| w.len() > 3) {
                if name_lower.split_whitespace().any(|n| n == word) {
                    score += 1;
                }
            }
        }
        score
    }
}

/// Exact lookup by detection id against known ids, executables and
/// desktop names. Cheaper and more reliable than scoring, so it is
/// consulted first.
pub fn find_by_id(id: &str) -> Option<&'static KnownApp> {
    KNOWN_APPS.iter().find(|app| {
        app.id.eq_ignore_ascii_case(id)
            || app.executables.iter().any(|e| e.eq_ignore_ascii_case(id))
            || app.desktop_names.iter().any(|d| d.eq_ignore_ascii_case(id))
    })
}

/// Finds the best-scoring known app for a detection, or `None` below the
/// confidence floor. Ties go to the earlier table entry.
pub fn find_match(
    name: &str,
    desktop_name: Option<&str>,
    executable: Option<&str>,
) -> Option<&'static KnownApp> {
    let mut best: Option<(&KnownApp, u32)> = None;
    for app in KNOWN_APPS {
        let score = app.score(name, desktop_name, executable);
        if score >= 3 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((app, score));
        }
    }
    best.map(|(app, _)| app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_lookup_covers_ids_and_executables() {
        assert_eq!(find_by_id("telegram-desktop").unwrap().id, "telegram");
        assert_eq!(find_by_id("org.kde.kdenlive").unwrap().id, "kdenlive");
        assert!(find_by_id("not-a-known-app").is_none());
    }

    #[test]
    fn exact_name_matches() {
        let app = find_match("Obsidian", None, None).unwrap();
        assert_eq!(app.id, "obsidian");
    }

    #[test]
    fn desktop_and_executable_boost_weak_names() {
        // Name alone scores too low, the desktop id and binary pin it down.
        let app = find_match(
            "Studio",
            Some("com.obsproject.Studio"),
            Some("obs"),
        )
        .unwrap();
        assert_eq!(app.id, "obs");
    }

    #[test]
    fn unrelated_names_do_not_match() {
        assert!(find_match("Some Random Tool", None, None).is_none());
        assert!(find_match("gimp", Some("gimp"), Some("gimp")).is_none());
    }

    #[test]
    fn containment_beats_word_overlap() {
        let app = find_match("Brave Browser Beta", None, None).unwrap();
        assert_eq!(app.id, "brave");
    }
}
