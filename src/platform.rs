//! Path resolution for persisted state.
//!
//! Everything omniup persists lives under the platform config and cache
//! directories:
//! - Linux: `~/.config/omniup/`, `~/.cache/omniup/`
//! - macOS: `~/Library/Application Support/omniup/`, `~/Library/Caches/omniup/`

use std::path::PathBuf;

const APP_DIR: &str = "omniup";

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// The JSON configuration document.
pub fn config_file() -> PathBuf {
    config_dir().join("config.json")
}

/// Append-only update history log.
pub fn history_file() -> PathBuf {
    config_dir().join("history.json")
}

/// Persisted version store for apps whose version cannot be auto-detected.
pub fn version_store_file() -> PathBuf {
    config_dir().join("installed_versions.json")
}

/// Root directory for pre-install backups and their index.
pub fn backup_dir() -> PathBuf {
    cache_dir().join("backups")
}

/// Migration advisor release cache.
pub fn migration_cache_file() -> PathBuf {
    cache_dir().join("migration_cache.json")
}
