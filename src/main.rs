use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use omniup::config::PackageSpec;
use omniup::engine::UpdateEngine;
use omniup::migration::{GithubReleaseFetcher, MigrationAdvisor, MigrationCandidate};
use omniup::model::{SoftwareInfo, SourceType, UpdateStatus};
use omniup::scanner::SoftwareScanner;
use omniup::source::{AptSource, FlatpakSource, UpdateSource};
use omniup::{platform, Config};
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tracing_subscriber::EnvFilter;

/// Exit codes for scripting
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const UPDATES_AVAILABLE: u8 = 2;
}

#[derive(Parser)]
#[command(name = "omniup")]
#[command(
    author,
    version,
    about = "Track and apply updates for software installed from heterogeneous sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check all tracked software for updates
    Check {
        /// Check sources one at a time instead of concurrently
        #[arg(long)]
        sequential: bool,

        /// Emit results as JSON
        #[arg(long)]
        json: bool,

        /// Run `apt update` before checking
        #[arg(long)]
        refresh: bool,
    },

    /// List all tracked software without checking for updates
    List,

    /// Download and install the pending update for one item
    Install {
        /// Software id as shown by `check`
        id: String,
    },

    /// Install every pending update, one at a time
    InstallAll,

    /// Remove an installed item through its source
    Uninstall {
        /// Software id as shown by `list`
        id: String,
    },

    /// Scan the filesystem for installed software outside any source
    Scan {
        /// Emit results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Track a new package
    Add {
        /// Source to add the package to (github, web, apt, jetbrains)
        source: String,

        /// Package id
        id: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// GitHub repository, "owner/name" or full URL
        #[arg(long)]
        repo: Option<String>,

        /// Page URL for web-scraped sources
        #[arg(long)]
        url: Option<String>,

        /// Regex selecting the release asset to download
        #[arg(long)]
        asset_pattern: Option<String>,

        /// Regex capturing the version on a web page
        #[arg(long)]
        version_pattern: Option<String>,

        /// JetBrains product code
        #[arg(long)]
        product_code: Option<String>,
    },

    /// Hide a software id from checks and scans
    Ignore {
        id: String,
    },

    /// Show the update history
    History {
        /// Only failed updates
        #[arg(long)]
        failed: bool,

        /// Number of records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Manage pre-update backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Suggest and apply Flatpak-to-native migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },

    /// Show or create the config file
    Config {
        /// Write a default config file
        #[arg(long)]
        init: bool,

        /// Show the config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List stored backups
    List {
        /// Only backups for this software id
        #[arg(long)]
        software: Option<String>,
    },

    /// Restore a backup by its id
    Restore {
        backup_id: String,
    },

    /// Delete old backups, keeping the newest ones
    Cleanup {
        /// Backups to keep per software
        #[arg(long, default_value_t = 3)]
        keep: usize,

        /// Delete backups older than this many days regardless
        #[arg(long, default_value_t = 90)]
        max_age_days: i64,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// List Flatpak apps with a native alternative
    List,

    /// Replace one Flatpak app with its native build
    Apply {
        /// Flatpak application id
        flatpak_id: String,
    },
}

#[derive(Tabled)]
struct SoftwareRow {
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct DetectionRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Found As")]
    install_type: String,
    #[tabled(rename = "Update Source")]
    source: String,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "When")]
    timestamp: String,
    #[tabled(rename = "Software")]
    software: String,
    #[tabled(rename = "Versions")]
    versions: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "Backup ID")]
    id: String,
    #[tabled(rename = "Software")]
    software: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[derive(Tabled)]
struct MigrationRow {
    #[tabled(rename = "Flatpak App")]
    name: String,
    #[tabled(rename = "Flatpak Version")]
    flatpak_version: String,
    #[tabled(rename = "Native Version")]
    native_version: String,
    #[tabled(rename = "Repository")]
    repo: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

async fn run() -> Result<u8> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            sequential,
            json,
            refresh,
        } => run_check(!sequential, json, refresh).await,
        Commands::List => {
            let engine = UpdateEngine::new();
            let tracked = engine.tracked_software().await;
            print_software_table(&tracked);
            Ok(exit_codes::SUCCESS)
        }
        Commands::Install { id } => run_install(&id).await,
        Commands::InstallAll => run_install_all().await,
        Commands::Uninstall { id } => run_uninstall(&id).await,
        Commands::Scan { json } => run_scan(json).await,
        Commands::Add {
            source,
            id,
            name,
            repo,
            url,
            asset_pattern,
            version_pattern,
            product_code,
        } => {
            let ty = SourceType::from_str(&source).map_err(|e| anyhow!(e))?;
            let mut engine = UpdateEngine::new();
            let stored_id = engine.add_package(
                ty,
                PackageSpec {
                    id,
                    name,
                    repo,
                    url,
                    asset_pattern,
                    version_pattern,
                    product_code,
                    ..Default::default()
                },
            )?;
            println!("Now tracking '{stored_id}' via {ty}.");
            Ok(exit_codes::SUCCESS)
        }
        Commands::Ignore { id } => {
            let mut engine = UpdateEngine::new();
            engine.ignore_package(&id)?;
            println!("'{id}' will be skipped from now on.");
            Ok(exit_codes::SUCCESS)
        }
        Commands::History { failed, limit } => {
            run_history(failed, limit);
            Ok(exit_codes::SUCCESS)
        }
        Commands::Backups { command } => run_backups(command).await,
        Commands::Migrate { command } => run_migrate(command).await,
        Commands::Config { init, path } => {
            handle_config(init, path)?;
            Ok(exit_codes::SUCCESS)
        }
    }
}

async fn run_check(parallel: bool, json: bool, refresh: bool) -> Result<u8> {
    if refresh {
        AptSource::refresh_package_list()
            .await
            .map_err(|e| anyhow!("apt refresh failed: {e}"))?;
    }

    let engine = UpdateEngine::new();
    let progress = (!json).then(spinner);
    if let Some(pb) = &progress {
        pb.set_message("Checking for updates...");
    }

    let mut results = engine.check_all(parallel).await;
    results.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));

    let updates = results.iter().filter(|s| s.has_update()).count();
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_software_table(&results);
        match updates {
            0 => println!("Everything is up to date."),
            1 => println!("1 update available. Run `omniup install <id>` to apply it."),
            n => println!("{n} updates available. Run `omniup install-all` to apply them."),
        }
    }

    Ok(if updates > 0 {
        exit_codes::UPDATES_AVAILABLE
    } else {
        exit_codes::SUCCESS
    })
}

async fn run_install(id: &str) -> Result<u8> {
    let mut engine = UpdateEngine::new();

    let pb = spinner();
    pb.set_message(format!("Checking {id}..."));
    let checked = engine.check_all(true).await;
    pb.finish_and_clear();

    let software = checked
        .into_iter()
        .find(|s| s.id.eq_ignore_ascii_case(id))
        .ok_or_else(|| anyhow!("no tracked software with id '{id}'"))?;

    if !software.has_update() {
        match software.status {
            UpdateStatus::Error => {
                return Err(anyhow!(
                    "cannot install {}: {}",
                    software.name,
                    software.error_message.as_deref().unwrap_or("check failed")
                ))
            }
            _ => {
                println!("{} is already up to date.", software.name);
                return Ok(exit_codes::SUCCESS);
            }
        }
    }

    println!(
        "Updating {} ({})...",
        software.name,
        software.display_version()
    );
    let result = engine.install_update(&software).await;
    if result.success {
        println!(
            "{} updated to {}.",
            software.name,
            result.new_version.as_deref().unwrap_or("latest")
        );
        Ok(exit_codes::SUCCESS)
    } else {
        Err(anyhow!(
            "update failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ))
    }
}

async fn run_install_all() -> Result<u8> {
    let mut engine = UpdateEngine::new();
    let results = engine.install_all().await;

    if results.is_empty() {
        println!("Everything is up to date.");
        return Ok(exit_codes::SUCCESS);
    }

    let mut failures = 0;
    for (software, result) in &results {
        if result.success {
            println!(
                "  ok    {} -> {}",
                software.name,
                result.new_version.as_deref().unwrap_or("latest")
            );
        } else {
            failures += 1;
            println!(
                "  FAIL  {}: {}",
                software.name,
                result.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!(
        "{} updated, {} failed.",
        results.len() - failures,
        failures
    );
    Ok(if failures > 0 {
        exit_codes::ERROR
    } else {
        exit_codes::SUCCESS
    })
}

async fn run_uninstall(id: &str) -> Result<u8> {
    let mut engine = UpdateEngine::new();
    let software = engine
        .tracked_software()
        .await
        .into_iter()
        .find(|s| s.id.eq_ignore_ascii_case(id))
        .ok_or_else(|| anyhow!("no tracked software with id '{id}'"))?;

    let result = engine.uninstall_software(&software).await;
    if result.success {
        println!("{} removed.", software.name);
        Ok(exit_codes::SUCCESS)
    } else {
        Err(anyhow!(
            "uninstall failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ))
    }
}

async fn run_scan(json: bool) -> Result<u8> {
    let config = Config::load_from(&platform::config_file());
    let scanner = SoftwareScanner::new(&config);

    let progress = (!json).then(spinner);
    if let Some(pb) = &progress {
        pb.set_message("Scanning installed software...");
    }
    let detections = scanner.scan().await;
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&detections)?);
        return Ok(exit_codes::SUCCESS);
    }

    if detections.is_empty() {
        println!("Nothing found outside the configured sources.");
        return Ok(exit_codes::SUCCESS);
    }

    let rows: Vec<DetectionRow> = detections
        .iter()
        .map(|d| DetectionRow {
            name: d.name.clone(),
            version: d.version.clone(),
            install_type: install_type_label(d.install_type).to_string(),
            source: d
                .known_source
                .as_ref()
                .and_then(|k| k.spec.repo.clone())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!(
        "{} applications found. Those with an update source can be tracked with `omniup add`.",
        detections.len()
    );
    Ok(exit_codes::SUCCESS)
}

fn run_history(failed_only: bool, limit: usize) {
    let engine = UpdateEngine::new();
    let history = engine.history();
    let records: Vec<_> = if failed_only {
        history.failed().into_iter().rev().take(limit).collect()
    } else {
        history.recent(limit)
    };

    if records.is_empty() {
        println!("No update history yet.");
        return;
    }

    let rows: Vec<HistoryRow> = records
        .iter()
        .map(|r| HistoryRow {
            timestamp: r.timestamp.clone(),
            software: r.software_name.clone(),
            versions: format!("{} -> {}", r.old_version, r.new_version),
            result: if r.success {
                "ok".to_string()
            } else {
                r.error_message.clone().unwrap_or_else(|| "failed".to_string())
            },
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

async fn run_backups(command: BackupCommands) -> Result<u8> {
    let engine = UpdateEngine::new();
    let backups = engine.backups();
    let mut manager = backups.lock().await;

    match command {
        BackupCommands::List { software } => {
            let entries = manager.list(software.as_deref());
            if entries.is_empty() {
                println!("No backups stored.");
                return Ok(exit_codes::SUCCESS);
            }
            let rows: Vec<BackupRow> = entries
                .iter()
                .map(|(id, record)| BackupRow {
                    id: id.to_string(),
                    software: record.software_name.clone(),
                    version: record.version.clone(),
                    created: record.created_at.clone(),
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
        BackupCommands::Restore { backup_id } => {
            manager.restore(&backup_id)?;
            println!("Backup '{backup_id}' restored.");
        }
        BackupCommands::Cleanup { keep, max_age_days } => {
            let before = manager.list(None).len();
            manager.cleanup_old_backups(keep, max_age_days);
            let removed = before - manager.list(None).len();
            println!("Removed {removed} old backups.");
        }
    }
    Ok(exit_codes::SUCCESS)
}

async fn run_migrate(command: MigrateCommands) -> Result<u8> {
    let advisor = MigrationAdvisor::new(Box::new(GithubReleaseFetcher::new()));

    let flatpak = FlatpakSource::new();
    let apps = flatpak
        .tracked()
        .await
        .map_err(|e| anyhow!("could not list Flatpak apps: {e}"))?;

    let pb = spinner();
    pb.set_message("Looking up native releases...");
    let candidates = advisor.find_alternatives(&apps).await;
    pb.finish_and_clear();

    match command {
        MigrateCommands::List => {
            if candidates.is_empty() {
                println!("No native alternatives found for the installed Flatpak apps.");
                return Ok(exit_codes::SUCCESS);
            }
            let rows: Vec<MigrationRow> = candidates
                .iter()
                .map(|c| MigrationRow {
                    name: c.flatpak_name.clone(),
                    flatpak_version: c.flatpak_version.clone(),
                    native_version: c.native_version.clone(),
                    repo: c.repo.clone(),
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!("Apply one with `omniup migrate apply <flatpak-id>`.");
            Ok(exit_codes::SUCCESS)
        }
        MigrateCommands::Apply { flatpak_id } => {
            let candidate = candidates
                .into_iter()
                .find(|c| c.flatpak_id == flatpak_id)
                .ok_or_else(|| anyhow!("no migration candidate for '{flatpak_id}'"))?;
            apply_migration(&advisor, candidate).await
        }
    }
}

async fn apply_migration(
    advisor: &MigrationAdvisor,
    candidate: MigrationCandidate,
) -> Result<u8> {
    let mut engine = UpdateEngine::new();
    let native_id = engine.add_package(
        SourceType::Github,
        PackageSpec {
            id: candidate
                .repo
                .rsplit('/')
                .next()
                .unwrap_or(&candidate.flatpak_id)
                .to_lowercase(),
            name: Some(candidate.flatpak_name.clone()),
            repo: Some(candidate.repo.clone()),
            ..Default::default()
        },
    )?;

    println!(
        "Migrating {} ({} -> native {})...",
        candidate.flatpak_name, candidate.flatpak_version, candidate.native_version
    );

    let mut software = SoftwareInfo::new(
        &native_id,
        &candidate.flatpak_name,
        &candidate.flatpak_version,
        SourceType::Github,
    );
    software.latest_version = Some(candidate.native_version.clone());
    software.status = UpdateStatus::UpdateAvailable;

    let engine_ref = &mut engine;
    let migrated = advisor
        .migrate(&candidate, move || async move {
            engine_ref.install_update(&software).await
        })
        .await;
    if let Err(e) = migrated {
        // Stop tracking the package we set up for the installer, so a
        // failed migration does not leave a phantom entry behind.
        engine.remove_package(SourceType::Github, &native_id)?;
        return Err(e);
    }

    println!(
        "{} is now installed natively as '{native_id}'.",
        candidate.flatpak_name
    );
    Ok(exit_codes::SUCCESS)
}

fn handle_config(init: bool, path: bool) -> Result<()> {
    let config_file = platform::config_file();
    if path {
        println!("{}", config_file.display());
        return Ok(());
    }
    if init {
        if config_file.exists() {
            return Err(anyhow!(
                "config already exists at {}",
                config_file.display()
            ));
        }
        Config::default().save_to(&config_file)?;
        println!("Wrote default config to {}.", config_file.display());
        return Ok(());
    }

    let config = Config::load_from(&config_file);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn print_software_table(software: &[SoftwareInfo]) {
    if software.is_empty() {
        println!("Nothing is tracked yet. Add packages with `omniup add`.");
        return;
    }

    let rows: Vec<SoftwareRow> = software
        .iter()
        .map(|s| SoftwareRow {
            source: s.source_type.display_name().to_string(),
            name: s.name.clone(),
            version: s.display_version(),
            status: match s.status {
                UpdateStatus::UpdateAvailable => "update available".to_string(),
                UpdateStatus::UpToDate => "up to date".to_string(),
                UpdateStatus::Unknown => "-".to_string(),
                UpdateStatus::Error => s
                    .error_message
                    .clone()
                    .map(|m| format!("error: {m}"))
                    .unwrap_or_else(|| "error".to_string()),
            },
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn install_type_label(install_type: omniup::model::InstallType) -> &'static str {
    use omniup::model::InstallType;
    match install_type {
        InstallType::Dpkg => "system package",
        InstallType::OptDirectory => "/opt directory",
        InstallType::PortableBinary => "AppImage",
        InstallType::DesktopEntrySystem => "desktop entry (system)",
        InstallType::DesktopEntryUser => "desktop entry (user)",
    }
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("static template"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
