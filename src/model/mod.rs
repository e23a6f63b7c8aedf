//! Core data types shared across sources, scanner and engine.
//!
//! - [`SoftwareInfo`] - canonical record for one trackable application
//! - [`SourceType`] - the update origin an item belongs to
//! - [`UpdateStatus`] - result of the latest update check
//! - [`DownloadResult`] / [`InstallResult`] / [`UninstallResult`] - plugin
//!   operation outcomes
//! - [`DetectedSoftware`] - the scanner's raw finding before source matching

mod detected;
mod software;

pub use detected::*;
pub use software::*;
