pub mod backup;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod history;
pub mod migration;
pub mod model;
pub mod platform;
pub mod scanner;
pub mod source;
pub mod store;
pub mod version;

pub use config::Config;
pub use engine::UpdateEngine;
pub use error::SourceError;
pub use model::{SoftwareInfo, SourceType, UpdateStatus};
pub use scanner::SoftwareScanner;
