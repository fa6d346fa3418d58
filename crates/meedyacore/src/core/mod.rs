//! Configuration, errors, logging and process helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod settings;

pub use config::EngineConfig;
pub use error::{AppError, AppResult};
pub use logging::init_logger;
pub use settings::{AppSettings, JsonSettingsFile, SettingsProvider, StaticSettings};
