//! MeedyaCore - download orchestration engine for the gamdl downloader
//!
//! Turns download requests into queued work items, runs the downloader as a
//! supervised subprocess with quality fallback, reports progress as events and
//! keeps the queue on disk so that it survives restarts.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, settings, logging and process helpers
//! - `download`: codecs, job expansion, output parsing, queue and workers
//! - `storage`: queue snapshots and export files
//! - `engine`: the command surface tying it all together

pub mod core;
pub mod download;
pub mod engine;
pub mod storage;

// Re-export commonly used types for convenience
pub use self::core::{config, AppError, AppResult, AppSettings, EngineConfig, SettingsProvider};
pub use download::{DownloadJob, DownloadState, EngineEvent, OutputEvent, QueueSnapshot, WorkItem};
pub use engine::DownloadEngine;
