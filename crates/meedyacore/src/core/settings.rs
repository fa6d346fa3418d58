//! User settings and the provider seam the engine reads them through.
//!
//! Settings are re-read for every expansion and every attempt, so a change on
//! disk applies to the next work item without restarting the engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::download::codec::{SongCodec, VideoResolution};
use crate::download::expander::CompanionPolicy;
use crate::download::options::{CoverFormat, DownloadMode, LyricsFormat, RemuxMode};

/// Global preferences, persisted as `settings.json`.
///
/// Unknown keys are ignored and missing keys take their defaults, so files
/// written by older versions keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    // --- General ---
    pub output_path: String,
    pub language: String,
    pub overwrite: bool,

    // --- Quality ---
    pub default_song_codec: SongCodec,
    pub default_video_resolution: VideoResolution,
    pub default_video_codec_priority: String,
    pub default_video_remux_format: String,

    // --- Fallback ---
    pub fallback_enabled: bool,
    pub music_fallback_chain: Vec<SongCodec>,
    pub video_fallback_chain: Vec<VideoResolution>,

    // --- Companions ---
    pub companion_policy: CompanionPolicy,

    // --- Lyrics ---
    pub synced_lyrics_format: LyricsFormat,
    pub no_synced_lyrics: bool,
    pub synced_lyrics_only: bool,

    // --- Cover art ---
    pub save_cover: bool,
    pub cover_format: CoverFormat,
    pub cover_size: u32,

    // --- Templates ---
    pub album_folder_template: String,
    pub compilation_folder_template: String,
    pub no_album_folder_template: String,
    pub single_disc_file_template: String,
    pub multi_disc_file_template: String,
    pub no_album_file_template: String,
    pub playlist_file_template: String,

    // --- Tool paths (None = managed installation) ---
    pub cookies_path: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub mp4decrypt_path: Option<String>,
    pub mp4box_path: Option<String>,
    pub nm3u8dlre_path: Option<String>,

    // --- Advanced ---
    pub download_mode: DownloadMode,
    pub remux_mode: RemuxMode,
    pub use_wrapper: bool,
    pub wrapper_account_url: String,
    pub truncate: Option<u32>,
    pub exclude_tags: Vec<String>,

    /// Tag ALAC and spatial downloads after they complete
    pub embed_codec_metadata: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            output_path: String::new(),
            language: "en-US".to_string(),
            overwrite: false,

            default_song_codec: SongCodec::Alac,
            default_video_resolution: VideoResolution::P2160,
            default_video_codec_priority: "h265,h264".to_string(),
            default_video_remux_format: "m4v".to_string(),

            // Best quality first, most compatible last
            fallback_enabled: true,
            music_fallback_chain: vec![
                SongCodec::Alac,
                SongCodec::Atmos,
                SongCodec::Ac3,
                SongCodec::AacBinaural,
                SongCodec::Aac,
                SongCodec::AacLegacy,
            ],
            video_fallback_chain: VideoResolution::ALL.to_vec(),

            companion_policy: CompanionPolicy::Disabled,

            synced_lyrics_format: LyricsFormat::Lrc,
            no_synced_lyrics: false,
            synced_lyrics_only: false,

            save_cover: true,
            cover_format: CoverFormat::Raw,
            cover_size: 1200,

            album_folder_template: "{album_artist}/{album}".to_string(),
            compilation_folder_template: "Compilations/{album}".to_string(),
            no_album_folder_template: "{artist}/Unknown Album".to_string(),
            single_disc_file_template: "{track:02d} {title}".to_string(),
            multi_disc_file_template: "{disc}-{track:02d} {title}".to_string(),
            no_album_file_template: "{title}".to_string(),
            playlist_file_template: "Playlists/{playlist_artist}/{playlist_title}".to_string(),

            cookies_path: None,
            ffmpeg_path: None,
            mp4decrypt_path: None,
            mp4box_path: None,
            nm3u8dlre_path: None,

            download_mode: DownloadMode::Ytdlp,
            remux_mode: RemuxMode::Ffmpeg,
            use_wrapper: false,
            wrapper_account_url: "http://127.0.0.1:30020".to_string(),
            truncate: None,
            exclude_tags: Vec::new(),

            embed_codec_metadata: true,
        }
    }
}

/// Source of the current settings.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> AppSettings;
}

/// In-memory settings, replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    inner: Arc<RwLock<AppSettings>>,
}

impl StaticSettings {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn replace(&self, settings: AppSettings) {
        match self.inner.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> AppSettings {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Settings read from a JSON file on every call.
///
/// A missing or unreadable file yields the defaults.
#[derive(Debug, Clone)]
pub struct JsonSettingsFile {
    path: PathBuf,
}

impl JsonSettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SettingsProvider for JsonSettingsFile {
    fn settings(&self) -> AppSettings {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No settings at {}, using defaults", self.path.display());
                return AppSettings::default();
            }
            Err(e) => {
                log::warn!("Cannot read settings {}: {}", self.path.display(), e);
                return AppSettings::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("Corrupt settings {}: {}, using defaults", self.path.display(), e);
            AppSettings::default()
        })
    }
}
