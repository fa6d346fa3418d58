//! Typed downloader options.
//!
//! Every field is optional: global settings fill the base, per-job overrides
//! replace whatever they set, and only `Some` fields become CLI flags.

use serde::{Deserialize, Serialize};

use crate::core::settings::AppSettings;
use crate::download::codec::{Format, SongCodec, VideoResolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LyricsFormat {
    Lrc,
    Srt,
    Ttml,
}

impl LyricsFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LyricsFormat::Lrc => "lrc",
            LyricsFormat::Srt => "srt",
            LyricsFormat::Ttml => "ttml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverFormat {
    Jpg,
    Png,
    Raw,
}

impl CoverFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverFormat::Jpg => "jpg",
            CoverFormat::Png => "png",
            CoverFormat::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Ytdlp,
    Nm3u8dlre,
}

impl DownloadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMode::Ytdlp => "ytdlp",
            DownloadMode::Nm3u8dlre => "nm3u8dlre",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemuxMode {
    Ffmpeg,
    Mp4box,
}

impl RemuxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RemuxMode::Ffmpeg => "ffmpeg",
            RemuxMode::Mp4box => "mp4box",
        }
    }
}

/// Downloader CLI options, used both as per-job overrides and as the merged result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadOptions {
    // --- Quality ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub song_codec: Option<SongCodec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub music_video_resolution: Option<VideoResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub music_video_codec_priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub music_video_remux_format: Option<String>,

    // --- Lyrics ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_lyrics_format: Option<LyricsFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_synced_lyrics: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_lyrics_only: Option<bool>,

    // --- Cover art ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_cover: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_format: Option<CoverFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_size: Option<u32>,

    // --- Output ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncate: Option<u32>,

    // --- Authentication ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_wrapper: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapper_account_url: Option<String>,

    // --- Metadata ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_tags: Option<String>,

    // --- Templates ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_folder_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compilation_folder_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_album_folder_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_disc_file_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_disc_file_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_album_file_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_file_template: Option<String>,

    // --- Tool paths ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp4decrypt_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mp4box_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nm3u8dlre_path: Option<String>,

    // --- Modes ---
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_mode: Option<DownloadMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remux_mode: Option<RemuxMode>,
}

/// Copy every `Some` field of `$src` over `$dst`.
macro_rules! overlay_fields {
    ($dst:ident, $src:ident; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl DownloadOptions {
    /// Build the base options from global settings.
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            song_codec: Some(settings.default_song_codec),
            music_video_resolution: Some(settings.default_video_resolution),
            music_video_codec_priority: Some(settings.default_video_codec_priority.clone()),
            music_video_remux_format: Some(settings.default_video_remux_format.clone()),
            synced_lyrics_format: Some(settings.synced_lyrics_format),
            no_synced_lyrics: Some(settings.no_synced_lyrics),
            synced_lyrics_only: Some(settings.synced_lyrics_only),
            save_cover: Some(settings.save_cover),
            cover_format: Some(settings.cover_format),
            cover_size: Some(settings.cover_size),
            output_path: Some(settings.output_path.clone()).filter(|p| !p.is_empty()),
            temp_path: None,
            overwrite: Some(settings.overwrite),
            truncate: settings.truncate,
            cookies_path: settings.cookies_path.clone(),
            use_wrapper: Some(settings.use_wrapper),
            wrapper_account_url: Some(settings.wrapper_account_url.clone()),
            language: Some(settings.language.clone()),
            exclude_tags: Some(settings.exclude_tags.join(",")).filter(|t| !t.is_empty()),
            album_folder_template: Some(settings.album_folder_template.clone()),
            compilation_folder_template: Some(settings.compilation_folder_template.clone()),
            no_album_folder_template: Some(settings.no_album_folder_template.clone()),
            single_disc_file_template: Some(settings.single_disc_file_template.clone()),
            multi_disc_file_template: Some(settings.multi_disc_file_template.clone()),
            no_album_file_template: Some(settings.no_album_file_template.clone()),
            playlist_file_template: Some(settings.playlist_file_template.clone()),
            ffmpeg_path: settings.ffmpeg_path.clone(),
            mp4decrypt_path: settings.mp4decrypt_path.clone(),
            mp4box_path: settings.mp4box_path.clone(),
            nm3u8dlre_path: settings.nm3u8dlre_path.clone(),
            download_mode: Some(settings.download_mode),
            remux_mode: Some(settings.remux_mode),
        }
    }

    /// Global settings with the job's overrides on top.
    pub fn merged(settings: &AppSettings, overrides: Option<&DownloadOptions>) -> Self {
        let mut options = Self::from_settings(settings);
        if let Some(overrides) = overrides {
            options.overlay(overrides);
        }
        options
    }

    /// Replace every field that `other` sets.
    pub fn overlay(&mut self, other: &DownloadOptions) {
        overlay_fields!(self, other;
            song_codec, music_video_resolution, music_video_codec_priority,
            music_video_remux_format, synced_lyrics_format, no_synced_lyrics,
            synced_lyrics_only, save_cover, cover_format, cover_size, output_path,
            temp_path, overwrite, truncate, cookies_path, use_wrapper,
            wrapper_account_url, language, exclude_tags, album_folder_template,
            compilation_folder_template, no_album_folder_template,
            single_disc_file_template, multi_disc_file_template,
            no_album_file_template, playlist_file_template, ffmpeg_path,
            mp4decrypt_path, mp4box_path, nm3u8dlre_path, download_mode, remux_mode,
        );
    }

    /// Pin the format a work item is currently attempting.
    pub fn set_format(&mut self, format: Format) {
        match format {
            Format::Codec(codec) => self.song_codec = Some(codec),
            Format::Resolution(res) => self.music_video_resolution = Some(res),
        }
    }

    /// Append a suffix tag to every file name template.
    ///
    /// Folder templates stay untouched so companions land in the same album folder.
    pub fn apply_suffix(&mut self, suffix: &str) {
        for template in [
            &mut self.single_disc_file_template,
            &mut self.multi_disc_file_template,
            &mut self.no_album_file_template,
        ]
        .into_iter()
        .flatten()
        {
            template.push(' ');
            template.push_str(suffix);
        }
    }

    /// Render the options as downloader arguments. Only `Some` fields produce flags.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        fn value(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
            if let Some(v) = value {
                args.push(flag.to_string());
                args.push(v.to_string());
            }
        }
        fn switch(args: &mut Vec<String>, flag: &str, on: Option<bool>) {
            if on == Some(true) {
                args.push(flag.to_string());
            }
        }

        value(&mut args, "--song-codec", self.song_codec.map(SongCodec::as_str));
        value(
            &mut args,
            "--music-video-codec-priority",
            self.music_video_codec_priority.as_deref(),
        );
        value(
            &mut args,
            "--music-video-resolution",
            self.music_video_resolution.map(VideoResolution::as_str),
        );
        value(&mut args, "--music-video-remux-format", self.music_video_remux_format.as_deref());

        value(&mut args, "--synced-lyrics-format", self.synced_lyrics_format.map(LyricsFormat::as_str));
        switch(&mut args, "--no-synced-lyrics", self.no_synced_lyrics);
        switch(&mut args, "--synced-lyrics-only", self.synced_lyrics_only);

        switch(&mut args, "--save-cover", self.save_cover);
        value(&mut args, "--cover-format", self.cover_format.map(CoverFormat::as_str));
        if let Some(size) = self.cover_size {
            args.push("--cover-size".to_string());
            args.push(format!("{}x{}", size, size));
        }

        value(&mut args, "--output-path", self.output_path.as_deref());
        value(&mut args, "--temp-path", self.temp_path.as_deref());
        switch(&mut args, "--overwrite", self.overwrite);
        if let Some(truncate) = self.truncate {
            args.push("--truncate".to_string());
            args.push(truncate.to_string());
        }

        value(&mut args, "--cookies-path", self.cookies_path.as_deref());
        switch(&mut args, "--use-wrapper", self.use_wrapper);
        value(&mut args, "--wrapper-account-url", self.wrapper_account_url.as_deref());

        value(&mut args, "--language", self.language.as_deref());
        value(&mut args, "--exclude-tags", self.exclude_tags.as_deref());

        value(&mut args, "--album-folder-template", self.album_folder_template.as_deref());
        value(
            &mut args,
            "--compilation-folder-template",
            self.compilation_folder_template.as_deref(),
        );
        value(&mut args, "--no-album-folder-template", self.no_album_folder_template.as_deref());
        value(&mut args, "--single-disc-file-template", self.single_disc_file_template.as_deref());
        value(&mut args, "--multi-disc-file-template", self.multi_disc_file_template.as_deref());
        value(&mut args, "--no-album-file-template", self.no_album_file_template.as_deref());
        value(&mut args, "--playlist-file-template", self.playlist_file_template.as_deref());

        value(&mut args, "--ffmpeg-path", self.ffmpeg_path.as_deref());
        value(&mut args, "--mp4decrypt-path", self.mp4decrypt_path.as_deref());
        value(&mut args, "--mp4box-path", self.mp4box_path.as_deref());
        value(&mut args, "--nm3u8dlre-path", self.nm3u8dlre_path.as_deref());

        value(&mut args, "--download-mode", self.download_mode.map(DownloadMode::as_str));
        value(&mut args, "--remux-mode", self.remux_mode.map(RemuxMode::as_str));

        args
    }
}
