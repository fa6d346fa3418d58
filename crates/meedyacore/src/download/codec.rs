//! Audio codecs, video resolutions and the formats a work item can request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::AppError;

/// Audio codec accepted by the downloader's `--song-codec` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SongCodec {
    Alac,
    Atmos,
    Ac3,
    AacBinaural,
    Aac,
    AacLegacy,
    AacHeLegacy,
    AacHe,
    AacDownmix,
    AacHeBinaural,
    AacHeDownmix,
}

/// Quality class of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecClass {
    Lossless,
    Spatial,
    Lossy,
}

impl SongCodec {
    pub const ALL: [SongCodec; 11] = [
        SongCodec::Alac,
        SongCodec::Atmos,
        SongCodec::Ac3,
        SongCodec::AacBinaural,
        SongCodec::Aac,
        SongCodec::AacLegacy,
        SongCodec::AacHeLegacy,
        SongCodec::AacHe,
        SongCodec::AacDownmix,
        SongCodec::AacHeBinaural,
        SongCodec::AacHeDownmix,
    ];

    /// The codec every player can handle; used for companion downloads.
    pub const UNIVERSAL: SongCodec = SongCodec::AacLegacy;

    /// Value passed to `--song-codec`.
    pub fn as_str(self) -> &'static str {
        match self {
            SongCodec::Alac => "alac",
            SongCodec::Atmos => "atmos",
            SongCodec::Ac3 => "ac3",
            SongCodec::AacBinaural => "aac-binaural",
            SongCodec::Aac => "aac",
            SongCodec::AacLegacy => "aac-legacy",
            SongCodec::AacHeLegacy => "aac-he-legacy",
            SongCodec::AacHe => "aac-he",
            SongCodec::AacDownmix => "aac-downmix",
            SongCodec::AacHeBinaural => "aac-he-binaural",
            SongCodec::AacHeDownmix => "aac-he-downmix",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SongCodec::Alac => "Lossless (ALAC)",
            SongCodec::Atmos => "Dolby Atmos",
            SongCodec::Ac3 => "Dolby Digital (AC3)",
            SongCodec::AacBinaural => "AAC Binaural",
            SongCodec::Aac => "AAC",
            SongCodec::AacLegacy => "AAC Legacy",
            SongCodec::AacHeLegacy => "AAC-HE Legacy",
            SongCodec::AacHe => "AAC-HE",
            SongCodec::AacDownmix => "AAC Downmix",
            SongCodec::AacHeBinaural => "AAC-HE Binaural",
            SongCodec::AacHeDownmix => "AAC-HE Downmix",
        }
    }

    pub fn class(self) -> CodecClass {
        match self {
            SongCodec::Alac => CodecClass::Lossless,
            SongCodec::Atmos | SongCodec::Ac3 => CodecClass::Spatial,
            _ => CodecClass::Lossy,
        }
    }

    /// Lossless and spatial codecs are specialist; the AAC family is universal.
    pub fn is_specialist(self) -> bool {
        self.class() != CodecClass::Lossy
    }

    /// Human label for the spatial format, written into file metadata.
    pub fn spatial_label(self) -> Option<&'static str> {
        match self {
            SongCodec::Atmos => Some("Dolby Atmos"),
            SongCodec::Ac3 => Some("Dolby Digital"),
            _ => None,
        }
    }

    /// Filename tag that keeps a specialist copy apart from its siblings.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            SongCodec::Alac => Some("[Lossless]"),
            SongCodec::Atmos => Some("[Dolby Atmos]"),
            SongCodec::Ac3 => Some("[Dolby Digital]"),
            _ => None,
        }
    }
}

impl fmt::Display for SongCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SongCodec {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SongCodec::ALL
            .into_iter()
            .find(|codec| codec.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AppError::UserInput(format!("unknown codec '{}'", wanted)))
    }
}

/// Music video resolution accepted by `--music-video-resolution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoResolution {
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "540p")]
    P540,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "240p")]
    P240,
}

impl VideoResolution {
    pub const ALL: [VideoResolution; 8] = [
        VideoResolution::P2160,
        VideoResolution::P1440,
        VideoResolution::P1080,
        VideoResolution::P720,
        VideoResolution::P540,
        VideoResolution::P480,
        VideoResolution::P360,
        VideoResolution::P240,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VideoResolution::P2160 => "2160p",
            VideoResolution::P1440 => "1440p",
            VideoResolution::P1080 => "1080p",
            VideoResolution::P720 => "720p",
            VideoResolution::P540 => "540p",
            VideoResolution::P480 => "480p",
            VideoResolution::P360 => "360p",
            VideoResolution::P240 => "240p",
        }
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoResolution {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        VideoResolution::ALL
            .into_iter()
            .find(|res| res.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AppError::UserInput(format!("unknown resolution '{}'", wanted)))
    }
}

/// What a single work item asks the downloader for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Codec(SongCodec),
    Resolution(VideoResolution),
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Codec(codec) => codec.as_str(),
            Format::Resolution(res) => res.as_str(),
        }
    }

    pub fn codec(self) -> Option<SongCodec> {
        match self {
            Format::Codec(codec) => Some(codec),
            Format::Resolution(_) => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Songs, albums and playlists use codecs; music videos use resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Song,
    MusicVideo,
}

impl MediaKind {
    /// A job is a music video job only when every URL points at one.
    pub fn detect<S: AsRef<str>>(urls: &[S]) -> Self {
        if !urls.is_empty() && urls.iter().all(|u| u.as_ref().contains("/music-video/")) {
            MediaKind::MusicVideo
        } else {
            MediaKind::Song
        }
    }
}
