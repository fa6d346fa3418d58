//! Turns a user request into concrete work items.
//!
//! Expansion is a pure function of the request and the settings in effect:
//! the companion policy decides which codec variants exist, the fallback
//! chains decide what each variant may fall back to.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::error::{AppError, AppResult};
use crate::core::settings::AppSettings;
use crate::download::codec::{Format, MediaKind, SongCodec, VideoResolution};
use crate::download::options::DownloadOptions;
use crate::download::queue::WorkItem;

/// Hosts the downloader understands.
pub const SUPPORTED_HOSTS: &[&str] = &["music.apple.com", "beta.music.apple.com", "classical.music.apple.com"];

/// A logical download request as submitted by the user.
///
/// This is also the record format of export files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub urls: Vec<String>,
    #[serde(default)]
    pub options: Option<DownloadOptions>,
}

impl DownloadJob {
    pub fn new<S: Into<String>>(urls: impl IntoIterator<Item = S>) -> Self {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            options: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Which extra codec variants accompany a primary download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompanionPolicy {
    #[default]
    Disabled,
    /// Also fetch ALAC
    PrimaryToLossless,
    /// Also fetch ALAC and the universal AAC variant
    PrimaryToLosslessPlusLossy,
    /// A specialist primary also gets the universal AAC variant
    SpecialistToLossy,
}

impl CompanionPolicy {
    /// Ordered codec variants for a primary codec, primary first, no duplicates.
    pub fn plan(self, primary: SongCodec) -> Vec<SongCodec> {
        let mut plan = vec![primary];
        let mut add = |codec: SongCodec| {
            if !plan.contains(&codec) {
                plan.push(codec);
            }
        };

        match self {
            CompanionPolicy::Disabled => {}
            CompanionPolicy::PrimaryToLossless => add(SongCodec::Alac),
            CompanionPolicy::PrimaryToLosslessPlusLossy => {
                add(SongCodec::Alac);
                // A lossy primary already is the universal copy.
                if primary.is_specialist() {
                    add(SongCodec::UNIVERSAL);
                }
            }
            CompanionPolicy::SpecialistToLossy => {
                if primary.is_specialist() {
                    add(SongCodec::UNIVERSAL);
                }
            }
        }
        plan
    }
}

impl std::str::FromStr for CompanionPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Ok(CompanionPolicy::Disabled),
            "primary-to-lossless" => Ok(CompanionPolicy::PrimaryToLossless),
            "primary-to-lossless-plus-lossy" => Ok(CompanionPolicy::PrimaryToLosslessPlusLossy),
            "specialist-to-lossy" => Ok(CompanionPolicy::SpecialistToLossy),
            other => Err(AppError::UserInput(format!("unknown companion policy '{}'", other))),
        }
    }
}

/// Ordered substitutes, consumed left to right.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackChains {
    pub enabled: bool,
    pub music: Vec<SongCodec>,
    pub video: Vec<VideoResolution>,
}

/// Everything expansion depends on besides the request itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandContext {
    pub policy: CompanionPolicy,
    pub chains: FallbackChains,
    pub default_codec: SongCodec,
    pub default_resolution: VideoResolution,
}

impl ExpandContext {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            policy: settings.companion_policy,
            chains: FallbackChains {
                enabled: settings.fallback_enabled,
                music: settings.music_fallback_chain.clone(),
                video: settings.video_fallback_chain.clone(),
            },
            default_codec: settings.default_song_codec,
            default_resolution: settings.default_video_resolution,
        }
    }
}

/// Reject anything the downloader cannot be pointed at.
pub fn validate_urls(urls: &[String]) -> AppResult<()> {
    if urls.is_empty() {
        return Err(AppError::UserInput("at least one URL is required".to_string()));
    }

    for raw in urls {
        let url = Url::parse(raw.trim()).map_err(|e| AppError::UserInput(format!("invalid URL '{}': {}", raw, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::UserInput(format!("unsupported scheme in '{}'", raw)));
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !SUPPORTED_HOSTS.contains(&host.as_str()) {
            return Err(AppError::UserInput(format!("unsupported host '{}' in '{}'", host, raw)));
        }
    }
    Ok(())
}

/// `[requested]` followed by whatever the global chain lists after it.
///
/// When `requested` is not part of the chain the whole chain follows it.
/// Entries in `exclude` are dropped.
fn chain_after<T: Copy + PartialEq>(requested: T, global: &[T], exclude: &[T]) -> Vec<T> {
    let rest = match global.iter().position(|f| *f == requested) {
        Some(pos) => &global[pos + 1..],
        None => global,
    };

    let mut chain = vec![requested];
    for format in rest {
        if *format != requested && !exclude.contains(format) && !chain.contains(format) {
            chain.push(*format);
        }
    }
    chain
}

/// Expand one request into its work items, primary first.
///
/// Fails with `UserInput` before creating anything if the request is invalid.
pub fn expand(job: &DownloadJob, ctx: &ExpandContext) -> AppResult<Vec<WorkItem>> {
    validate_urls(&job.urls)?;

    let job_id = uuid::Uuid::new_v4().to_string();
    let overrides = job.options.as_ref();
    let media = MediaKind::detect(&job.urls);

    if media == MediaKind::MusicVideo {
        let requested = overrides
            .and_then(|o| o.music_video_resolution)
            .unwrap_or(ctx.default_resolution);
        let chain = if ctx.chains.enabled {
            chain_after(requested, &ctx.chains.video, &[])
        } else {
            vec![requested]
        };
        let formats = chain.into_iter().map(Format::Resolution).collect();
        let item = WorkItem::new(job, &job_id, media, Format::Resolution(requested), formats);
        return Ok(vec![item]);
    }

    let primary = overrides.and_then(|o| o.song_codec).unwrap_or(ctx.default_codec);
    let plan = ctx.policy.plan(primary);

    for (i, codec) in plan.iter().enumerate() {
        if plan[..i].contains(codec) {
            return Err(AppError::UserInput(format!("codec {} requested twice in one job", codec)));
        }
    }

    let tag_variants = plan.len() > 1;
    let companions = &plan[1..];

    let items = plan
        .iter()
        .enumerate()
        .map(|(i, codec)| {
            let chain = if i == 0 && ctx.chains.enabled {
                chain_after(*codec, &ctx.chains.music, companions)
            } else {
                // A companion exists to provide exactly its own format.
                vec![*codec]
            };
            let formats = chain.into_iter().map(Format::Codec).collect();
            let suffix = if tag_variants { codec.suffix() } else { None };

            WorkItem::new(job, &job_id, media, Format::Codec(*codec), formats)
                .specialist(codec.is_specialist())
                .suffix(suffix)
        })
        .collect::<Vec<_>>();

    log::debug!(
        "Expanded job {} into {} item(s): {}",
        job_id,
        items.len(),
        items.iter().map(|i| i.requested.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(items)
}
