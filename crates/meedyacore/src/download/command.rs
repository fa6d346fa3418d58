//! Downloader command line construction.
//!
//! [`BinaryResolver`] is the seam to whatever provisions the Python runtime
//! and helper tools; the engine only asks it where things are.

use std::path::{Path, PathBuf};

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::settings::AppSettings;
use crate::download::options::DownloadOptions;
use crate::download::queue::WorkItem;

/// Program plus the arguments that precede the URLs, e.g. `python3 -m gamdl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

/// Helper tools the downloader can be pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Mp4decrypt,
    Mp4box,
    Nm3u8dlre,
}

impl Tool {
    pub fn binary_name(self) -> &'static str {
        let base = match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Mp4decrypt => "mp4decrypt",
            Tool::Mp4box => "MP4Box",
            Tool::Nm3u8dlre => "N_m3u8DL-RE",
        };
        if cfg!(windows) {
            match self {
                Tool::Ffmpeg => "ffmpeg.exe",
                Tool::Mp4decrypt => "mp4decrypt.exe",
                Tool::Mp4box => "MP4Box.exe",
                Tool::Nm3u8dlre => "N_m3u8DL-RE.exe",
            }
        } else {
            base
        }
    }
}

/// Where the downloader and its helpers live.
pub trait BinaryResolver: Send + Sync {
    fn downloader(&self) -> AppResult<DownloaderCommand>;

    /// Managed helper binary, used when settings do not name one.
    fn tool_path(&self, _tool: Tool) -> Option<PathBuf> {
        None
    }

    /// Downloader config file passed as `--config-path`.
    fn config_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Resolves `python -m gamdl` and tools from the configured locations.
#[derive(Debug, Clone)]
pub struct ManagedBinaryResolver {
    python: String,
    tools_dir: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl Default for ManagedBinaryResolver {
    fn default() -> Self {
        Self {
            python: config::PYTHON_BIN.clone(),
            tools_dir: config::TOOLS_DIR.as_deref().map(config::expand_path),
            config_path: config::GAMDL_CONFIG.as_deref().map(config::expand_path),
        }
    }
}

impl ManagedBinaryResolver {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            tools_dir: None,
            config_path: None,
        }
    }

    #[must_use]
    pub fn tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

impl BinaryResolver for ManagedBinaryResolver {
    fn downloader(&self) -> AppResult<DownloaderCommand> {
        // A bare name is looked up in PATH at spawn time; an explicit path must exist.
        let looks_like_path = self.python.contains(std::path::MAIN_SEPARATOR) || self.python.contains('/');
        if looks_like_path && !Path::new(&self.python).exists() {
            return Err(AppError::Spawn(format!("Python interpreter not found at {}", self.python)));
        }
        Ok(DownloaderCommand {
            program: self.python.clone(),
            leading_args: vec!["-m".to_string(), "gamdl".to_string()],
        })
    }

    fn tool_path(&self, tool: Tool) -> Option<PathBuf> {
        let candidate = self.tools_dir.as_ref()?.join(tool.binary_name());
        candidate.exists().then_some(candidate)
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.config_path.clone().filter(|p| p.exists())
    }
}

/// Fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Options for the item's current attempt: settings, job overrides, pinned format, suffix.
pub fn attempt_options(item: &WorkItem, settings: &AppSettings) -> DownloadOptions {
    let mut options = DownloadOptions::merged(settings, item.overrides.as_ref());
    options.set_format(item.requested);
    if let Some(suffix) = &item.suffix {
        options.apply_suffix(suffix);
    }
    options
}

/// Fill tool paths the options leave unset with managed installations.
fn fill_tool_paths(options: &mut DownloadOptions, resolver: &dyn BinaryResolver) {
    let slots = [
        (Tool::Ffmpeg, &mut options.ffmpeg_path),
        (Tool::Mp4decrypt, &mut options.mp4decrypt_path),
        (Tool::Mp4box, &mut options.mp4box_path),
        (Tool::Nm3u8dlre, &mut options.nm3u8dlre_path),
    ];
    for (tool, slot) in slots {
        if slot.is_none() {
            *slot = resolver
                .tool_path(tool)
                .map(|p| p.to_string_lossy().into_owned());
        }
    }
}

/// Build the command line for the item's current attempt.
pub fn build_invocation(
    item: &WorkItem,
    settings: &AppSettings,
    resolver: &dyn BinaryResolver,
) -> AppResult<Invocation> {
    let command = resolver.downloader()?;
    let mut options = attempt_options(item, settings);
    fill_tool_paths(&mut options, resolver);

    let mut args = command.leading_args;
    args.extend(item.urls.iter().cloned());
    args.extend(options.to_cli_args());
    if let Some(config_path) = resolver.config_path() {
        args.push("--config-path".to_string());
        args.push(config_path.to_string_lossy().into_owned());
    }

    Ok(Invocation {
        program: command.program,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::codec::{Format, MediaKind, SongCodec};
    use crate::download::expander::DownloadJob;

    struct FixedResolver {
        tools: PathBuf,
    }

    impl BinaryResolver for FixedResolver {
        fn downloader(&self) -> AppResult<DownloaderCommand> {
            Ok(DownloaderCommand {
                program: "python3".to_string(),
                leading_args: vec!["-m".to_string(), "gamdl".to_string()],
            })
        }

        fn tool_path(&self, tool: Tool) -> Option<PathBuf> {
            (tool == Tool::Ffmpeg).then(|| self.tools.join("ffmpeg"))
        }
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn item(codec: SongCodec, suffix: Option<&str>) -> WorkItem {
        let job = DownloadJob::new(["https://music.apple.com/us/album/x/1"]);
        let format = Format::Codec(codec);
        WorkItem::new(&job, "j", MediaKind::Song, format, vec![format]).suffix(suffix)
    }

    #[test]
    fn test_invocation_layout() {
        let resolver = FixedResolver {
            tools: PathBuf::from("/opt/tools"),
        };
        let invocation = build_invocation(&item(SongCodec::Atmos, None), &AppSettings::default(), &resolver).unwrap();

        assert_eq!(invocation.program, "python3");
        assert_eq!(&invocation.args[..3], &["-m", "gamdl", "https://music.apple.com/us/album/x/1"]);
        assert_eq!(flag_value(&invocation.args, "--song-codec"), Some("atmos"));
        assert_eq!(flag_value(&invocation.args, "--ffmpeg-path"), Some("/opt/tools/ffmpeg"));
        assert_eq!(flag_value(&invocation.args, "--mp4box-path"), None);
        assert!(!invocation.args.contains(&"--config-path".to_string()));
    }

    #[test]
    fn test_settings_tool_path_wins_over_managed() {
        let resolver = FixedResolver {
            tools: PathBuf::from("/opt/tools"),
        };
        let settings = AppSettings {
            ffmpeg_path: Some("/usr/bin/ffmpeg".to_string()),
            ..Default::default()
        };
        let invocation = build_invocation(&item(SongCodec::Alac, None), &settings, &resolver).unwrap();
        assert_eq!(flag_value(&invocation.args, "--ffmpeg-path"), Some("/usr/bin/ffmpeg"));
    }

    #[test]
    fn test_suffix_reaches_file_templates() {
        let resolver = FixedResolver {
            tools: PathBuf::from("/opt/tools"),
        };
        let invocation = build_invocation(
            &item(SongCodec::Alac, Some("[Lossless]")),
            &AppSettings::default(),
            &resolver,
        )
        .unwrap();
        assert_eq!(
            flag_value(&invocation.args, "--single-disc-file-template"),
            Some("{track:02d} {title} [Lossless]")
        );
    }

    #[test]
    fn test_managed_resolver_missing_interpreter() {
        let resolver = ManagedBinaryResolver::new("/nonexistent/bin/python3");
        assert!(matches!(resolver.downloader(), Err(AppError::Spawn(_))));
    }

    #[test]
    fn test_managed_resolver_tools_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(Tool::Mp4decrypt.binary_name()), b"").unwrap();
        let resolver = ManagedBinaryResolver::new("python3").tools_dir(dir.path());

        assert_eq!(
            resolver.tool_path(Tool::Mp4decrypt),
            Some(dir.path().join(Tool::Mp4decrypt.binary_name()))
        );
        assert_eq!(resolver.tool_path(Tool::Ffmpeg), None);
        assert_eq!(resolver.downloader().unwrap().leading_args, vec!["-m", "gamdl"]);
    }
}
