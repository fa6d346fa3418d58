//! Downloader output parsing.
//!
//! The downloader prints free-form text on stdout and stderr. [`LineBuffer`]
//! cuts the raw byte stream into lines and [`parse_line`] classifies each line
//! with an ordered rule table. The first matching rule wins; anything left over
//! is [`OutputEvent::Unrecognized`].

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Structured view of one output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// "Getting track 3 of 12: Title by Artist"
    TrackInfo {
        title: String,
        artist: String,
        album: Option<String>,
        index: Option<u32>,
        total: Option<u32>,
    },
    /// Percent of the current file
    Progress { percent: f64, speed: String, eta: String },
    /// Post-download stage such as remuxing or tagging
    ProcessingStep { step: String },
    Error { message: String },
    /// Final output location
    Complete { path: String },
    Unrecognized { raw: String },
}

impl OutputEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutputEvent::TrackInfo { .. } => "track_info",
            OutputEvent::Progress { .. } => "progress",
            OutputEvent::ProcessingStep { .. } => "processing_step",
            OutputEvent::Error { .. } => "error",
            OutputEvent::Complete { .. } => "complete",
            OutputEvent::Unrecognized { .. } => "unrecognized",
        }
    }
}

struct Rule {
    name: &'static str,
    regex: Regex,
    build: fn(&Captures<'_>, &str) -> Option<OutputEvent>,
}

impl Rule {
    // Patterns are literals in RULES; a bad one fails every parser test.
    #[allow(clippy::expect_used)]
    fn new(name: &'static str, pattern: &str, build: fn(&Captures<'_>, &str) -> Option<OutputEvent>) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).expect("output rule regex"),
            build,
        }
    }
}

fn capture(caps: &Captures<'_>, i: usize) -> String {
    caps.get(i).map(|m| m.as_str().trim().to_string()).unwrap_or_default()
}

fn percent(caps: &Captures<'_>, i: usize) -> Option<f64> {
    caps.get(i)?
        .as_str()
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite())
        .map(|p| p.clamp(0.0, 100.0))
}

fn track_info(caps: &Captures<'_>, _line: &str) -> Option<OutputEvent> {
    let index = caps.get(2).and_then(|m| m.as_str().parse().ok());
    let total = caps.get(3).and_then(|m| m.as_str().parse().ok());
    let text = capture(caps, 4);

    // Titles can contain " by " themselves; the artist is after the last one.
    let (title, artist) = match text.rfind(" by ") {
        Some(pos) => (text[..pos].trim().to_string(), text[pos + 4..].trim().to_string()),
        None => (text, String::new()),
    };

    Some(OutputEvent::TrackInfo {
        title,
        artist,
        album: None,
        index,
        total,
    })
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        // [download]  45.2% of ~ 5.12MiB at 2.51MiB/s ETA 00:01
        Rule::new(
            "ytdlp_progress",
            r"\[download\]\s+(\d+(?:\.\d+)?)%\s+of\s+~?\s*(\S+)\s+at\s+(\S+)\s+ETA\s+(\S+)",
            |caps, _| {
                Some(OutputEvent::Progress {
                    percent: percent(caps, 1)?,
                    speed: capture(caps, 3),
                    eta: capture(caps, 4),
                })
            },
        ),
        // [download] 100% of 5.12MiB in 00:02
        Rule::new("ytdlp_finished", r"\[download\]\s+100(?:\.0+)?%\s+of\s+(\S+)\s+in\s+(\S+)", |_, _| {
            Some(OutputEvent::Progress {
                percent: 100.0,
                speed: String::new(),
                eta: "00:00".to_string(),
            })
        }),
        // 45% 2.3MB/s 00:30 remaining
        Rule::new(
            "compact_progress",
            r"^(\d+(?:\.\d+)?)%\s+(\S+/s)\s+(\S+)\s+remaining",
            |caps, _| {
                Some(OutputEvent::Progress {
                    percent: percent(caps, 1)?,
                    speed: capture(caps, 2),
                    eta: capture(caps, 3),
                })
            },
        ),
        Rule::new(
            "track_info",
            r"Getting\s+(song|track\s+(\d+)\s+of\s+(\d+)):\s+(.+)",
            track_info,
        ),
        Rule::new("error_prefix", r"(?i)^error:?\s+(.+)", |caps, _| {
            Some(OutputEvent::Error {
                message: capture(caps, 1),
            })
        }),
        Rule::new(
            "processing_step",
            r"^(?:Remuxing|Tagging|Embedding|Applying|Converting|Decrypting)\b",
            |_, line| {
                Some(OutputEvent::ProcessingStep {
                    step: line.to_string(),
                })
            },
        ),
        Rule::new("saved_to", r"(?i)saved\s+to:?\s+(.+)", |caps, _| {
            let path = capture(caps, 1);
            (!path.is_empty()).then_some(OutputEvent::Complete { path })
        }),
        Rule::new(
            "error_keyword",
            r"(?i)failed|not found|permission denied|codec not available|no entry|traceback|exception",
            |_, line| {
                Some(OutputEvent::Error {
                    message: line.to_string(),
                })
            },
        ),
    ]
});

/// Classify a single line of downloader output.
///
/// Never fails: lines no rule understands come back as `Unrecognized`.
pub fn parse_line(line: &str) -> OutputEvent {
    let line = line.trim();
    if line.is_empty() {
        return OutputEvent::Unrecognized { raw: String::new() };
    }

    for rule in RULES.iter() {
        if let Some(caps) = rule.regex.captures(line) {
            if let Some(event) = (rule.build)(&caps, line) {
                log::trace!("output rule {} matched: {}", rule.name, line);
                return event;
            }
        }
    }

    log::trace!("unrecognized output: {}", line);
    OutputEvent::Unrecognized { raw: line.to_string() }
}

/// Accumulates raw pipe bytes and hands out complete lines.
///
/// `\n` and `\r` both end a line; progress bars redraw with a bare `\r`.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush a trailing line that never got its terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
