//! Classification of failed download attempts.
//!
//! Only [`FailureKind::FormatUnavailable`] moves an item along its fallback
//! chain. Everything else is final for the attempt; a non-zero exit code on its
//! own never triggers a fallback.

use serde::{Deserialize, Serialize};

/// Why a download attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Cookies expired or the account is not signed in
    Auth,
    /// Timeouts, refused connections, DNS
    Network,
    /// The requested codec or resolution does not exist for this content
    FormatUnavailable,
    /// The catalog item does not exist
    NotFound,
    /// The service is throttling us
    RateLimited,
    /// A helper binary (ffmpeg, mp4decrypt, ...) crashed
    Tool,
    Unknown,
}

const AUTH: &[&str] = &["cookie", "auth", "login", "sign in"];
const NETWORK: &[&str] = &["network", "timeout", "timed out", "connection", "dns"];
const FORMAT_UNAVAILABLE: &[&str] = &[
    "codec not available",
    "no matching codec",
    "format not available",
    "unable to find matching codec",
    "requested codec",
    "not available in the requested",
    "drm",
    "no such resolution",
];
const NOT_FOUND: &[&str] = &["not found", "404", "no results"];
const RATE_LIMITED: &[&str] = &["rate limit", "429", "too many"];
const TOOL: &[&str] = &["ffmpeg", "mp4decrypt", "mp4box", "nm3u8dl"];

/// Analyze an error message and determine the failure kind.
///
/// Matching is case-insensitive and the first group that matches wins.
pub fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(AUTH) {
        FailureKind::Auth
    } else if any(NETWORK) {
        FailureKind::Network
    } else if any(FORMAT_UNAVAILABLE) {
        FailureKind::FormatUnavailable
    } else if any(NOT_FOUND) {
        FailureKind::NotFound
    } else if any(RATE_LIMITED) {
        FailureKind::RateLimited
    } else if any(TOOL) {
        FailureKind::Tool
    } else {
        FailureKind::Unknown
    }
}

impl FailureKind {
    /// Whether the next entry of the fallback chain should be tried.
    pub fn advances_fallback(self) -> bool {
        self == FailureKind::FormatUnavailable
    }

    /// Short hint shown next to the raw error.
    pub fn hint(self) -> &'static str {
        match self {
            FailureKind::Auth => "Check that your cookies file is current",
            FailureKind::Network => "Check your network connection and retry",
            FailureKind::FormatUnavailable => "This content is not available in the requested format",
            FailureKind::NotFound => "The item does not exist or is not available in your region",
            FailureKind::RateLimited => "Too many requests, wait a while before retrying",
            FailureKind::Tool => "A helper tool failed, check its installation",
            FailureKind::Unknown => "See the log for details",
        }
    }
}
