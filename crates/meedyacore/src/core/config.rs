use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Directory holding `queue.json`, `settings.json` and the log file
/// Read from MEEDYA_STATE_DIR environment variable
/// Supports tilde (~) expansion for home directory
/// Default: ~/.meedyadl
pub static STATE_DIR: Lazy<String> =
    Lazy::new(|| env::var("MEEDYA_STATE_DIR").unwrap_or_else(|_| "~/.meedyadl".to_string()));

/// Number of concurrent downloader processes
/// Read from MEEDYA_WORKERS environment variable
/// Invalid or zero values fall back to queue::DEFAULT_WORKERS
pub static WORKERS: Lazy<usize> = Lazy::new(|| {
    env::var("MEEDYA_WORKERS")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(queue::DEFAULT_WORKERS)
});

/// Python interpreter used to run `python -m gamdl`
/// Read from MEEDYA_PYTHON_BIN environment variable
/// Default: python3
pub static PYTHON_BIN: Lazy<String> =
    Lazy::new(|| env::var("MEEDYA_PYTHON_BIN").unwrap_or_else(|_| "python3".to_string()));

/// Directory with managed helper tools (ffmpeg, mp4decrypt, MP4Box, N_m3u8DL-RE)
/// Read from MEEDYA_TOOLS_DIR environment variable
pub static TOOLS_DIR: Lazy<Option<String>> = Lazy::new(|| {
    env::var("MEEDYA_TOOLS_DIR").ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
});

/// gamdl's own config file, passed as `--config-path` when it exists
/// Read from MEEDYA_GAMDL_CONFIG environment variable
pub static GAMDL_CONFIG: Lazy<Option<String>> = Lazy::new(|| env::var("MEEDYA_GAMDL_CONFIG").ok());

/// Log file path
/// Read from MEEDYA_LOG_FILE environment variable
/// Default: meedya.log inside the state directory
pub static LOG_FILE_PATH: Lazy<Option<String>> = Lazy::new(|| env::var("MEEDYA_LOG_FILE").ok());

/// Expand `~` and return an owned path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

/// Queue processing configuration
pub mod queue {
    /// Default number of concurrent downloads
    pub const DEFAULT_WORKERS: usize = 2;

    /// Progress is held below this value until an item is complete
    pub const PROGRESS_CAP: f64 = 99.9;

    /// How often `wait_idle` re-checks the queue (in milliseconds)
    pub const IDLE_POLL_INTERVAL_MS: u64 = 100;
}

/// Subprocess configuration
pub mod process {
    use super::Duration;

    /// Time allowed between SIGTERM and a forced kill (in seconds)
    pub const GRACE_PERIOD_SECS: u64 = 5;

    /// How long to keep draining pipes after the process exited (in milliseconds)
    /// Grandchildren such as ffmpeg can keep the pipe open past the parent's exit
    pub const READER_DRAIN_TIMEOUT_MS: u64 = 2000;

    /// Size of each pipe read
    pub const READ_CHUNK_SIZE: usize = 4096;

    /// Grace period duration
    pub fn grace_period() -> Duration {
        Duration::from_secs(GRACE_PERIOD_SECS)
    }

    /// Reader drain timeout duration
    pub fn drain_timeout() -> Duration {
        Duration::from_millis(READER_DRAIN_TIMEOUT_MS)
    }
}

/// Persistence configuration
pub mod persistence {
    use super::Duration;

    /// Snapshot file name inside the state directory
    pub const SNAPSHOT_FILE: &str = "queue.json";

    /// Settings file name inside the state directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Log file name inside the state directory
    pub const LOG_FILE: &str = "meedya.log";

    /// Attempts per snapshot before giving up on it
    pub const MAX_WRITE_ATTEMPTS: u32 = 3;

    /// Delay between failed snapshot writes (in milliseconds)
    pub const RETRY_DELAY_MS: u64 = 500;

    /// Retry delay duration
    pub fn retry_delay() -> Duration {
        Duration::from_millis(RETRY_DELAY_MS)
    }
}

/// Runtime configuration of a [`crate::engine::DownloadEngine`].
///
/// `Default` reads the environment statics above; tests build one directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for `queue.json`. `None` runs without persistence.
    pub state_dir: Option<PathBuf>,
    /// Size of the worker pool
    pub workers: usize,
    /// Time between graceful terminate and forced kill
    pub grace_period: Duration,
    /// Pipe drain bound after process exit
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: Some(expand_path(&STATE_DIR)),
            workers: *WORKERS,
            grace_period: process::grace_period(),
            drain_timeout: process::drain_timeout(),
        }
    }
}

impl EngineConfig {
    /// Creates a config from the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state directory.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Disables the on-disk snapshot.
    #[must_use]
    pub fn in_memory(mut self) -> Self {
        self.state_dir = None;
        self
    }

    /// Sets the worker pool size. Zero is raised to one.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the termination grace period.
    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Sets the pipe drain timeout.
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Path of the queue snapshot, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(persistence::SNAPSHOT_FILE))
    }
}
