use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meedya")]
#[command(author, version, about = "Queue and run Apple Music downloads with quality fallback", long_about = None)]
pub struct Cli {
    /// Directory holding queue.json, settings.json and the log file
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Number of concurrent downloads
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Settings file (default: settings.json in the state directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Print events as JSON lines instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download one album, song, playlist or music video and wait for it
    Download {
        /// One or more music.apple.com URLs, downloaded as one job
        #[arg(required = true)]
        urls: Vec<String>,

        /// Song codec (alac, atmos, ac3, aac, aac-legacy, ...)
        #[arg(short, long)]
        codec: Option<String>,

        /// Music video resolution (2160p, 1080p, ...)
        #[arg(short, long)]
        resolution: Option<String>,

        /// Companion policy (disabled, primary-to-lossless,
        /// primary-to-lossless-plus-lossy, specialist-to-lossy)
        #[arg(long)]
        companions: Option<String>,

        /// Output directory for this job
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Resume the persisted queue and exit once it is drained
    Run,

    /// Show the persisted queue
    Status,

    /// Write unfinished jobs to a file
    Export {
        /// Destination JSON file
        file: PathBuf,
    },

    /// Queue the jobs from an export file and run them
    Import {
        /// Export file to read
        file: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
