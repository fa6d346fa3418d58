//! Shared helpers for engine integration tests
//!
//! The downloader is replaced by small `/bin/sh` scripts. Every script starts
//! with an argument parser that exposes `$codec`, `$resolution` and `$output`,
//! so a test only writes the behaviour it needs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use meedyacore::core::settings::{AppSettings, StaticSettings};
use meedyacore::download::{BinaryResolver, DownloaderCommand, EngineEvent, SongCodec, Subscription};
use meedyacore::{AppResult, DownloadEngine, EngineConfig, QueueSnapshot};

pub const ALBUM: &str = "https://music.apple.com/us/album/test-album/1440000001";
pub const SONG: &str = "https://music.apple.com/us/song/test-song/1440000002";

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(15);

const ARG_PARSER: &str = r#"
codec=""
resolution=""
output="."
while [ $# -gt 0 ]; do
  case "$1" in
    --song-codec) codec="$2"; shift ;;
    --music-video-resolution) resolution="$2"; shift ;;
    --output-path) output="$2"; shift ;;
  esac
  shift
done
"#;

/// Runs `/bin/sh <script>` in place of `python -m gamdl`.
pub struct ScriptResolver {
    script: PathBuf,
}

impl ScriptResolver {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self { script: script.into() }
    }
}

impl BinaryResolver for ScriptResolver {
    fn downloader(&self) -> AppResult<DownloaderCommand> {
        Ok(DownloaderCommand {
            program: "/bin/sh".to_string(),
            leading_args: vec![self.script.to_string_lossy().into_owned()],
        })
    }
}

/// Write a fake downloader script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n{}\n", ARG_PARSER, body)).unwrap();
    path
}

/// Prints a track, some progress and a saved path, then exits cleanly.
pub const SUCCEED: &str = r#"
echo "Getting track 1 of 2: First Song by Test Band"
echo "[download]  50.0% of ~ 5.00MiB at 1.00MiB/s ETA 00:02"
echo "Getting track 2 of 2: Second Song by Test Band"
printf '[download]  50.0%% of ~ 5.00MiB at 1.00MiB/s ETA 00:01\r'
echo "[download] 100% of 5.00MiB in 00:02"
echo "Saved to: $output/$codec.m4a"
exit 0
"#;

/// Blocks until killed.
pub const BLOCK: &str = r#"
echo "Getting track 1 of 1: Slow Song by Test Band"
exec sleep 30
"#;

/// Settings used by the integration tests: short chain, no tagging.
pub fn test_settings(output: &Path) -> AppSettings {
    AppSettings {
        output_path: output.to_string_lossy().into_owned(),
        music_fallback_chain: vec![SongCodec::Alac, SongCodec::Atmos, SongCodec::Aac],
        embed_codec_metadata: false,
        ..Default::default()
    }
}

pub fn test_config(state_dir: &Path, workers: usize) -> EngineConfig {
    EngineConfig::new()
        .state_dir(state_dir)
        .workers(workers)
        .grace_period(Duration::from_millis(500))
        .drain_timeout(Duration::from_millis(300))
}

pub async fn start_engine(state_dir: &Path, script: &Path, settings: AppSettings, workers: usize) -> DownloadEngine {
    DownloadEngine::start(
        test_config(state_dir, workers),
        Arc::new(StaticSettings::new(settings)),
        Arc::new(ScriptResolver::new(script)),
    )
    .await
    .unwrap()
}

/// Receive events until one matches, returning everything seen including the match.
pub async fn recv_until<F>(sub: &mut Subscription, mut done: F) -> Vec<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, sub.recv())
            .await
            .expect("timed out waiting for engine event")
            .expect("event bus closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Events up to and including the first terminal one.
pub async fn recv_until_terminal(sub: &mut Subscription) -> Vec<EngineEvent> {
    recv_until(sub, EngineEvent::is_terminal).await
}

/// Poll the engine's snapshot until `check` passes.
pub async fn wait_for_snapshot<F>(engine: &DownloadEngine, check: F) -> QueueSnapshot
where
    F: Fn(&QueueSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let snapshot = engine.snapshot().await;
        if check(&snapshot) {
            return snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "snapshot condition not reached: {:?}", snapshot);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
