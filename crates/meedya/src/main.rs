use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::signal;

use meedyacore::core::config::{self, persistence};
use meedyacore::core::init_logger;
use meedyacore::core::settings::{JsonSettingsFile, SettingsProvider, StaticSettings};
use meedyacore::download::{
    BinaryResolver, CompanionPolicy, DownloadJob, DownloadOptions, DownloadState, EngineEvent, ManagedBinaryResolver,
    OutputEvent, QueueSnapshot, QueueStore, SongCodec, VideoResolution,
};
use meedyacore::storage::{export, reconcile, SnapshotStore};
use meedyacore::{DownloadEngine, EngineConfig};

mod cli;

use cli::{Cli, Commands};

/// Main entry point for the meedya command line
///
/// # Errors
/// Returns an error if initialization fails or any download of the job fails.
#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present, before any config static is read
    let _ = dotenv();

    let cli = Cli::parse_args();

    let mut engine_config = EngineConfig::new();
    if let Some(dir) = &cli.state_dir {
        engine_config = engine_config.state_dir(dir.clone());
    }
    if let Some(workers) = cli.workers {
        engine_config = engine_config.workers(workers);
    }
    let state_dir = engine_config
        .state_dir
        .clone()
        .unwrap_or_else(|| config::expand_path(&config::STATE_DIR));

    let log_path = config::LOG_FILE_PATH
        .as_deref()
        .map(config::expand_path)
        .unwrap_or_else(|| state_dir.join(persistence::LOG_FILE));
    init_logger(&log_path, cli.log_level())?;

    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| state_dir.join(persistence::SETTINGS_FILE));
    let settings_file = JsonSettingsFile::new(settings_path);
    let resolver: Arc<dyn BinaryResolver> = Arc::new(ManagedBinaryResolver::default());

    match cli.command {
        Commands::Download {
            urls,
            codec,
            resolution,
            companions,
            output,
        } => {
            let mut options = DownloadOptions::default();
            if let Some(codec) = codec {
                options.song_codec = Some(SongCodec::from_str(&codec)?);
            }
            if let Some(resolution) = resolution {
                options.music_video_resolution = Some(VideoResolution::from_str(&resolution)?);
            }
            options.output_path = output;

            let settings: Arc<dyn SettingsProvider> = match companions {
                Some(policy) => {
                    let mut settings = settings_file.settings();
                    settings.companion_policy = CompanionPolicy::from_str(&policy)?;
                    Arc::new(StaticSettings::new(settings))
                }
                None => Arc::new(settings_file),
            };

            let job = DownloadJob::new(urls).with_options(options);
            run_download(engine_config, settings, resolver, job, cli.json).await
        }
        Commands::Run => {
            let engine = DownloadEngine::start(engine_config, Arc::new(settings_file), resolver).await?;
            drain_queue(&engine, cli.json).await
        }
        Commands::Status => {
            let snapshot = SnapshotStore::new(state_dir.join(persistence::SNAPSHOT_FILE)).load();
            print_status(&snapshot, cli.json)
        }
        Commands::Export { file } => run_export(&state_dir, &file).await,
        Commands::Import { file } => {
            let engine = DownloadEngine::start(engine_config, Arc::new(settings_file), resolver).await?;
            let imported = match engine.import_from(&file).await {
                Ok(count) => count,
                Err(e) => {
                    engine.shutdown().await;
                    return Err(e).with_context(|| format!("Cannot import {}", file.display()));
                }
            };
            println!("Imported {} item(s) from {}", imported, file.display());
            drain_queue(&engine, cli.json).await
        }
    }
}

/// Submit one job and follow it until every item of it has finished.
async fn run_download(
    engine_config: EngineConfig,
    settings: Arc<dyn SettingsProvider>,
    resolver: Arc<dyn BinaryResolver>,
    job: DownloadJob,
    json: bool,
) -> Result<()> {
    let engine = DownloadEngine::start(engine_config, settings, resolver).await?;
    let mut events = engine.subscribe_all();

    let primary = match engine.submit(job).await {
        Ok(id) => id,
        Err(e) => {
            engine.shutdown().await;
            return Err(e.into());
        }
    };
    let job_id = engine.get(&primary).await.map(|item| item.job_id);
    let ids: HashSet<String> = engine
        .snapshot()
        .await
        .items
        .into_iter()
        .filter(|item| Some(&item.job_id) == job_id.as_ref())
        .map(|item| item.id)
        .collect();

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Interrupted, shutting down gracefully...");
                interrupted = true;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, json);
                if event.is_terminal() && ids.contains(event.id()) && job_finished(&engine, &ids).await {
                    break;
                }
            }
        }
    }

    let snapshot = engine.snapshot().await;
    engine.shutdown().await;
    if interrupted {
        println!("Stopped; unfinished items resume with `meedya run`");
        return Ok(());
    }

    let failed = snapshot
        .items
        .iter()
        .filter(|item| ids.contains(&item.id) && item.state == DownloadState::Error)
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} item(s) failed", failed, ids.len());
    }
    Ok(())
}

async fn job_finished(engine: &DownloadEngine, ids: &HashSet<String>) -> bool {
    let snapshot = engine.snapshot().await;
    snapshot
        .items
        .iter()
        .filter(|item| ids.contains(&item.id))
        .all(|item| item.state.is_terminal())
}

/// Print events until the queue is empty or Ctrl-C, then shut down.
async fn drain_queue(engine: &DownloadEngine, json: bool) -> Result<()> {
    let mut events = engine.subscribe_all();
    let idle = engine.wait_idle();
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Interrupted, shutting down gracefully...");
                break;
            }
            _ = &mut idle => break,
            Some(event) = events.recv() => print_event(&event, json),
        }
    }

    // Events published right before the queue went idle
    while let Some(event) = events.try_recv() {
        print_event(&event, json);
    }

    let snapshot = engine.snapshot().await;
    engine.shutdown().await;
    println!(
        "{} complete, {} failed, {} cancelled",
        snapshot.count(DownloadState::Complete),
        snapshot.count(DownloadState::Error),
        snapshot.count(DownloadState::Cancelled)
    );
    Ok(())
}

/// Export from the persisted queue without starting any download.
async fn run_export(state_dir: &Path, file: &Path) -> Result<()> {
    let snapshot = SnapshotStore::new(state_dir.join(persistence::SNAPSHOT_FILE)).load();
    let store = QueueStore::with_items(reconcile(snapshot).items, None);
    let jobs = store.pending_jobs().await;
    let count = export::write_jobs(file, &jobs).with_context(|| format!("Cannot write {}", file.display()))?;
    println!("Exported {} job(s) to {}", count, file.display());
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_event(event: &EngineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("Cannot serialize event: {}", e),
        }
        return;
    }

    let id = short_id(event.id());
    match event {
        EngineEvent::Queued { .. } => println!("[{}] queued", id),
        EngineEvent::Started { format, .. } => println!("[{}] downloading as {}", id, format),
        EngineEvent::Progress { event, .. } => match event {
            OutputEvent::TrackInfo {
                title,
                artist,
                index: Some(index),
                total: Some(total),
                ..
            } => println!("[{}] track {}/{}: {} - {}", id, index, total, artist, title),
            OutputEvent::TrackInfo { title, artist, .. } => println!("[{}] {} - {}", id, artist, title),
            OutputEvent::ProcessingStep { step } => println!("[{}] {}", id, step),
            OutputEvent::Error { message } => println!("[{}] error: {}", id, message),
            OutputEvent::Complete { path } => println!("[{}] saved {}", id, path),
            OutputEvent::Progress { .. } | OutputEvent::Unrecognized { .. } => {}
        },
        EngineEvent::FellBack { from, to, .. } => println!("[{}] {} unavailable, trying {}", id, from, to),
        EngineEvent::Completed { output_path, .. } => match output_path {
            Some(path) => println!("[{}] done: {}", id, path),
            None => println!("[{}] done", id),
        },
        EngineEvent::Failed { message, .. } => println!("[{}] failed: {}", id, message),
        EngineEvent::Cancelled { .. } => println!("[{}] cancelled", id),
    }
}

fn print_status(snapshot: &QueueSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }
    if snapshot.items.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for item in &snapshot.items {
        let fallback = if item.fallback_occurred { " (fallback)" } else { "" };
        println!(
            "{}  {:<11} {:<12} {:>5.1}%{}  {}",
            short_id(&item.id),
            item.state.as_str(),
            item.requested.as_str(),
            item.progress,
            fallback,
            item.urls.first().map(String::as_str).unwrap_or_default()
        );
        if let Some(error) = &item.error {
            println!("          {}", error);
        }
    }
    Ok(())
}
