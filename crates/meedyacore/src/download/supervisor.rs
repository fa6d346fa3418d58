//! Worker pool that runs the downloader subprocess.
//!
//! Each worker claims one queued item at a time, spawns the downloader for the
//! item's current format, streams its output through the parser into the
//! store and the event bus, and settles the outcome: complete, fall back to
//! the next format, fail, or cancel.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config;
use crate::core::error::AppError;
use crate::core::process::{spawn_error, terminate_gracefully};
use crate::core::settings::{AppSettings, SettingsProvider};
use crate::download::codec::MediaKind;
use crate::download::command::{build_invocation, BinaryResolver};
use crate::download::events::{EngineEvent, EventBus};
use crate::download::failure::{classify_failure, FailureKind};
use crate::download::metadata;
use crate::download::output::{parse_line, LineBuffer, OutputEvent};
use crate::download::queue::{Claim, QueueStore, WorkItem};

/// How a single process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Clean exit, with every path the downloader reported saving
    Success { saved: Vec<String> },
    /// Non-zero exit or an error reported after the last saved file
    Failed(String),
    SpawnFailed(String),
    Cancelled,
    /// Engine is stopping; the item is left as it is for the next start
    Shutdown,
}

/// What the output of one attempt told us.
#[derive(Debug, Default)]
struct AttemptTracker {
    last_error: Option<String>,
    /// An error was reported after the most recent `Saved to`
    error_since_complete: bool,
    /// One entry per saved track, in output order
    saved: Vec<String>,
}

impl AttemptTracker {
    fn observe(&mut self, event: &OutputEvent) {
        match event {
            OutputEvent::Error { message } => {
                self.last_error = Some(message.clone());
                self.error_since_complete = true;
            }
            OutputEvent::Complete { path } => {
                self.error_since_complete = false;
                if !self.saved.contains(path) {
                    self.saved.push(path.clone());
                }
            }
            _ => {}
        }
    }

    fn outcome(&self, status: ExitStatus) -> AttemptOutcome {
        if status.success() && !self.error_since_complete {
            return AttemptOutcome::Success {
                saved: self.saved.clone(),
            };
        }
        let message = self.last_error.clone().unwrap_or_else(|| match status.code() {
            Some(code) => format!("downloader exited with code {}", code),
            None => "downloader was terminated by a signal".to_string(),
        });
        AttemptOutcome::Failed(message)
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    Shutdown,
}

/// Everything a worker needs, shared by the whole pool.
pub struct Supervisor {
    store: Arc<QueueStore>,
    events: Arc<EventBus>,
    settings: Arc<dyn SettingsProvider>,
    resolver: Arc<dyn BinaryResolver>,
    grace_period: Duration,
    drain_timeout: Duration,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: Arc<QueueStore>,
        events: Arc<EventBus>,
        settings: Arc<dyn SettingsProvider>,
        resolver: Arc<dyn BinaryResolver>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            events,
            settings,
            resolver,
            grace_period: config::process::grace_period(),
            drain_timeout: config::process::drain_timeout(),
            shutdown,
        }
    }

    #[must_use]
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Start `count` workers. They run until the shutdown token fires.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        log::info!("Starting {} download worker(s)", count);
        (0..count)
            .map(|worker| {
                let supervisor = Arc::clone(self);
                tokio::spawn(async move { supervisor.worker_loop(worker).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        log::debug!("Worker {} started", worker);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.store.claim_next().await {
                Some(claim) => self.run_item(claim).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.store.wait_for_work() => {}
                    }
                }
            }
        }
        log::debug!("Worker {} stopped", worker);
    }

    /// Drive one claimed item through as many formats as it takes.
    async fn run_item(&self, claim: Claim) {
        let Claim {
            mut item,
            token,
            ticket,
        } = claim;
        let id = item.id.clone();

        loop {
            self.events.publish(EngineEvent::Started {
                id: id.clone(),
                format: item.requested,
            });
            let settings = self.settings.settings();
            let mut outcome = self.run_attempt(&item, &settings, &token).await;

            // A cancel that raced the process exit still wins over a failure.
            if token.is_cancelled() && !matches!(outcome, AttemptOutcome::Success { .. } | AttemptOutcome::Shutdown) {
                outcome = AttemptOutcome::Cancelled;
            }

            match outcome {
                AttemptOutcome::Success { saved } => {
                    self.finish_success(&id, &settings, saved).await;
                    break;
                }
                AttemptOutcome::Cancelled => {
                    match self.store.finish_cancelled(&id).await {
                        Ok(_) => self.events.publish(EngineEvent::Cancelled { id: id.clone() }),
                        Err(e) => log::error!("Cannot mark {} cancelled: {}", id, e),
                    }
                    break;
                }
                AttemptOutcome::Shutdown => {
                    log::info!("Left {} for the next start", id);
                    break;
                }
                AttemptOutcome::SpawnFailed(message) => {
                    log::error!("Cannot start downloader for {}: {}", id, message);
                    self.finish_failed(&id, message).await;
                    break;
                }
                AttemptOutcome::Failed(message) => {
                    let kind = classify_failure(&message);
                    log::warn!("Attempt {} for {} failed ({:?}): {}", item.requested, id, kind, message);

                    if kind.advances_fallback() {
                        match self.store.advance_fallback(&id).await {
                            Ok(Some((from, updated))) => {
                                self.events.publish(EngineEvent::FellBack {
                                    id: id.clone(),
                                    from,
                                    to: updated.requested,
                                });
                                item = updated;
                                continue;
                            }
                            Ok(None) => {}
                            Err(e) => log::error!("Cannot advance fallback for {}: {}", id, e),
                        }
                    }

                    let message = final_message(&item, kind, message);
                    self.finish_failed(&id, message).await;
                    break;
                }
            }
        }

        self.store.release(&id, ticket).await;
    }

    async fn finish_success(&self, id: &str, settings: &AppSettings, saved: Vec<String>) {
        let done = match self.store.complete(id).await {
            Ok(done) => done,
            Err(e) => {
                log::error!("Cannot mark {} complete: {}", id, e);
                return;
            }
        };
        log::info!("Completed {} as {}", id, done.requested);
        self.events.publish(EngineEvent::Completed {
            id: id.to_string(),
            output_path: done.output_path.clone(),
        });
        self.post_process(&done, settings, &saved).await;
    }

    async fn finish_failed(&self, id: &str, message: String) {
        match self.store.fail(id, message.clone()).await {
            Ok(_) => self.events.publish(EngineEvent::Failed {
                id: id.to_string(),
                message,
            }),
            Err(e) => log::error!("Cannot mark {} failed: {}", id, e),
        }
    }

    /// Codec tags for finished songs. Never changes the item's state.
    async fn post_process(&self, item: &WorkItem, settings: &AppSettings, saved: &[String]) {
        if !settings.embed_codec_metadata || item.media != MediaKind::Song {
            return;
        }
        let Some(codec) = item.requested.codec() else {
            return;
        };
        let targets = tag_targets(saved, item.output_path.as_deref());
        if targets.is_empty() {
            log::debug!("No output path reported for {}, skipping codec tags", item.id);
            return;
        }

        let result = tokio::task::spawn_blocking(move || metadata::tag_outputs(&targets, codec)).await;
        match result {
            Ok(count) => log::debug!("Codec tags written to {} file(s) for {}", count, item.id),
            Err(e) => log::error!("Codec tagging task for {} panicked: {}", item.id, e),
        }
    }

    /// Run the downloader once for the item's current format.
    async fn run_attempt(&self, item: &WorkItem, settings: &AppSettings, token: &CancellationToken) -> AttemptOutcome {
        let invocation = match build_invocation(item, settings, self.resolver.as_ref()) {
            Ok(invocation) => invocation,
            Err(e) => return AttemptOutcome::SpawnFailed(e.to_string()),
        };
        log::info!("Downloading {} as {}", item.id, item.requested);
        log::debug!("{} {}", invocation.program, invocation.args.join(" "));

        let mut child = match Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return AttemptOutcome::SpawnFailed(spawn_error(&invocation.program, e).to_string()),
        };

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut tracker = AttemptTracker::default();
        let exit = loop {
            tokio::select! {
                _ = token.cancelled() => break Exit::Cancelled,
                _ = self.shutdown.cancelled() => break Exit::Shutdown,
                Some(line) = line_rx.recv() => self.handle_line(&item.id, &line, &mut tracker).await,
                status = child.wait() => break Exit::Exited(status),
            }
        };

        let status = match exit {
            Exit::Exited(status) => status,
            Exit::Cancelled => return self.interrupt(&item.id, &mut child, readers, AttemptOutcome::Cancelled).await,
            Exit::Shutdown => return self.interrupt(&item.id, &mut child, readers, AttemptOutcome::Shutdown).await,
        };

        self.drain(&item.id, &mut line_rx, &mut tracker).await;
        abort_readers(readers);

        match status {
            Ok(status) => {
                log::debug!("Downloader for {} exited with {}", item.id, status);
                tracker.outcome(status)
            }
            Err(e) => AttemptOutcome::Failed(AppError::Runtime(format!("waiting for downloader: {}", e)).to_string()),
        }
    }

    async fn interrupt(
        &self,
        id: &str,
        child: &mut Child,
        readers: Vec<JoinHandle<()>>,
        outcome: AttemptOutcome,
    ) -> AttemptOutcome {
        log::info!("Stopping downloader for {}", id);
        if let Err(e) = terminate_gracefully(child, self.grace_period).await {
            log::warn!("Failed to stop downloader for {}: {}", id, e);
        }
        abort_readers(readers);
        outcome
    }

    /// Process output still buffered after exit. Grandchildren holding the
    /// pipes open must not stall the worker.
    async fn drain(&self, id: &str, line_rx: &mut UnboundedReceiver<String>, tracker: &mut AttemptTracker) {
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(line) = line_rx.recv().await {
                self.handle_line(id, &line, tracker).await;
            }
        })
        .await;
        if drained.is_err() {
            log::debug!("Output of {} still open after {:?}, abandoning", id, self.drain_timeout);
        }
    }

    async fn handle_line(&self, id: &str, line: &str, tracker: &mut AttemptTracker) {
        let event = parse_line(line);
        if let OutputEvent::Unrecognized { raw } = &event {
            if raw.is_empty() {
                return;
            }
            log::trace!("[{}] {}", id, raw);
        }
        tracker.observe(&event);

        if let Err(e) = self.store.apply_output(id, &event).await {
            log::warn!("Dropping output for {}: {}", id, e);
        }
        self.events.publish(EngineEvent::Progress {
            id: id.to_string(),
            event,
        });
    }
}

/// Paths to tag after a clean exit: every saved track, or the item's output path.
fn tag_targets(saved: &[String], output_path: Option<&str>) -> Vec<PathBuf> {
    if saved.is_empty() {
        return output_path.map(PathBuf::from).into_iter().collect();
    }
    saved.iter().map(PathBuf::from).collect()
}

/// Error text recorded for a failure that ends the item.
fn final_message(item: &WorkItem, kind: FailureKind, message: String) -> String {
    if kind == FailureKind::FormatUnavailable && item.fallback_chain.len() > 1 {
        AppError::FallbackExhausted {
            attempts: item.fallback_chain.len(),
            last_error: message,
        }
        .to_string()
    } else {
        message
    }
}

fn spawn_reader<R>(mut stream: R, tx: UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = LineBuffer::new();
        let mut chunk = vec![0u8; config::process::READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Downloader output read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(line) = buffer.finish() {
            let _ = tx.send(line);
        }
    })
}

fn abort_readers(readers: Vec<JoinHandle<()>>) {
    for reader in readers {
        reader.abort();
    }
}
