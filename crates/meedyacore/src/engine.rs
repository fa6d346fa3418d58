//! Download engine facade.
//!
//! Owns the queue store, the event bus, the worker pool and the snapshot
//! writer. Every front end talks to the engine through [`DownloadEngine`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::config::{self, EngineConfig};
use crate::core::error::{AppError, AppResult};
use crate::core::settings::SettingsProvider;
use crate::download::command::BinaryResolver;
use crate::download::events::{EngineEvent, EventBus, Subscription};
use crate::download::expander::{expand, DownloadJob, ExpandContext};
use crate::download::queue::{CancelOutcome, QueueSnapshot, QueueStore, WorkItem};
use crate::download::supervisor::Supervisor;
use crate::storage::export;
use crate::storage::snapshot::{reconcile, spawn_writer, PersistRequest, SnapshotStore};

/// Running download engine.
///
/// Created with [`DownloadEngine::start`]; call [`DownloadEngine::shutdown`]
/// before dropping it so the last queue state reaches disk.
pub struct DownloadEngine {
    store: Arc<QueueStore>,
    events: Arc<EventBus>,
    settings: Arc<dyn SettingsProvider>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadEngine {
    /// Restore the persisted queue and start the workers.
    pub async fn start(
        config: EngineConfig,
        settings: Arc<dyn SettingsProvider>,
        resolver: Arc<dyn BinaryResolver>,
    ) -> AppResult<Self> {
        let (items, persist, writer) = match config.snapshot_path() {
            Some(path) => {
                let snapshots = SnapshotStore::new(path);
                let loader = snapshots.clone();
                let loaded = tokio::task::spawn_blocking(move || loader.load())
                    .await
                    .map_err(|e| AppError::Persistence(format!("snapshot load task failed: {}", e)))?;

                let reconciled = reconcile(loaded);
                log::info!(
                    "Restored {} item(s) ({} requeued, {} discarded)",
                    reconciled.items.len(),
                    reconciled.requeued,
                    reconciled.discarded
                );

                let (tx, rx) = watch::channel(PersistRequest::default());
                let writer = spawn_writer(snapshots, rx);
                (reconciled.items, Some(tx), Some(writer))
            }
            None => {
                log::info!("Running without a queue snapshot");
                (Vec::new(), None, None)
            }
        };

        let store = Arc::new(QueueStore::with_items(items, persist));
        // The reconciled queue replaces whatever was on disk.
        store.checkpoint().await;

        let events = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(
            Supervisor::new(
                Arc::clone(&store),
                Arc::clone(&events),
                Arc::clone(&settings),
                resolver,
                shutdown.clone(),
            )
            .grace_period(config.grace_period)
            .drain_timeout(config.drain_timeout),
        );
        let workers = supervisor.spawn_workers(config.workers);

        Ok(Self {
            store,
            events,
            settings,
            shutdown,
            workers: Mutex::new(workers),
            writer: Mutex::new(writer),
        })
    }

    fn expand_context(&self) -> ExpandContext {
        ExpandContext::from_settings(&self.settings.settings())
    }

    /// Queue a request and its companions. Returns the primary item's id.
    pub async fn submit(&self, job: DownloadJob) -> AppResult<String> {
        let items = expand(&job, &self.expand_context())?;
        let primary = items
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| AppError::UserInput("request produced no work items".to_string()))?;

        self.enqueue(items).await?;
        log::info!("Submitted {} for {}", primary, job.urls.join(" "));
        Ok(primary)
    }

    /// `Queued` is published under the store lock so it always precedes `Started`.
    async fn enqueue(&self, items: Vec<WorkItem>) -> AppResult<()> {
        self.store
            .enqueue_with(items, |queued| {
                for item in queued {
                    self.events.publish(EngineEvent::Queued { id: item.id.clone() });
                }
            })
            .await
    }

    /// Cancel a queued or running item. Returns false if it had already finished.
    pub async fn cancel(&self, id: &str) -> AppResult<bool> {
        match self.store.cancel(id).await? {
            CancelOutcome::Cancelled => {
                self.events.publish(EngineEvent::Cancelled { id: id.to_string() });
                Ok(true)
            }
            CancelOutcome::Signalled => Ok(true),
            CancelOutcome::AlreadyFinished => Ok(false),
        }
    }

    /// Requeue a failed or cancelled item from the top of its fallback chain.
    pub async fn retry(&self, id: &str) -> AppResult<bool> {
        self.store
            .retry_with(id, |item| {
                self.events.publish(EngineEvent::Queued { id: item.id.clone() });
            })
            .await
    }

    /// Drop every finished item. Returns how many were removed.
    pub async fn clear_finished(&self) -> usize {
        let removed = self.store.clear_finished().await;
        log::info!("Cleared {} finished item(s)", removed);
        removed
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.store.snapshot().await
    }

    pub async fn get(&self, id: &str) -> Option<WorkItem> {
        self.store.get(id).await
    }

    /// Write every job with unfinished work to `path`.
    pub async fn export_to(&self, path: &Path) -> AppResult<usize> {
        let jobs = self.store.pending_jobs().await;
        export::write_jobs(path, &jobs)
    }

    /// Queue every job in an export file. Nothing is queued if any record is invalid.
    ///
    /// Returns the number of work items created.
    pub async fn import_from(&self, path: &Path) -> AppResult<usize> {
        let jobs = export::read_jobs(path)?;
        let ctx = self.expand_context();

        let mut items = Vec::new();
        for (index, job) in jobs.iter().enumerate() {
            let expanded = expand(job, &ctx).map_err(|e| match e {
                AppError::UserInput(msg) => AppError::UserInput(format!("record {}: {}", index + 1, msg)),
                other => other,
            })?;
            items.extend(expanded);
        }

        let count = items.len();
        self.enqueue(items).await?;
        log::info!("Imported {} job(s) as {} item(s) from {}", jobs.len(), count, path.display());
        Ok(count)
    }

    /// Events of one work item from now on.
    pub fn subscribe(&self, id: &str) -> Subscription {
        self.events.subscribe(id)
    }

    /// Events of all work items from now on.
    pub fn subscribe_all(&self) -> Subscription {
        self.events.subscribe_all()
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        let interval = Duration::from_millis(config::queue::IDLE_POLL_INTERVAL_MS);
        while !self.store.is_idle().await {
            tokio::time::sleep(interval).await;
        }
    }

    /// Stop the workers and flush the queue to disk.
    ///
    /// Running downloads are terminated but keep their state, so the next
    /// start picks them up again. Calling this twice is harmless.
    pub async fn shutdown(&self) {
        log::info!("Shutting down download engine");
        self.shutdown.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("Download worker ended abnormally: {}", e);
            }
        }

        self.store.close_persistence().await;
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                log::error!("Snapshot writer ended abnormally: {}", e);
            }
        }
        log::info!("Download engine stopped");
    }
}
