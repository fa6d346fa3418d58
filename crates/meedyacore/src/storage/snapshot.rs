//! Crash-safe queue snapshots.
//!
//! The queue store pushes every new state into a `watch` channel. A single
//! writer task persists the newest value, so bursts of progress updates
//! collapse into a few writes and an older snapshot can never overwrite a
//! newer one. Each write goes to a temp file in the same directory which is
//! synced and then renamed over the target.

use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::queue::{DownloadState, QueueSnapshot, WorkItem};

/// A queue state tagged with the store revision that produced it.
#[derive(Debug, Clone, Default)]
pub struct PersistRequest {
    pub revision: u64,
    pub snapshot: QueueSnapshot,
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| AppError::Persistence(format!("rename to {} failed: {}", path.display(), e.error)))?;
    Ok(())
}

/// Location of `queue.json` and the operations on it.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &QueueSnapshot) -> AppResult<()> {
        write_json_atomic(&self.path, snapshot)
            .map_err(|e| AppError::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    /// Read the last snapshot. Missing or corrupt files give an empty queue.
    pub fn load(&self) -> QueueSnapshot {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No queue snapshot at {}, starting empty", self.path.display());
                return QueueSnapshot::default();
            }
            Err(e) => {
                log::warn!("Cannot read queue snapshot {}: {}", self.path.display(), e);
                return QueueSnapshot::default();
            }
        };

        match serde_json::from_slice::<QueueSnapshot>(&raw) {
            Ok(snapshot) => {
                log::info!("Loaded {} item(s) from {}", snapshot.items.len(), self.path.display());
                snapshot
            }
            Err(e) => {
                log::warn!("Corrupt queue snapshot {}: {}, starting empty", self.path.display(), e);
                QueueSnapshot::default()
            }
        }
    }
}

/// Result of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub items: Vec<WorkItem>,
    /// Items that were mid-download when the process died
    pub requeued: usize,
    /// Finished items and duplicate ids
    pub discarded: usize,
}

/// Bring a loaded snapshot back to a consistent starting point.
///
/// Finished items are dropped, interrupted ones go back to `queued` with
/// their transient fields cleared, and the first occurrence of a duplicate id
/// wins. The result is ordered by creation time.
pub fn reconcile(snapshot: QueueSnapshot) -> Reconciled {
    let mut seen = HashSet::new();
    let mut out = Reconciled::default();

    for mut item in snapshot.items {
        if !seen.insert(item.id.clone()) {
            log::warn!("Dropping duplicate work item {} from snapshot", item.id);
            out.discarded += 1;
            continue;
        }

        match item.state {
            DownloadState::Complete | DownloadState::Error | DownloadState::Cancelled => {
                out.discarded += 1;
                continue;
            }
            DownloadState::Downloading | DownloadState::Processing => {
                item.state = DownloadState::Queued;
                item.reset_transient();
                item.error = None;
                item.output_path = None;
                out.requeued += 1;
            }
            DownloadState::Queued => {}
        }
        out.items.push(item);
    }

    out.items.sort_by_key(|item| item.created_at);
    out
}

/// Spawn the task that writes snapshots as they arrive.
///
/// The task ends once the sending side is dropped, after writing the last
/// state it has not written yet.
pub fn spawn_writer(store: SnapshotStore, mut rx: watch::Receiver<PersistRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut written = 0u64;
        loop {
            let closed = rx.changed().await.is_err();
            let request = rx.borrow_and_update().clone();

            if request.revision > written && write_with_retry(&store, &request, &rx).await {
                written = request.revision;
            }
            if closed {
                break;
            }
        }
        log::debug!("Snapshot writer stopped at revision {}", written);
    })
}

/// Returns true once written. Gives up early when a newer snapshot is waiting.
async fn write_with_retry(store: &SnapshotStore, request: &PersistRequest, rx: &watch::Receiver<PersistRequest>) -> bool {
    for attempt in 1..=config::persistence::MAX_WRITE_ATTEMPTS {
        let target = store.clone();
        let snapshot = request.snapshot.clone();
        let result = tokio::task::spawn_blocking(move || target.save(&snapshot)).await;

        match result {
            Ok(Ok(())) => {
                log::trace!("Snapshot revision {} written", request.revision);
                return true;
            }
            Ok(Err(e)) => log::warn!("Snapshot write attempt {} failed: {}", attempt, e),
            Err(e) => log::warn!("Snapshot write task failed: {}", e),
        }

        if matches!(rx.has_changed(), Ok(true)) {
            log::debug!("Snapshot revision {} superseded", request.revision);
            return false;
        }
        if attempt < config::persistence::MAX_WRITE_ATTEMPTS {
            tokio::time::sleep(config::persistence::retry_delay()).await;
        }
    }

    log::error!(
        "Giving up on snapshot revision {} after {} attempts",
        request.revision,
        config::persistence::MAX_WRITE_ATTEMPTS
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::codec::{Format, MediaKind, SongCodec};
    use crate::download::expander::DownloadJob;
    use pretty_assertions::assert_eq;

    fn item(state: DownloadState) -> WorkItem {
        let job = DownloadJob::new(["https://music.apple.com/us/album/x/1"]);
        let format = Format::Codec(SongCodec::Alac);
        let mut item = WorkItem::new(&job, "job", MediaKind::Song, format, vec![format]);
        item.state = state;
        item
    }

    #[test]
    fn test_save_and_load_preserves_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));

        let mut queued = item(DownloadState::Queued);
        queued.fallback_occurred = true;
        queued.error = Some("earlier failure".to_string());
        let snapshot = QueueSnapshot {
            items: vec![queued, item(DownloadState::Complete)],
        };

        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), snapshot);
    }

    #[test]
    fn test_missing_and_corrupt_snapshots_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        assert!(store.load().items.is_empty());

        std::fs::write(store.path(), b"[{\"id\": ").unwrap();
        assert!(store.load().items.is_empty());
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        store.save(&QueueSnapshot::default()).unwrap();
        store.save(&QueueSnapshot { items: vec![item(DownloadState::Queued)] }).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["queue.json".to_string()]);
    }

    // ==================== Reconciliation Tests ====================

    #[test]
    fn test_reconcile_requeues_interrupted_items() {
        let mut running = item(DownloadState::Downloading);
        running.progress = 42.0;
        running.speed = Some("1MiB/s".to_string());
        running.current_step = Some("Remuxing".to_string());
        let processing = item(DownloadState::Processing);

        let result = reconcile(QueueSnapshot {
            items: vec![running.clone(), processing],
        });

        assert_eq!(result.requeued, 2);
        assert!(result.items.iter().all(|i| i.state == DownloadState::Queued));
        assert_eq!(result.items[0].id, running.id);
        assert_eq!(result.items[0].progress, 0.0);
        assert_eq!(result.items[0].speed, None);
        assert_eq!(result.items[0].current_step, None);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let once = reconcile(QueueSnapshot {
            items: vec![item(DownloadState::Downloading), item(DownloadState::Queued)],
        });
        let twice = reconcile(QueueSnapshot {
            items: once.items.clone(),
        });
        assert_eq!(twice.items, once.items);
        assert_eq!(twice.requeued, 0);
    }

    #[test]
    fn test_reconcile_drops_finished_and_duplicates() {
        let kept = item(DownloadState::Queued);
        let result = reconcile(QueueSnapshot {
            items: vec![
                kept.clone(),
                item(DownloadState::Complete),
                item(DownloadState::Error),
                item(DownloadState::Cancelled),
                kept.clone(),
            ],
        });

        assert_eq!(result.items, vec![kept]);
        assert_eq!(result.discarded, 4);
    }

    #[test]
    fn test_reconcile_orders_by_creation() {
        let mut newer = item(DownloadState::Queued);
        let older = item(DownloadState::Queued);
        newer.created_at = older.created_at + chrono::Duration::seconds(5);

        let result = reconcile(QueueSnapshot {
            items: vec![newer.clone(), older.clone()],
        });
        assert_eq!(result.items[0].id, older.id);
        assert_eq!(result.items[1].id, newer.id);
    }

    // ==================== Writer Tests ====================

    #[tokio::test]
    async fn test_writer_flushes_latest_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("queue.json"));
        let (tx, rx) = watch::channel(PersistRequest::default());
        let handle = spawn_writer(store.clone(), rx);

        for revision in 1..=5 {
            let items = (0..revision).map(|_| item(DownloadState::Queued)).collect();
            tx.send_replace(PersistRequest {
                revision,
                snapshot: QueueSnapshot { items },
            });
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.load().items.len(), 5);
    }
}
