use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::codec::{Format, MediaKind};
use crate::download::expander::DownloadJob;
use crate::download::options::DownloadOptions;
use crate::download::output::OutputEvent;
use crate::storage::snapshot::PersistRequest;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Queued,
    Downloading,
    Processing,
    Complete,
    Error,
    Cancelled,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Downloading => "downloading",
            DownloadState::Processing => "processing",
            DownloadState::Complete => "complete",
            DownloadState::Error => "error",
            DownloadState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Complete | DownloadState::Error | DownloadState::Cancelled
        )
    }

    /// A worker owns the item and a process may be running.
    pub fn is_active(self) -> bool {
        matches!(self, DownloadState::Downloading | DownloadState::Processing)
    }

    /// Allowed edges of the state machine. `Error|Cancelled -> Queued` is retry.
    pub fn can_transition_to(self, to: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, to),
            (Queued, Downloading)
                | (Downloading, Processing)
                | (Processing, Complete)
                | (Downloading | Processing, Error)
                | (Queued | Downloading | Processing, Cancelled)
                | (Error | Cancelled, Queued)
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete download attempt: a primary or one of its companions.
///
/// Items of the same request share `job_id`. `requested` is always
/// `fallback_chain[fallback_index]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub job_id: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub overrides: Option<DownloadOptions>,
    pub media: MediaKind,
    pub requested: Format,
    pub fallback_chain: Vec<Format>,
    #[serde(default)]
    pub fallback_index: usize,
    #[serde(default)]
    pub specialist: bool,
    #[serde(default)]
    pub suffix: Option<String>,
    pub state: DownloadState,

    // Transient progress, reset on retry and on reload
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub current_track: Option<String>,
    #[serde(default)]
    pub track_index: Option<u32>,
    #[serde(default)]
    pub total_tracks: Option<u32>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub eta: Option<String>,

    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    /// Format that actually succeeded; `None` until the item is complete
    #[serde(default)]
    pub codec_used: Option<String>,
    #[serde(default)]
    pub fallback_occurred: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Creates a queued item with a fresh UUID.
    ///
    /// The chain is normalised so that it starts with `requested`.
    pub fn new(job: &DownloadJob, job_id: &str, media: MediaKind, requested: Format, chain: Vec<Format>) -> Self {
        let mut fallback_chain = vec![requested];
        fallback_chain.extend(chain.into_iter().filter(|f| *f != requested));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            urls: job.urls.clone(),
            overrides: job.options.clone(),
            media,
            requested,
            fallback_chain,
            fallback_index: 0,
            specialist: false,
            suffix: None,
            state: DownloadState::Queued,
            progress: 0.0,
            current_track: None,
            track_index: None,
            total_tracks: None,
            current_step: None,
            speed: None,
            eta: None,
            error: None,
            output_path: None,
            codec_used: None,
            fallback_occurred: false,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn specialist(mut self, specialist: bool) -> Self {
        self.specialist = specialist;
        self
    }

    #[must_use]
    pub fn suffix(mut self, suffix: Option<&str>) -> Self {
        self.suffix = suffix.map(str::to_string);
        self
    }

    /// Clear everything that only describes a running attempt.
    pub fn reset_transient(&mut self) {
        self.progress = 0.0;
        self.current_track = None;
        self.track_index = None;
        self.total_tracks = None;
        self.current_step = None;
        self.speed = None;
        self.eta = None;
    }

    /// Whether another format is left to try.
    pub fn has_fallback(&self) -> bool {
        self.fallback_index + 1 < self.fallback_chain.len()
    }

    /// Apply one parsed output event. Returns false when nothing changed.
    fn apply_output(&mut self, event: &OutputEvent) -> bool {
        match event {
            OutputEvent::Progress { percent, speed, eta } => {
                let overall = match (self.track_index, self.total_tracks) {
                    (Some(index), Some(total)) if total > 0 && index >= 1 => {
                        (f64::from(index - 1) + percent / 100.0) / f64::from(total) * 100.0
                    }
                    _ => *percent,
                };
                // High-water mark; 100 is reserved for `complete`.
                self.progress = self.progress.max(overall.min(config::queue::PROGRESS_CAP));
                if !speed.is_empty() {
                    self.speed = Some(speed.clone());
                }
                self.eta = Some(eta.clone());
                true
            }
            OutputEvent::TrackInfo {
                title,
                artist,
                index,
                total,
                ..
            } => {
                self.current_track = Some(if artist.is_empty() {
                    title.clone()
                } else {
                    format!("{} - {}", artist, title)
                });
                if index.is_some() {
                    self.track_index = *index;
                }
                if total.is_some() {
                    self.total_tracks = *total;
                }
                true
            }
            OutputEvent::ProcessingStep { step } => {
                self.current_step = Some(step.clone());
                if self.state == DownloadState::Downloading {
                    self.state = DownloadState::Processing;
                }
                true
            }
            OutputEvent::Error { message } => {
                self.error = Some(message.clone());
                true
            }
            OutputEvent::Complete { path } => {
                self.output_path = Some(path.clone());
                true
            }
            OutputEvent::Unrecognized { .. } => false,
        }
    }
}

/// Every work item, in queue order. Serialised as a plain JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueSnapshot {
    pub items: Vec<WorkItem>,
}

impl QueueSnapshot {
    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn count(&self, state: DownloadState) -> usize {
        self.items.iter().filter(|item| item.state == state).count()
    }
}

/// A queued item handed to a worker, plus the token that cancels it.
#[derive(Debug)]
pub struct Claim {
    pub item: WorkItem,
    pub token: CancellationToken,
    /// Identifies this claim among later claims of the same item
    pub ticket: u64,
}

/// Token registered for an item a worker currently owns.
struct ActiveClaim {
    ticket: u64,
    token: CancellationToken,
}

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was queued, now cancelled
    Cancelled,
    /// A worker was told to stop its process
    Signalled,
    /// Already complete, failed or cancelled
    AlreadyFinished,
}

struct QueueInner {
    items: Vec<WorkItem>,
    /// Cancellation tokens of items a worker currently owns
    active: HashMap<String, ActiveClaim>,
    next_ticket: u64,
    revision: u64,
    persist: Option<watch::Sender<PersistRequest>>,
}

impl QueueInner {
    fn find_mut(&mut self, id: &str) -> AppResult<&mut WorkItem> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| AppError::NotFound(id.to_string()))
    }

    /// Hand the current state to the snapshot writer. Runs under the store lock
    /// so snapshots can never be reordered relative to mutations.
    fn persist(&mut self) {
        if let Some(tx) = &self.persist {
            self.revision += 1;
            tx.send_replace(PersistRequest {
                revision: self.revision,
                snapshot: QueueSnapshot {
                    items: self.items.clone(),
                },
            });
        }
    }
}

fn transition(item: &mut WorkItem, to: DownloadState) -> AppResult<()> {
    if !item.state.can_transition_to(to) {
        log::warn!("Rejected transition for {}: {} -> {}", item.id, item.state, to);
        return Err(AppError::InvalidTransition {
            id: item.id.clone(),
            from: item.state,
            to,
        });
    }
    item.state = to;
    Ok(())
}

/// Authoritative in-memory state of every work item.
///
/// All reads and writes go through one mutex; each mutation is pushed to the
/// snapshot writer before the lock is released.
pub struct QueueStore {
    inner: Mutex<QueueInner>,
    work_available: Notify,
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStore {
    /// Creates an empty store without persistence.
    pub fn new() -> Self {
        Self::with_items(Vec::new(), None)
    }

    /// Creates a store seeded with reconciled items, optionally wired to a snapshot writer.
    pub fn with_items(items: Vec<WorkItem>, persist: Option<watch::Sender<PersistRequest>>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items,
                active: HashMap::new(),
                next_ticket: 0,
                revision: 0,
                persist,
            }),
            work_available: Notify::new(),
        }
    }

    /// Appends items in order. All-or-nothing: a duplicate id rejects the batch.
    pub async fn enqueue(&self, items: Vec<WorkItem>) -> AppResult<()> {
        self.enqueue_with(items, |_| {}).await
    }

    /// Like [`enqueue`](Self::enqueue), running `announce` before any worker can claim the items.
    pub async fn enqueue_with<F>(&self, items: Vec<WorkItem>, announce: F) -> AppResult<()>
    where
        F: FnOnce(&[WorkItem]),
    {
        if items.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        for (i, item) in items.iter().enumerate() {
            let clash = inner.items.iter().any(|existing| existing.id == item.id)
                || items[..i].iter().any(|earlier| earlier.id == item.id);
            if clash {
                return Err(AppError::UserInput(format!("duplicate work item id {}", item.id)));
            }
        }

        log::info!("Queued {} work item(s)", items.len());
        announce(items.as_slice());
        inner.items.extend(items);
        inner.persist();
        drop(inner);

        self.work_available.notify_one();
        Ok(())
    }

    /// Atomically move the oldest queued item to `downloading` and register its token.
    pub async fn claim_next(&self) -> Option<Claim> {
        let mut inner = self.inner.lock().await;
        let item = inner.items.iter_mut().find(|item| item.state == DownloadState::Queued)?;
        item.state = DownloadState::Downloading;
        item.error = None;
        let claimed = item.clone();

        let token = CancellationToken::new();
        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        inner.active.insert(
            claimed.id.clone(),
            ActiveClaim {
                ticket,
                token: token.clone(),
            },
        );
        let more_waiting = inner.items.iter().any(|item| item.state == DownloadState::Queued);
        inner.persist();
        drop(inner);

        // Chain the wakeup so every idle worker gets a chance at the backlog.
        if more_waiting {
            self.work_available.notify_one();
        }

        log::debug!("Claimed {} ({})", claimed.id, claimed.requested);
        Some(Claim {
            item: claimed,
            token,
            ticket,
        })
    }

    /// Park until something may have been queued.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }

    pub async fn get(&self, id: &str) -> Option<WorkItem> {
        let inner = self.inner.lock().await;
        inner.items.iter().find(|item| item.id == id).cloned()
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        QueueSnapshot {
            items: inner.items.clone(),
        }
    }

    /// True when nothing is queued or running.
    pub async fn is_idle(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.active.is_empty()
            && !inner
                .items
                .iter()
                .any(|item| item.state == DownloadState::Queued || item.state.is_active())
    }

    /// Fold a parsed output event into the item's status fields.
    pub async fn apply_output(&self, id: &str, event: &OutputEvent) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        let changed = inner.find_mut(id)?.apply_output(event);
        if changed {
            inner.persist();
        }
        Ok(changed)
    }

    /// Clean exit: route through `processing` and finish at 100%.
    pub async fn complete(&self, id: &str) -> AppResult<WorkItem> {
        let mut inner = self.inner.lock().await;
        let item = inner.find_mut(id)?;
        if item.state == DownloadState::Downloading {
            transition(item, DownloadState::Processing)?;
        }
        transition(item, DownloadState::Complete)?;
        item.progress = 100.0;
        item.codec_used = Some(item.requested.as_str().to_string());
        item.error = None;
        item.current_step = None;
        item.eta = None;
        let done = item.clone();
        // The claim ends with the state change, before anyone can retry.
        inner.active.remove(id);
        inner.persist();
        Ok(done)
    }

    pub async fn fail(&self, id: &str, message: String) -> AppResult<WorkItem> {
        let mut inner = self.inner.lock().await;
        let item = inner.find_mut(id)?;
        transition(item, DownloadState::Error)?;
        item.error = Some(message);
        item.codec_used = None;
        item.speed = None;
        item.eta = None;
        let failed = item.clone();
        inner.active.remove(id);
        inner.persist();
        Ok(failed)
    }

    /// Move to the next fallback format, keeping id, state and the progress high-water mark.
    ///
    /// Returns the format that failed and the updated item, or `None` when the
    /// chain is exhausted.
    pub async fn advance_fallback(&self, id: &str) -> AppResult<Option<(Format, WorkItem)>> {
        let mut inner = self.inner.lock().await;
        let item = inner.find_mut(id)?;
        if !item.has_fallback() {
            return Ok(None);
        }

        let from = item.requested;
        item.fallback_index += 1;
        item.requested = item.fallback_chain[item.fallback_index];
        item.fallback_occurred = true;
        item.error = None;
        item.output_path = None;
        item.speed = None;
        item.eta = None;
        item.current_step = None;
        let updated = item.clone();
        inner.persist();

        log::info!("Falling back {} -> {} for {}", from, updated.requested, id);
        Ok(Some((from, updated)))
    }

    /// The process of an item whose cancel was requested has exited.
    pub async fn finish_cancelled(&self, id: &str) -> AppResult<WorkItem> {
        let mut inner = self.inner.lock().await;
        inner.active.remove(id);
        let item = inner.find_mut(id)?;
        transition(item, DownloadState::Cancelled)?;
        item.speed = None;
        item.eta = None;
        let cancelled = item.clone();
        inner.persist();
        Ok(cancelled)
    }

    /// Drop the worker's claim on an item.
    ///
    /// A no-op once the item has been claimed again under a newer ticket.
    pub async fn release(&self, id: &str, ticket: u64) {
        let mut inner = self.inner.lock().await;
        if inner.active.get(id).is_some_and(|active| active.ticket == ticket) {
            inner.active.remove(id);
        }
    }

    /// Cancel a queued item immediately or signal the worker owning an active one.
    pub async fn cancel(&self, id: &str) -> AppResult<CancelOutcome> {
        let mut inner = self.inner.lock().await;
        let state = inner.find_mut(id)?.state;

        match state {
            DownloadState::Queued => {
                let item = inner.find_mut(id)?;
                transition(item, DownloadState::Cancelled)?;
                inner.persist();
                log::info!("Cancelled queued item {}", id);
                Ok(CancelOutcome::Cancelled)
            }
            DownloadState::Downloading | DownloadState::Processing => {
                if let Some(active) = inner.active.get(id) {
                    active.token.cancel();
                }
                log::info!("Cancellation requested for {}", id);
                Ok(CancelOutcome::Signalled)
            }
            DownloadState::Complete | DownloadState::Error | DownloadState::Cancelled => {
                Ok(CancelOutcome::AlreadyFinished)
            }
        }
    }

    /// Put a failed or cancelled item back in the queue from the top of its chain.
    ///
    /// Returns false when the item is not in a retryable state.
    pub async fn retry(&self, id: &str) -> AppResult<bool> {
        self.retry_with(id, |_| {}).await
    }

    /// Like [`retry`](Self::retry), running `announce` before any worker can claim the item.
    pub async fn retry_with<F>(&self, id: &str, announce: F) -> AppResult<bool>
    where
        F: FnOnce(&WorkItem),
    {
        let mut inner = self.inner.lock().await;
        let item = inner.find_mut(id)?;
        if !matches!(item.state, DownloadState::Error | DownloadState::Cancelled) {
            return Ok(false);
        }

        transition(item, DownloadState::Queued)?;
        item.reset_transient();
        item.fallback_index = 0;
        if let Some(first) = item.fallback_chain.first() {
            item.requested = *first;
        }
        item.error = None;
        item.output_path = None;
        item.codec_used = None;
        item.fallback_occurred = false;
        announce(&*item);
        inner.persist();
        drop(inner);

        log::info!("Retrying {}", id);
        self.work_available.notify_one();
        Ok(true)
    }

    /// Remove every complete, failed and cancelled item.
    pub async fn clear_finished(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.items.len();
        inner.items.retain(|item| !item.state.is_terminal());
        let removed = before - inner.items.len();
        if removed > 0 {
            inner.persist();
        }
        removed
    }

    /// One job per `job_id` that still has unfinished work, in queue order.
    pub async fn pending_jobs(&self) -> Vec<DownloadJob> {
        let inner = self.inner.lock().await;
        let mut seen: Vec<&str> = Vec::new();
        let mut jobs = Vec::new();
        for item in inner.items.iter().filter(|item| !item.state.is_terminal()) {
            if seen.contains(&item.job_id.as_str()) {
                continue;
            }
            seen.push(&item.job_id);
            jobs.push(DownloadJob {
                urls: item.urls.clone(),
                options: item.overrides.clone(),
            });
        }
        jobs
    }

    /// Persist the current state without a mutation, e.g. right after reconciliation.
    pub async fn checkpoint(&self) {
        self.inner.lock().await.persist();
    }

    /// Stop feeding the snapshot writer; it flushes the last state and exits.
    pub async fn close_persistence(&self) {
        self.inner.lock().await.persist = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::codec::SongCodec;
    use pretty_assertions::assert_eq;

    fn job() -> DownloadJob {
        DownloadJob {
            urls: vec!["https://music.apple.com/us/album/x/1".to_string()],
            options: None,
        }
    }

    fn item_with_chain(chain: &[SongCodec]) -> WorkItem {
        let formats: Vec<Format> = chain.iter().map(|c| Format::Codec(*c)).collect();
        WorkItem::new(&job(), "job-1", MediaKind::Song, formats[0], formats)
    }

    fn item() -> WorkItem {
        item_with_chain(&[SongCodec::Alac])
    }

    fn progress(percent: f64) -> OutputEvent {
        OutputEvent::Progress {
            percent,
            speed: "1MiB/s".to_string(),
            eta: "00:10".to_string(),
        }
    }

    // ==================== State Machine Tests ====================

    #[test]
    fn test_allowed_transitions() {
        use DownloadState::*;
        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Complete));
        assert!(Downloading.can_transition_to(Error));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(Error.can_transition_to(Queued));
        assert!(Cancelled.can_transition_to(Queued));
    }

    #[test]
    fn test_rejected_transitions() {
        use DownloadState::*;
        assert!(!Complete.can_transition_to(Queued));
        assert!(!Complete.can_transition_to(Downloading));
        assert!(!Queued.can_transition_to(Complete));
        assert!(!Downloading.can_transition_to(Complete));
        assert!(!Error.can_transition_to(Downloading));
        assert!(!Processing.can_transition_to(Downloading));
    }

    #[test]
    fn test_new_item_chain_starts_with_requested() {
        let formats = vec![Format::Codec(SongCodec::Alac), Format::Codec(SongCodec::Aac)];
        let item = WorkItem::new(&job(), "j", MediaKind::Song, Format::Codec(SongCodec::Aac), formats);
        assert_eq!(
            item.fallback_chain,
            vec![Format::Codec(SongCodec::Aac), Format::Codec(SongCodec::Alac)]
        );
        assert_eq!(item.state, DownloadState::Queued);
        assert_eq!(item.codec_used, None);
    }

    // ==================== Queue Operation Tests ====================

    #[tokio::test]
    async fn test_claim_is_fifo_and_atomic() {
        let store = QueueStore::new();
        let first = item();
        let second = item();
        store.enqueue(vec![first.clone(), second.clone()]).await.unwrap();

        let claim = store.claim_next().await.unwrap();
        assert_eq!(claim.item.id, first.id);
        assert_eq!(claim.item.state, DownloadState::Downloading);

        let claim = store.claim_next().await.unwrap();
        assert_eq!(claim.item.id, second.id);
        assert!(store.claim_next().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();

        let err = store.enqueue(vec![item(), it]).await.unwrap_err();
        assert!(matches!(err, AppError::UserInput(_)));
        assert_eq!(store.snapshot().await.items.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_capped() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        store.apply_output(&it.id, &progress(50.0)).await.unwrap();
        store.apply_output(&it.id, &progress(20.0)).await.unwrap();
        assert_eq!(store.get(&it.id).await.unwrap().progress, 50.0);

        store.apply_output(&it.id, &progress(100.0)).await.unwrap();
        assert_eq!(store.get(&it.id).await.unwrap().progress, 99.9);

        let done = store.complete(&it.id).await.unwrap();
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.state, DownloadState::Complete);
        assert_eq!(done.codec_used.as_deref(), Some("alac"));
    }

    #[tokio::test]
    async fn test_album_progress_uses_track_position() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        let track = OutputEvent::TrackInfo {
            title: "Song".to_string(),
            artist: "Band".to_string(),
            album: None,
            index: Some(2),
            total: Some(4),
        };
        store.apply_output(&it.id, &track).await.unwrap();
        store.apply_output(&it.id, &progress(50.0)).await.unwrap();

        let current = store.get(&it.id).await.unwrap();
        assert_eq!(current.progress, 37.5);
        assert_eq!(current.current_track.as_deref(), Some("Band - Song"));
    }

    #[tokio::test]
    async fn test_unrecognized_output_changes_nothing() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();

        let changed = store
            .apply_output(&it.id, &OutputEvent::Unrecognized { raw: "noise".to_string() })
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(store.get(&it.id).await.unwrap(), it);
    }

    #[tokio::test]
    async fn test_processing_step_moves_to_processing() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        store
            .apply_output(&it.id, &OutputEvent::ProcessingStep { step: "Remuxing".to_string() })
            .await
            .unwrap();
        assert_eq!(store.get(&it.id).await.unwrap().state, DownloadState::Processing);
    }

    // ==================== Fallback Tests ====================

    #[tokio::test]
    async fn test_advance_fallback_keeps_id_and_progress() {
        let store = QueueStore::new();
        let it = item_with_chain(&[SongCodec::Alac, SongCodec::Aac]);
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store.apply_output(&it.id, &progress(40.0)).await.unwrap();

        let (from, updated) = store.advance_fallback(&it.id).await.unwrap().unwrap();
        assert_eq!(from, Format::Codec(SongCodec::Alac));
        assert_eq!(updated.id, it.id);
        assert_eq!(updated.requested, Format::Codec(SongCodec::Aac));
        assert_eq!(updated.state, DownloadState::Downloading);
        assert!(updated.fallback_occurred);
        assert_eq!(updated.progress, 40.0);

        assert!(store.advance_fallback(&it.id).await.unwrap().is_none());
    }

    // ==================== Cancel / Retry Tests ====================

    #[tokio::test]
    async fn test_cancel_queued_is_immediate() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();

        assert_eq!(store.cancel(&it.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(store.get(&it.id).await.unwrap().state, DownloadState::Cancelled);
        assert!(store.claim_next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_active_signals_token() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        let claim = store.claim_next().await.unwrap();

        assert_eq!(store.cancel(&it.id).await.unwrap(), CancelOutcome::Signalled);
        assert!(claim.token.is_cancelled());
        // state only changes once the process is gone
        assert_eq!(store.get(&it.id).await.unwrap().state, DownloadState::Downloading);

        let cancelled = store.finish_cancelled(&it.id).await.unwrap();
        assert_eq!(cancelled.state, DownloadState::Cancelled);
        assert_eq!(store.cancel(&it.id).await.unwrap(), CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_new_claim_cancellable() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();

        let first = store.claim_next().await.unwrap();
        store.fail(&it.id, "boom".to_string()).await.unwrap();
        assert!(store.retry(&it.id).await.unwrap());
        let second = store.claim_next().await.unwrap();
        assert_ne!(first.ticket, second.ticket);

        // The first worker finishes its bookkeeping after the item was reclaimed.
        store.release(&it.id, first.ticket).await;

        assert_eq!(store.cancel(&it.id).await.unwrap(), CancelOutcome::Signalled);
        assert!(second.token.is_cancelled());
        assert!(!first.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_finishing_drops_claim() {
        let store = QueueStore::new();
        let done = item();
        let failed = item();
        store.enqueue(vec![done.clone(), failed.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store.claim_next().await.unwrap();
        assert!(!store.is_idle().await);

        store.complete(&done.id).await.unwrap();
        store.fail(&failed.id, "boom".to_string()).await.unwrap();
        assert!(store.is_idle().await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id() {
        let store = QueueStore::new();
        assert!(matches!(store.cancel("missing").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_resets_item() {
        let store = QueueStore::new();
        let it = item_with_chain(&[SongCodec::Alac, SongCodec::Aac]);
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store.apply_output(&it.id, &progress(70.0)).await.unwrap();
        store.advance_fallback(&it.id).await.unwrap();
        store.fail(&it.id, "boom".to_string()).await.unwrap();

        assert!(store.retry(&it.id).await.unwrap());

        let retried = store.get(&it.id).await.unwrap();
        assert_eq!(retried.state, DownloadState::Queued);
        assert_eq!(retried.urls, it.urls);
        assert_eq!(retried.overrides, it.overrides);
        assert_eq!(retried.error, None);
        assert_eq!(retried.progress, 0.0);
        assert_eq!(retried.requested, Format::Codec(SongCodec::Alac));
        assert!(!retried.fallback_occurred);
    }

    #[tokio::test]
    async fn test_retry_rejects_non_failed_items() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        assert!(!store.retry(&it.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let store = QueueStore::new();
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();

        let err = store.fail(&it.id, "x".to_string()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_clear_finished_and_pending_jobs() {
        let store = QueueStore::new();
        let done = item();
        let waiting = item();
        store.enqueue(vec![done.clone(), waiting.clone()]).await.unwrap();
        store.claim_next().await.unwrap();
        store.complete(&done.id).await.unwrap();

        // both items share job-1, the queued one keeps the job alive
        assert_eq!(store.pending_jobs().await.len(), 1);
        assert_eq!(store.clear_finished().await, 1);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].id, waiting.id);
    }

    #[tokio::test]
    async fn test_mutations_reach_persistence_channel() {
        let (tx, rx) = watch::channel(PersistRequest::default());
        let store = QueueStore::with_items(Vec::new(), Some(tx));
        let it = item();
        store.enqueue(vec![it.clone()]).await.unwrap();
        store.claim_next().await.unwrap();

        let latest = rx.borrow().clone();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.snapshot.items[0].state, DownloadState::Downloading);
    }

    #[test]
    fn test_snapshot_is_plain_array() {
        let snapshot = QueueSnapshot { items: vec![item()] };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.is_array());
        let back: QueueSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
