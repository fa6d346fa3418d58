//! Per-item publish/subscribe for engine events.
//!
//! Every subscriber owns an unbounded channel, so a slow consumer never loses
//! events and never blocks a worker. Events for one item arrive in the order
//! they were published. A late subscriber only sees what is published after it
//! subscribed.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::download::codec::Format;
use crate::download::output::OutputEvent;

/// Notifications about work items.
///
/// Terminal events may be delivered more than once; consumers should treat
/// them as idempotent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Queued { id: String },
    Started { id: String, format: Format },
    Progress { id: String, event: OutputEvent },
    FellBack { id: String, from: Format, to: Format },
    Completed { id: String, output_path: Option<String> },
    Failed { id: String, message: String },
    Cancelled { id: String },
}

impl EngineEvent {
    pub fn id(&self) -> &str {
        match self {
            EngineEvent::Queued { id }
            | EngineEvent::Started { id, .. }
            | EngineEvent::Progress { id, .. }
            | EngineEvent::FellBack { id, .. }
            | EngineEvent::Completed { id, .. }
            | EngineEvent::Failed { id, .. }
            | EngineEvent::Cancelled { id } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::Completed { .. } | EngineEvent::Failed { .. } | EngineEvent::Cancelled { .. }
        )
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
struct Subscribers {
    per_item: HashMap<String, Vec<UnboundedSender<EngineEvent>>>,
    all: Vec<UnboundedSender<EngineEvent>>,
}

impl Subscribers {
    /// Forget subscriptions whose receiver was dropped, including those of
    /// items that will never publish again.
    fn prune(&mut self) {
        self.per_item.retain(|_, senders| {
            senders.retain(|tx| !tx.is_closed());
            !senders.is_empty()
        });
        self.all.retain(|tx| !tx.is_closed());
    }
}

/// Fan-out of engine events to item and global subscribers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Events of a single work item.
    pub fn subscribe(&self, id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.lock();
        subs.prune();
        subs.per_item.entry(id.to_string()).or_default().push(tx);
        Subscription { rx }
    }

    /// Events of every work item.
    pub fn subscribe_all(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.lock();
        subs.prune();
        subs.all.push(tx);
        Subscription { rx }
    }

    /// Deliver to every current subscriber of the item. Closed subscriptions are pruned.
    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self.lock();

        if let Some(senders) = subs.per_item.get_mut(event.id()) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                subs.per_item.remove(event.id());
            }
        }
        subs.all.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let subs = self.lock();
        subs.all.len() + subs.per_item.values().map(Vec::len).sum::<usize>()
    }
}
