use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use shared::{
    domain::DiscussionId,
    protocol::{EventKind, ServerEvent},
};
use tokio::sync::broadcast;
use tracing::trace;

const STREAM_CAPACITY: usize = 256;

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Identifies one registered callback; removal is by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: u64,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Registry of typed callbacks keyed by [`EventKind`].
///
/// Callbacks for one kind run in registration order, on the task that
/// delivers the event. The lock is never held while a callback runs, so
/// callbacks may subscribe or unsubscribe from inside a delivery.
pub struct EventDispatcher {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(u64, Handler)>>>,
    stream: broadcast::Sender<ServerEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
            stream,
        }
    }
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        trace!(event = kind.name(), id, "dispatcher: subscribed");
        SubscriptionHandle { kind, id }
    }

    /// Subscribes to events of `kind` whose payload belongs to `discussion_id`.
    pub fn subscribe_discussion<F>(
        &self,
        kind: EventKind,
        discussion_id: DiscussionId,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.subscribe(kind, move |event| {
            if event.discussion_id() == Some(&discussion_id) {
                handler(event);
            }
        })
    }

    /// Returns whether a callback was removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&handle.kind);
        }
        removed
    }

    /// Removes every callback for `kind`, returning how many there were.
    pub fn unsubscribe_all(&self, kind: EventKind) -> usize {
        self.handlers
            .write()
            .remove(&kind)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Async view of every dispatched event, for consumers outside the
    /// callback registry. Slow receivers observe `Lagged`.
    pub fn stream(&self) -> broadcast::Receiver<ServerEvent> {
        self.stream.subscribe()
    }

    /// Delivers one event to the callbacks registered for its kind and
    /// returns how many ran.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler)> = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => Vec::new(),
        };

        let mut invoked = 0;
        for (id, handler) in snapshot {
            // A callback earlier in this delivery may have removed a later one.
            if !self.is_registered(kind, id) {
                continue;
            }
            handler(event);
            invoked += 1;
        }
        let _ = self.stream.send(event.clone());
        trace!(event = kind.name(), invoked, "dispatcher: delivered");
        invoked
    }

    fn is_registered(&self, kind: EventKind, id: u64) -> bool {
        self.handlers
            .read()
            .get(&kind)
            .is_some_and(|list| list.iter().any(|(existing, _)| *existing == id))
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
