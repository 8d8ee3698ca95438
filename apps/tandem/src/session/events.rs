use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::ConnectionState;

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { peer: String, state: ConnectionState },
    Connected { peer: String },
    /// Terminal: retries are exhausted and the session will not reconnect.
    ConnectionFailed { peer: String, reason: String },
    MessageReceived { peer: String, text: String },
    DecryptionFailed { peer: String, error: String },
}

impl SessionEvent {
    pub fn peer(&self) -> &str {
        match self {
            SessionEvent::StateChanged { peer, .. }
            | SessionEvent::Connected { peer }
            | SessionEvent::ConnectionFailed { peer, .. }
            | SessionEvent::MessageReceived { peer, .. }
            | SessionEvent::DecryptionFailed { peer, .. } => peer,
        }
    }
}

struct Subscriber {
    id: u64,
    peer: Option<String>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers. Subscribers
/// receive every event published while they are registered; none are dropped
/// for slow readers.
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>) -> EventSubscription {
        self.register(None)
    }

    /// Only events concerning `peer` are delivered.
    pub fn subscribe_peer(self: &Arc<Self>, peer: &str) -> EventSubscription {
        self.register(Some(peer.to_string()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn publish(&self, event: SessionEvent) {
        let mut state = self.state.lock();
        state.subscribers.retain(|sub| {
            if sub.peer.as_deref().is_some_and(|peer| peer != event.peer()) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    fn register(self: &Arc<Self>, peer: Option<String>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.subscribers.push(Subscriber { id, peer, tx });
        EventSubscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.state.lock().subscribers.retain(|sub| sub.id != id);
    }
}

/// Revocable handle on an [`EventHub`]. Dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    hub: Weak<EventHub>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery; events already queued can still be drained.
    pub fn unsubscribe(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
        self.hub = Weak::new();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
