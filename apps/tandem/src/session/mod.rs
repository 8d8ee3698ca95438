//! Per-identity map of peer sessions plus inbound signaling dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cipher_envelope::EnvelopeError;
use parking_lot::Mutex;
use signal_mailbox::{IceCandidate, Mailbox, MailboxClient, MailboxError, SignalKind, SignalingMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod events;

pub use events::{EventHub, EventSubscription, SessionEvent};

use crate::config::SessionConfig;
use crate::connection::{ConnectionState, PeerSession, SessionContext};
use crate::message::MessageSink;
use crate::transport::{TransportError, TransportFactory};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a connection with {0} is already in progress")]
    AlreadyConnecting(String),
    #[error("cannot connect to {0:?}")]
    InvalidPeer(String),
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("no session with {0}")]
    UnknownPeer(String),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

pub struct SessionRegistryBuilder {
    local_id: String,
    mailbox: Arc<dyn Mailbox>,
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    messages: Option<Arc<dyn MessageSink>>,
}

impl SessionRegistryBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn message_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.messages = Some(sink);
        self
    }

    pub fn build(self) -> Arc<SessionRegistry> {
        let ctx = SessionContext {
            mailbox: MailboxClient::new(self.local_id.clone(), self.mailbox),
            local_id: self.local_id,
            factory: self.factory,
            config: self.config,
            events: EventHub::new(),
            messages: self.messages,
        };
        Arc::new(SessionRegistry {
            ctx: Arc::new(ctx),
            sessions: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
        })
    }
}

/// Ordered inbound queue for one sender, drained by its own task.
struct Lane {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    queued: Arc<AtomicUsize>,
}

/// Owns at most one [`PeerSession`] per remote identity.
pub struct SessionRegistry {
    ctx: Arc<SessionContext>,
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl SessionRegistry {
    pub fn builder(
        local_id: impl Into<String>,
        mailbox: Arc<dyn Mailbox>,
        factory: Arc<dyn TransportFactory>,
    ) -> SessionRegistryBuilder {
        SessionRegistryBuilder {
            local_id: local_id.into(),
            mailbox,
            factory,
            config: SessionConfig::default(),
            messages: None,
        }
    }

    pub fn new(
        local_id: impl Into<String>,
        mailbox: Arc<dyn Mailbox>,
        factory: Arc<dyn TransportFactory>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Self::builder(local_id, mailbox, factory).config(config).build()
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.ctx.events.subscribe()
    }

    pub fn subscribe_peer(&self, peer: &str) -> EventSubscription {
        self.ctx.events.subscribe_peer(peer)
    }

    pub fn state(&self, peer: &str) -> Option<ConnectionState> {
        self.session(peer).map(|session| session.state())
    }

    pub fn session(&self, peer: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.sessions.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Starts an outgoing connection. An existing session that is mid-handshake
    /// or connected yields [`SessionError::AlreadyConnecting`]; a failed one is
    /// replaced.
    pub async fn connect(&self, peer: &str) -> Result<(), SessionError> {
        if peer.trim().is_empty() || peer == self.ctx.local_id {
            return Err(SessionError::InvalidPeer(peer.to_string()));
        }
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer) {
                Some(existing) if existing.state().is_busy() => {
                    return Err(SessionError::AlreadyConnecting(peer.to_string()));
                }
                Some(existing) if existing.state() == ConnectionState::Idle => existing.clone(),
                _ => {
                    let session = PeerSession::new(peer, self.ctx.clone());
                    sessions.insert(peer.to_string(), session.clone());
                    session
                }
            }
        };
        tracing::info!(target = "tandem::registry", peer, "connecting");
        if !session.start_connection().await {
            return Err(SessionError::AlreadyConnecting(peer.to_string()));
        }
        Ok(())
    }

    /// Dispatches one signaling message to the session for its sender,
    /// creating the session on first contact.
    pub async fn route(&self, message: SignalingMessage) {
        if message.target != self.ctx.local_id {
            tracing::warn!(
                target = "tandem::registry",
                target_id = %message.target,
                "dropping signaling addressed to another identity"
            );
            return;
        }
        if message.sender.is_empty() || message.sender == self.ctx.local_id {
            tracing::warn!(
                target = "tandem::registry",
                sender = %message.sender,
                "dropping signaling with invalid sender"
            );
            return;
        }

        // Parse before touching the registry so garbage never creates sessions.
        let candidate = match message.kind {
            SignalKind::Ice => match IceCandidate::from_payload(&message.payload) {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    tracing::warn!(
                        target = "tandem::registry",
                        sender = %message.sender,
                        error = %err,
                        "dropping malformed ice candidate"
                    );
                    return;
                }
            },
            SignalKind::Offer | SignalKind::Answer => None,
        };

        let session = self.session_for_inbound(&message.sender, message.kind);
        tracing::debug!(
            target = "tandem::registry",
            sender = %message.sender,
            kind = %message.kind,
            state = %session.state(),
            "routing signaling message"
        );
        match (message.kind, candidate) {
            (SignalKind::Offer, _) => session.on_remote_offer(message.payload).await,
            (SignalKind::Answer, _) => session.on_remote_answer(message.payload).await,
            (SignalKind::Ice, Some(candidate)) => session.on_remote_ice(candidate).await,
            (SignalKind::Ice, None) => {}
        }
    }

    fn session_for_inbound(&self, peer: &str, kind: SignalKind) -> Arc<PeerSession> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(peer) {
            let replace = kind == SignalKind::Offer && existing.state().is_terminal();
            if !replace {
                return existing.clone();
            }
        }
        let session = PeerSession::new(peer, self.ctx.clone());
        sessions.insert(peer.to_string(), session.clone());
        session
    }

    /// Seals and sends `text` over the data channel to `peer`.
    pub async fn send_message(&self, peer: &str, text: &str) -> Result<(), SessionError> {
        let session = self
            .session(peer)
            .ok_or_else(|| SessionError::UnknownPeer(peer.to_string()))?;
        session.send_text(text).await
    }

    /// Closes and forgets the session with `peer`.
    pub async fn teardown(&self, peer: &str) {
        let session = self.sessions.lock().remove(peer);
        if let Some(session) = session {
            session.close().await;
            tracing::info!(target = "tandem::registry", peer, "session torn down");
        }
        self.release_idle_lane(peer, None);
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<PeerSession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        self.lanes.lock().clear();
    }

    /// Senders that currently hold an inbound lane.
    pub fn inbound_lanes(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Subscribes to the local mailbox and routes every inbound message.
    /// Messages from one sender are handled in order; different senders
    /// negotiate concurrently.
    pub async fn spawn_inbox(self: &Arc<Self>) -> Result<JoinHandle<()>, SessionError> {
        let mut inbox = self.ctx.mailbox.subscribe().await?;
        let registry = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let Some(this) = registry.upgrade() else {
                    break;
                };
                this.enqueue(message);
            }
            tracing::debug!(target = "tandem::registry", "inbox closed");
        }))
    }

    fn enqueue(self: &Arc<Self>, message: SignalingMessage) {
        let mut lanes = self.lanes.lock();
        let sender = message.sender.clone();
        let lane = lanes
            .entry(sender.clone())
            .or_insert_with(|| self.spawn_lane(&sender));
        lane.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(message)) = lane.tx.send(message) {
            let fresh = self.spawn_lane(&sender);
            fresh.queued.fetch_add(1, Ordering::SeqCst);
            let _ = fresh.tx.send(message);
            lanes.insert(sender, fresh);
        }
    }

    fn spawn_lane(self: &Arc<Self>, sender: &str) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let queued = Arc::new(AtomicUsize::new(0));
        let registry = Arc::downgrade(self);
        let counter = queued.clone();
        let sender = sender.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.route(message).await;
                if counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                    registry.release_idle_lane(&sender, Some(&counter));
                }
            }
            tracing::trace!(target = "tandem::registry", sender = %sender, "inbound lane ended");
        });
        Lane { tx, queued }
    }

    /// Drops the lane of a sender that has no session and nothing queued.
    /// Dropping the lane's sender half lets its task finish.
    fn release_idle_lane(&self, sender: &str, owner: Option<&Arc<AtomicUsize>>) {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get(sender) else {
            return;
        };
        if owner.is_some_and(|owner| !Arc::ptr_eq(owner, &lane.queued)) {
            return;
        }
        if lane.queued.load(Ordering::SeqCst) > 0 || self.sessions.lock().contains_key(sender) {
            return;
        }
        lanes.remove(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockNetwork, MockTransportFactory};
    use signal_mailbox::LocalMailbox;

    fn registry(local: &str) -> Arc<SessionRegistry> {
        let network = MockNetwork::new();
        SessionRegistry::new(
            local,
            Arc::new(LocalMailbox::new()),
            Arc::new(MockTransportFactory::new(network, local)),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn connect_to_self_or_empty_is_rejected() {
        let alice = registry("alice");
        assert!(matches!(alice.connect("alice").await, Err(SessionError::InvalidPeer(_))));
        assert!(matches!(alice.connect("").await, Err(SessionError::InvalidPeer(_))));
        assert!(alice.peers().is_empty());
    }

    #[tokio::test]
    async fn second_connect_while_negotiating_is_refused() {
        let alice = registry("alice");
        alice.connect("bob").await.unwrap();
        assert_eq!(alice.state("bob"), Some(ConnectionState::AwaitingRemoteAnswer));
        assert!(matches!(
            alice.connect("bob").await,
            Err(SessionError::AlreadyConnecting(peer)) if peer == "bob"
        ));
    }

    #[tokio::test]
    async fn malformed_ice_creates_no_session() {
        let alice = registry("alice");
        alice
            .route(SignalingMessage::new(SignalKind::Ice, "bob", "alice", "garbage"))
            .await;
        assert!(alice.peers().is_empty());
    }

    #[tokio::test]
    async fn misaddressed_signaling_is_ignored() {
        let alice = registry("alice");
        alice
            .route(SignalingMessage::new(SignalKind::Offer, "bob", "carol", "v=0"))
            .await;
        assert!(alice.state("bob").is_none());
    }

    #[tokio::test]
    async fn early_candidate_is_buffered_in_fresh_session() {
        let alice = registry("alice");
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", "0", 0);
        alice
            .route(SignalingMessage::new(SignalKind::Ice, "bob", "alice", candidate.to_payload()))
            .await;
        let session = alice.session("bob").unwrap();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert_eq!(session.pending_ice(), 1);
    }

    #[tokio::test]
    async fn send_without_session_reports_unknown_peer() {
        let alice = registry("alice");
        assert!(matches!(
            alice.send_message("bob", "hi").await,
            Err(SessionError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn teardown_forgets_the_peer() {
        let alice = registry("alice");
        alice.connect("bob").await.unwrap();
        let session = alice.session("bob").unwrap();
        alice.teardown("bob").await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(alice.state("bob").is_none());
        alice.connect("bob").await.unwrap();
        assert_eq!(alice.state("bob"), Some(ConnectionState::AwaitingRemoteAnswer));
    }
}
