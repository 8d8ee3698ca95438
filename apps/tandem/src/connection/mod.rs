//! Per-peer offer/answer/ICE negotiation.
//!
//! Every mutation of a [`PeerSession`] happens under its own lock, never held
//! across an await. Asynchronous transport steps capture the session generation
//! before they start and re-check it when they complete; a bumped generation
//! (close, glare yield, failure reset) turns the completion into a no-op.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use cipher_envelope::ContextSalt;
use parking_lot::{Mutex, MutexGuard};
use signal_mailbox::{IceCandidate, MailboxClient, MailboxError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

mod state;

pub use state::ConnectionState;

use crate::config::SessionConfig;
use crate::message::{MessageRecord, MessageSink};
use crate::session::SessionError;
use crate::session::events::{EventHub, SessionEvent};
use crate::telemetry::logging::hexdump;
use crate::transport::{
    PeerTransport, SessionDescription, TransportError, TransportEvent, TransportFactory,
    TransportState,
};

/// Collaborators shared by every session of one registry.
pub(crate) struct SessionContext {
    pub local_id: String,
    pub mailbox: MailboxClient,
    pub factory: Arc<dyn TransportFactory>,
    pub config: SessionConfig,
    pub events: Arc<EventHub>,
    pub messages: Option<Arc<dyn MessageSink>>,
}

#[derive(Debug, Error)]
enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("completion for superseded generation {0}")]
    Stale(u64),
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    pending_ice: VecDeque<IceCandidate>,
    remote_description_set: bool,
    flushing_ice: bool,
    transport_connected: bool,
    channel_open: bool,
    /// This side produced the offer of the current attempt cycle.
    has_sent_offer: bool,
    failures: u32,
}

pub struct PeerSession {
    peer: String,
    ctx: Arc<SessionContext>,
    inner: Mutex<Inner>,
}

impl PeerSession {
    pub(crate) fn new(peer: impl Into<String>, ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.into(),
            ctx,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Remote candidates waiting for a remote description.
    pub fn pending_ice(&self) -> usize {
        self.inner.lock().pending_ice.len()
    }

    pub fn is_offerer(&self) -> bool {
        self.inner.lock().has_sent_offer
    }

    pub fn channel_open(&self) -> bool {
        self.inner.lock().channel_open
    }

    /// Glare tie-break: the lexicographically smaller identity answers.
    fn is_polite(&self) -> bool {
        self.ctx.local_id.as_str() < self.peer.as_str()
    }

    /// Begins an outgoing negotiation. Returns `false` without side effects
    /// unless the session is `Idle`.
    pub async fn start_connection(self: &Arc<Self>) -> bool {
        let (generation, stale) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Idle {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    state = %inner.state,
                    "start ignored; negotiation already in progress"
                );
                return false;
            }
            let (generation, stale) = begin_attempt(&mut inner);
            inner.has_sent_offer = true;
            self.transition(&mut inner, ConnectionState::Offering);
            (generation, stale)
        };
        close_detached(stale);

        if let Err(err) = self.run_offer(generation).await {
            self.abort(generation, err);
        }
        true
    }

    async fn run_offer(self: &Arc<Self>, generation: u64) -> Result<(), NegotiationError> {
        let transport = self.open_transport(generation).await?;
        self.phase(
            "create data channel",
            transport.create_data_channel(&self.ctx.config.data_channel_label),
        )
        .await?;
        let offer = self.phase("create offer", transport.create_offer()).await?;
        self.phase("set local offer", transport.set_local_description(offer.clone()))
            .await?;
        {
            // Transition before sending so an immediate answer finds us ready.
            let mut inner = self.current(generation, &[ConnectionState::Offering])?;
            self.transition(&mut inner, ConnectionState::AwaitingRemoteAnswer);
        }
        self.ctx.mailbox.send_offer(&self.peer, offer.sdp).await?;
        tracing::info!(
            target = "tandem::session",
            peer = %self.peer,
            generation,
            "offer sent"
        );
        self.arm_watchdog(generation, ConnectionState::AwaitingRemoteAnswer);
        Ok(())
    }

    pub async fn on_remote_offer(self: &Arc<Self>, sdp: String) {
        let (generation, superseded) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Idle => {}
                ConnectionState::Connected if !transport_alive(&inner) => {
                    tracing::info!(
                        target = "tandem::session",
                        peer = %self.peer,
                        "peer restarted negotiation over a dead transport; answering"
                    );
                }
                state if state.has_local_offer() => {
                    if !self.is_polite() {
                        tracing::info!(
                            target = "tandem::session",
                            peer = %self.peer,
                            state = %state,
                            "glare: keeping local offer; remote side yields"
                        );
                        return;
                    }
                    tracing::info!(
                        target = "tandem::session",
                        peer = %self.peer,
                        state = %state,
                        "glare: discarding local offer for remote one"
                    );
                }
                state => {
                    tracing::warn!(
                        target = "tandem::session",
                        peer = %self.peer,
                        state = %state,
                        "dropping offer received in invalid state"
                    );
                    return;
                }
            }
            let (generation, superseded) = begin_attempt(&mut inner);
            inner.has_sent_offer = false;
            self.transition(&mut inner, ConnectionState::AnsweringRemoteOffer);
            (generation, superseded)
        };
        close_detached(superseded);

        if let Err(err) = self.run_answer(generation, sdp).await {
            self.abort(generation, err);
        }
    }

    async fn run_answer(self: &Arc<Self>, generation: u64, sdp: String) -> Result<(), NegotiationError> {
        let transport = self.open_transport(generation).await?;
        self.phase(
            "set remote offer",
            transport.set_remote_description(SessionDescription::offer(sdp)),
        )
        .await?;
        {
            let mut inner = self.current(generation, &[ConnectionState::AnsweringRemoteOffer])?;
            inner.remote_description_set = true;
        }
        self.flush_ice(generation).await;

        let answer = self.phase("create answer", transport.create_answer()).await?;
        self.phase("set local answer", transport.set_local_description(answer.clone()))
            .await?;
        {
            let mut inner = self.current(generation, &[ConnectionState::AnsweringRemoteOffer])?;
            self.enter_ice_negotiating(&mut inner);
        }
        self.ctx.mailbox.send_answer(&self.peer, answer.sdp).await?;
        tracing::info!(
            target = "tandem::session",
            peer = %self.peer,
            generation,
            "answer sent"
        );
        self.arm_watchdog(generation, ConnectionState::IceNegotiating);
        Ok(())
    }

    pub async fn on_remote_answer(self: &Arc<Self>, sdp: String) {
        let (generation, transport) = {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::AwaitingRemoteAnswer {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    state = %inner.state,
                    "dropping answer received in invalid state"
                );
                return;
            }
            let Some(transport) = inner.transport.clone() else {
                return;
            };
            (inner.generation, transport)
        };

        let result = async {
            self.phase(
                "set remote answer",
                transport.set_remote_description(SessionDescription::answer(sdp)),
            )
            .await?;
            {
                let mut inner = self.current(generation, &[ConnectionState::AwaitingRemoteAnswer])?;
                inner.remote_description_set = true;
                self.enter_ice_negotiating(&mut inner);
            }
            self.flush_ice(generation).await;
            self.arm_watchdog(generation, ConnectionState::IceNegotiating);
            Ok::<(), NegotiationError>(())
        }
        .await;
        if let Err(err) = result {
            self.abort(generation, err);
        }
    }

    /// Applies a remote candidate now, or buffers it until the remote
    /// description lands. Buffered candidates are applied in arrival order.
    pub async fn on_remote_ice(self: &Arc<Self>, candidate: IceCandidate) {
        let generation = {
            let mut inner = self.inner.lock();
            if !inner.state.accepts_remote_ice() {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    state = %inner.state,
                    "dropping remote candidate"
                );
                return;
            }
            if inner.transport_connected || transport_alive(&inner) {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    "dropping remote candidate; transport already connected"
                );
                return;
            }
            inner.pending_ice.push_back(candidate);
            if !inner.remote_description_set {
                tracing::trace!(
                    target = "tandem::session",
                    peer = %self.peer,
                    buffered = inner.pending_ice.len(),
                    "buffering remote candidate"
                );
                return;
            }
            inner.generation
        };
        self.flush_ice(generation).await;
    }

    /// Drains buffered candidates into the transport. Only one drain runs per
    /// generation at a time, which keeps application FIFO.
    async fn flush_ice(&self, generation: u64) {
        let transport = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !inner.remote_description_set || inner.flushing_ice {
                return;
            }
            let Some(transport) = inner.transport.clone() else {
                return;
            };
            inner.flushing_ice = true;
            transport
        };
        loop {
            let candidate = {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                if inner.transport_connected {
                    inner.pending_ice.clear();
                }
                match inner.pending_ice.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        inner.flushing_ice = false;
                        return;
                    }
                }
            };
            let text = candidate.candidate.clone();
            match self.phase("add ice candidate", transport.add_ice_candidate(candidate)).await {
                Ok(()) => tracing::trace!(
                    target = "tandem::session",
                    peer = %self.peer,
                    candidate = %text,
                    "applied remote candidate"
                ),
                Err(err) => tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    candidate = %text,
                    error = %err,
                    "failed to apply remote candidate"
                ),
            }
        }
    }

    async fn on_local_ice(&self, generation: u64, candidate: IceCandidate) {
        {
            let inner = self.inner.lock();
            if inner.generation != generation || inner.state.is_terminal() {
                return;
            }
            if inner.state == ConnectionState::Connected || inner.transport_connected {
                tracing::trace!(
                    target = "tandem::session",
                    peer = %self.peer,
                    "suppressing local candidate after connect"
                );
                return;
            }
        }
        if let Err(err) = self.ctx.mailbox.send_ice(&self.peer, &candidate).await {
            tracing::warn!(
                target = "tandem::session",
                peer = %self.peer,
                error = %err,
                "failed to send local candidate"
            );
        }
    }

    fn on_transport_state_change(self: &Arc<Self>, generation: u64, state: TransportState) {
        tracing::debug!(
            target = "tandem::session",
            peer = %self.peer,
            generation,
            transport_state = ?state,
            "transport state changed"
        );
        match state {
            TransportState::Connected => {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                inner.transport_connected = true;
                inner.pending_ice.clear();
                if inner.state == ConnectionState::IceNegotiating {
                    self.mark_connected(&mut inner);
                }
            }
            TransportState::Failed => self.fail(generation, "ice connection failed".to_string()),
            TransportState::Disconnected => {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    "transport disconnected; waiting for recovery or failure"
                );
                self.arm_disconnect_grace(generation);
            }
            TransportState::Closed => self.on_transport_drop(generation, "transport closed"),
            TransportState::New | TransportState::Checking => {}
        }
    }

    /// A connected session whose transport goes away fails like any other
    /// attempt, so the offerer re-offers and the answerer waits for a fresh
    /// offer.
    fn on_transport_drop(self: &Arc<Self>, generation: u64, reason: &str) {
        let dropped = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.channel_open = false;
            inner.transport_connected = false;
            inner.state == ConnectionState::Connected
        };
        if dropped {
            self.fail(generation, reason.to_string());
        }
    }

    fn arm_disconnect_grace(self: &Arc<Self>, generation: u64) {
        let session = Arc::downgrade(self);
        let grace = self.ctx.config.phase_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let recovered = {
                let inner = session.inner.lock();
                inner.generation != generation || transport_alive(&inner)
            };
            if !recovered {
                session.on_transport_drop(generation, "transport disconnected");
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => self.on_local_ice(generation, candidate).await,
            TransportEvent::StateChanged(state) => self.on_transport_state_change(generation, state),
            TransportEvent::DataChannelOpen => {
                let mut inner = self.inner.lock();
                if inner.generation == generation {
                    inner.channel_open = true;
                }
            }
            TransportEvent::DataChannelClosed => {
                tracing::info!(
                    target = "tandem::session",
                    peer = %self.peer,
                    generation,
                    "data channel closed by remote"
                );
                self.on_transport_drop(generation, "data channel closed");
            }
            TransportEvent::Message(payload) => self.on_channel_message(generation, payload),
        }
    }

    fn on_channel_message(&self, generation: u64, payload: Bytes) {
        {
            let inner = self.inner.lock();
            if inner.generation != generation || inner.state.is_terminal() {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    "dropping data from superseded transport"
                );
                return;
            }
        }
        match cipher_envelope::open(&payload) {
            Ok(text) => {
                if let Some(sink) = self.ctx.messages.as_ref() {
                    sink.record(MessageRecord::now(self.peer.as_str(), text.as_str(), self.peer.as_str()));
                }
                self.ctx.events.publish(SessionEvent::MessageReceived {
                    peer: self.peer.clone(),
                    text,
                });
            }
            Err(err) => {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    frame_len = payload.len(),
                    error = %err,
                    "failed to open message envelope"
                );
                tracing::trace!(
                    target = "tandem::session",
                    frame = %hexdump(&payload),
                    "undecodable frame"
                );
                self.ctx.events.publish(SessionEvent::DecryptionFailed {
                    peer: self.peer.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    /// Seals `text` and writes it to the data channel.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let transport = {
            let inner = self.inner.lock();
            match (inner.state, inner.transport.clone()) {
                (ConnectionState::Connected, Some(transport)) => transport,
                _ => return Err(SessionError::NotConnected(self.peer.clone())),
            }
        };
        let envelope = cipher_envelope::seal(text, &ContextSalt::for_route(&self.ctx.local_id, &self.peer))?;
        match timeout(self.ctx.config.phase_timeout, transport.send(Bytes::from(envelope))).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout("data channel send").into()),
        }
        if let Some(sink) = self.ctx.messages.as_ref() {
            sink.record(MessageRecord::now(self.ctx.local_id.as_str(), text, self.peer.as_str()));
        }
        Ok(())
    }

    /// Releases the transport and buffered candidates. Safe to call at any
    /// point and more than once.
    pub async fn close(&self) {
        let transport = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            let (_, transport) = begin_attempt(&mut inner);
            inner.pending_ice.clear();
            self.transition(&mut inner, ConnectionState::Closed);
            transport
        };
        if let Some(transport) = transport {
            if let Err(err) = transport.close().await {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    error = %err,
                    "transport close failed"
                );
            }
        }
        tracing::info!(target = "tandem::session", peer = %self.peer, "session closed");
    }

    async fn open_transport(
        self: &Arc<Self>,
        generation: u64,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self
            .phase("create transport", self.ctx.factory.create(&self.peer, events_tx))
            .await?;
        let installed = {
            let mut inner = self.inner.lock();
            if inner.generation == generation && !inner.state.is_terminal() {
                inner.transport = Some(transport.clone());
                true
            } else {
                false
            }
        };
        if !installed {
            let _ = transport.close().await;
            return Err(NegotiationError::Stale(generation));
        }
        self.spawn_event_pump(generation, events_rx);
        Ok(transport)
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if session.generation() != generation {
                    break;
                }
                session.handle_transport_event(generation, event).await;
            }
            tracing::trace!(target = "tandem::session", generation, "transport event pump ended");
        });
    }

    async fn phase<T>(
        &self,
        label: &'static str,
        step: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, NegotiationError> {
        match timeout(self.ctx.config.phase_timeout, step).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(label).into()),
        }
    }

    fn current(
        &self,
        generation: u64,
        expected: &[ConnectionState],
    ) -> Result<MutexGuard<'_, Inner>, NegotiationError> {
        let inner = self.inner.lock();
        if inner.generation != generation || !expected.contains(&inner.state) {
            return Err(NegotiationError::Stale(generation));
        }
        Ok(inner)
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        tracing::debug!(
            target = "tandem::session",
            peer = %self.peer,
            from = %inner.state,
            to = %next,
            generation = inner.generation,
            "state transition"
        );
        inner.state = next;
        self.ctx.events.publish(SessionEvent::StateChanged {
            peer: self.peer.clone(),
            state: next,
        });
    }

    fn enter_ice_negotiating(&self, inner: &mut Inner) {
        self.transition(inner, ConnectionState::IceNegotiating);
        if inner.transport_connected {
            self.mark_connected(inner);
        }
    }

    fn mark_connected(&self, inner: &mut Inner) {
        self.transition(inner, ConnectionState::Connected);
        inner.failures = 0;
        tracing::info!(
            target = "tandem::session",
            peer = %self.peer,
            generation = inner.generation,
            "peer connected"
        );
        self.ctx.events.publish(SessionEvent::Connected {
            peer: self.peer.clone(),
        });
    }

    fn abort(self: &Arc<Self>, generation: u64, err: NegotiationError) {
        match err {
            NegotiationError::Stale(_) => {
                tracing::debug!(
                    target = "tandem::session",
                    peer = %self.peer,
                    generation,
                    "ignoring stale completion"
                );
            }
            err => {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    generation,
                    error = %err,
                    "negotiation step failed"
                );
                self.fail(generation, err.to_string());
            }
        }
    }

    /// Moves to `Failed`, tears the attempt down and either schedules a retry
    /// (original offerer), waits for a fresh offer (answerer), or reports a
    /// terminal failure once retries are exhausted.
    fn fail(self: &Arc<Self>, generation: u64, reason: String) {
        let (stale, retry) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state.is_terminal() {
                return;
            }
            self.transition(&mut inner, ConnectionState::Failed);
            inner.failures += 1;
            let attempt = inner.failures;
            let was_offerer = inner.has_sent_offer;
            let (next_generation, stale) = begin_attempt(&mut inner);
            inner.pending_ice.clear();
            if attempt > self.ctx.config.max_retries {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    attempts = attempt,
                    reason = %reason,
                    "connection failed; retries exhausted"
                );
                self.ctx.events.publish(SessionEvent::ConnectionFailed {
                    peer: self.peer.clone(),
                    reason,
                });
                (stale, None)
            } else {
                tracing::warn!(
                    target = "tandem::session",
                    peer = %self.peer,
                    attempt,
                    reason = %reason,
                    will_reoffer = was_offerer,
                    "connection attempt failed"
                );
                self.transition(&mut inner, ConnectionState::Idle);
                (stale, was_offerer.then_some((attempt, next_generation)))
            }
        };
        close_detached(stale);
        if let Some((attempt, next_generation)) = retry {
            let delay = self.ctx.config.backoff_for(attempt);
            tokio::spawn(retry_after(Arc::downgrade(self), delay, next_generation));
        }
    }

    fn arm_watchdog(self: &Arc<Self>, generation: u64, phase: ConnectionState) {
        let session = Arc::downgrade(self);
        let wait = self.ctx.config.phase_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let expired = {
                let inner = session.inner.lock();
                inner.generation == generation && inner.state == phase
            };
            if expired {
                session.fail(generation, format!("{phase} timed out"));
            }
        });
    }
}

/// Resets per-attempt state and returns the new generation plus the
/// transport of the superseded attempt.
fn begin_attempt(inner: &mut Inner) -> (u64, Option<Arc<dyn PeerTransport>>) {
    inner.generation += 1;
    inner.remote_description_set = false;
    inner.flushing_ice = false;
    inner.transport_connected = false;
    inner.channel_open = false;
    (inner.generation, inner.transport.take())
}

fn transport_alive(inner: &Inner) -> bool {
    inner
        .transport
        .as_ref()
        .is_some_and(|transport| transport.is_connected())
}

fn close_detached(transport: Option<Arc<dyn PeerTransport>>) {
    if let Some(transport) = transport {
        tokio::spawn(async move {
            if let Err(err) = transport.close().await {
                tracing::debug!(target = "tandem::session", error = %err, "closing superseded transport failed");
            }
        });
    }
}

fn retry_after(
    session: Weak<PeerSession>,
    delay: Duration,
    generation: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.generation() != generation {
            return;
        }
        tracing::info!(
            target = "tandem::session",
            peer = %session.peer,
            "retrying connection"
        );
        session.start_connection().await;
    })
}
