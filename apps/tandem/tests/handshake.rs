use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_mailbox::{
    IceCandidate, Inbox, LocalMailbox, Mailbox, MailboxResult, SignalKind, SignalingMessage,
};
use tandem_core::transport::mock::{CANDIDATES_PER_TRANSPORT, MockNetwork, MockTransportFactory};
use tandem_core::transport::{
    PeerTransport, SessionDescription, TransportError, TransportEvents, TransportFactory,
};
use tandem_core::{
    ConnectionState, EventSubscription, MemoryMessageLog, SessionConfig, SessionError, SessionEvent,
    SessionRegistry,
};
use tokio::sync::Notify;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> SessionConfig {
    SessionConfig {
        phase_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
        max_retries: 2,
        ..SessionConfig::default()
    }
}

fn peer(
    name: &str,
    mailbox: &Arc<LocalMailbox>,
    network: &Arc<MockNetwork>,
    config: SessionConfig,
) -> Arc<SessionRegistry> {
    SessionRegistry::new(
        name,
        mailbox.clone(),
        Arc::new(MockTransportFactory::new(network.clone(), name)),
        config,
    )
}

async fn next_matching(
    events: &mut EventSubscription,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event hub dropped"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

async fn connected(events: &mut EventSubscription, peer: &str) {
    next_matching(events, |event| {
        matches!(event, SessionEvent::Connected { peer: p } if p == peer)
    })
    .await;
}

/// Local relay that keeps a copy of everything sent through it.
#[derive(Default)]
struct RecordingMailbox {
    relay: LocalMailbox,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl RecordingMailbox {
    fn count(&self, sender: &str, kind: SignalKind) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|message| message.sender == sender && message.kind == kind)
            .count()
    }
}

#[async_trait]
impl Mailbox for RecordingMailbox {
    async fn send(&self, message: SignalingMessage) -> MailboxResult<()> {
        self.sent.lock().push(message.clone());
        self.relay.send(message).await
    }

    async fn subscribe(&self, recipient: &str) -> MailboxResult<Inbox> {
        self.relay.subscribe(recipient).await
    }
}

/// Mock transports whose `set_local_description` is applied but does not
/// complete until the test releases it.
struct HeldFactory {
    mock: MockTransportFactory,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

struct HeldTransport {
    inner: Arc<dyn PeerTransport>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl TransportFactory for HeldFactory {
    async fn create(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(HeldTransport {
            inner: self.mock.create(peer, events).await?,
            entered: self.entered.clone(),
            release: self.release.clone(),
        }))
    }
}

#[async_trait]
impl PeerTransport for HeldTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.inner.create_offer().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.inner.create_answer().await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.inner.set_local_description(desc).await?;
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.inner.set_remote_description(desc).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.inner.add_ice_candidate(candidate).await
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.inner.create_data_channel(label).await
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.inner.send(payload).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

fn held_peer(
    name: &str,
    mailbox: &Arc<RecordingMailbox>,
    network: &Arc<MockNetwork>,
) -> (Arc<SessionRegistry>, Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = SessionRegistry::new(
        name,
        mailbox.clone(),
        Arc::new(HeldFactory {
            mock: MockTransportFactory::new(network.clone(), name),
            entered: entered.clone(),
            release: release.clone(),
        }),
        fast_config(),
    );
    (registry, entered, release)
}

async fn reaches_state(registry: &SessionRegistry, peer: &str, state: ConnectionState) {
    timeout(WAIT, async {
        while registry.state(peer) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for session state");
}

fn offer_from(id: u64) -> String {
    format!("v=0\r\no=mock {id} 0 IN IP4 127.0.0.1\r\ns=offer\r\n")
}

fn remote_candidate(index: usize) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:99-{index} 1 udp 2130706431 10.0.0.9 {} typ host", 5000 + index),
        "0",
        0,
    )
}

#[tokio::test]
async fn alice_and_bob_connect_and_exchange_a_message() {
    let mailbox = Arc::new(RecordingMailbox::default());
    let network = MockNetwork::new();
    let alice_log = Arc::new(MemoryMessageLog::new());
    let bob_log = Arc::new(MemoryMessageLog::new());
    let alice = SessionRegistry::builder(
        "alice",
        mailbox.clone(),
        Arc::new(MockTransportFactory::new(network.clone(), "alice")),
    )
    .config(fast_config())
    .message_sink(alice_log.clone())
    .build();
    let bob = SessionRegistry::builder(
        "bob",
        mailbox.clone(),
        Arc::new(MockTransportFactory::new(network.clone(), "bob")),
    )
    .config(fast_config())
    .message_sink(bob_log.clone())
    .build();
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;
    assert_eq!(alice.state("bob"), Some(ConnectionState::Connected));
    assert_eq!(bob.state("alice"), Some(ConnectionState::Connected));
    assert!(alice.session("bob").unwrap().is_offerer());
    assert!(!bob.session("alice").unwrap().is_offerer());

    // Each side sends every gathered candidate and applies only the other's.
    assert_eq!(mailbox.count("alice", SignalKind::Ice), CANDIDATES_PER_TRANSPORT);
    assert_eq!(mailbox.count("bob", SignalKind::Ice), CANDIDATES_PER_TRANSPORT);
    let alice_transport = network.transports("alice", "bob")[0];
    let bob_transport = network.transports("bob", "alice")[0];
    for (local, remote) in [(alice_transport, bob_transport), (bob_transport, alice_transport)] {
        let applied = network.applied_candidates(local);
        assert!((1..=CANDIDATES_PER_TRANSPORT).contains(&applied.len()));
        let prefix = format!("candidate:{remote}-");
        assert!(applied.iter().all(|c| c.candidate.starts_with(&prefix)));
    }

    // Candidates gathered after connect never reach the relay.
    network.regather(alice_transport);
    network.regather(bob_transport);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mailbox.count("alice", SignalKind::Ice), CANDIDATES_PER_TRANSPORT);
    assert_eq!(mailbox.count("bob", SignalKind::Ice), CANDIDATES_PER_TRANSPORT);

    alice.send_message("bob", "hi").await.unwrap();
    let received = next_matching(&mut bob_events, |event| {
        matches!(event, SessionEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        SessionEvent::MessageReceived {
            peer: "alice".into(),
            text: "hi".into()
        }
    );

    let sent = alice_log.conversation("bob");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].sender, "alice");
    let delivered = bob_log.conversation("alice");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text, "hi");
    assert_eq!(delivered[0].sender, "alice");
}

#[tokio::test]
async fn concurrent_connects_send_exactly_one_offer() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let mut bob_inbox = mailbox.subscribe("bob").await.unwrap();

    let (first, second) = tokio::join!(alice.connect("bob"), alice.connect("bob"));
    assert!(first.is_ok() != second.is_ok());
    let refused = if first.is_err() { first } else { second };
    assert!(matches!(refused, Err(SessionError::AlreadyConnecting(_))));

    let mut offers = 0;
    while let Ok(message) = bob_inbox.try_recv() {
        if message.kind == SignalKind::Offer {
            offers += 1;
        }
    }
    assert_eq!(offers, 1);
    assert_eq!(network.transports("alice", "bob").len(), 1);
}

#[tokio::test]
async fn glare_is_resolved_by_the_smaller_identity_answering() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    // Both offers are in flight before either side reads its inbox.
    alice.connect("bob").await.unwrap();
    bob.connect("alice").await.unwrap();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;

    assert!(!alice.session("bob").unwrap().is_offerer());
    assert!(bob.session("alice").unwrap().is_offerer());
    let alice_transports = network.transports("alice", "bob");
    assert_eq!(alice_transports.len(), 2);
    assert!(network.is_closed(alice_transports[0]));
    assert_eq!(network.transports("bob", "alice").len(), 1);
}

#[tokio::test]
async fn early_candidates_are_applied_in_arrival_order() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());

    for index in 0..3 {
        alice
            .route(SignalingMessage::new(
                SignalKind::Ice,
                "bob",
                "alice",
                remote_candidate(index).to_payload(),
            ))
            .await;
    }
    assert_eq!(alice.session("bob").unwrap().pending_ice(), 3);

    alice
        .route(SignalingMessage::new(SignalKind::Offer, "bob", "alice", offer_from(99)))
        .await;
    assert_eq!(alice.state("bob"), Some(ConnectionState::IceNegotiating));
    let session = alice.session("bob").unwrap();
    assert_eq!(session.pending_ice(), 0);

    let transport = network.transports("alice", "bob")[0];
    let applied = network.applied_candidates(transport);
    assert_eq!(
        applied,
        (0..3).map(remote_candidate).collect::<Vec<_>>()
    );

    // Once the remote description is in place candidates go straight through.
    alice
        .route(SignalingMessage::new(
            SignalKind::Ice,
            "bob",
            "alice",
            remote_candidate(3).to_payload(),
        ))
        .await;
    assert_eq!(network.applied_candidates(transport).len(), 4);
    assert!(mailbox.pending("bob") >= 1);
}

#[tokio::test]
async fn connect_is_refused_while_negotiating_ice() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    alice
        .route(SignalingMessage::new(SignalKind::Offer, "bob", "alice", offer_from(42)))
        .await;
    assert_eq!(alice.state("bob"), Some(ConnectionState::IceNegotiating));

    assert!(matches!(
        alice.connect("bob").await,
        Err(SessionError::AlreadyConnecting(peer)) if peer == "bob"
    ));
    assert_eq!(network.transports("alice", "bob").len(), 1);
}

#[tokio::test]
async fn malformed_candidate_is_dropped_without_disturbing_the_session() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    alice.connect("bob").await.unwrap();

    for payload in ["", "only,two", "candidate:1,0,not-a-number", ",0,0"] {
        alice
            .route(SignalingMessage::new(SignalKind::Ice, "bob", "alice", payload))
            .await;
    }
    let session = alice.session("bob").unwrap();
    assert_eq!(session.state(), ConnectionState::AwaitingRemoteAnswer);
    assert_eq!(session.pending_ice(), 0);
}

#[tokio::test]
async fn candidates_after_connect_are_ignored() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut bob_events = bob.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut bob_events, "alice").await;

    let transport = *network.transports("bob", "alice").last().unwrap();
    let before = network.applied_candidates(transport).len();
    bob.route(SignalingMessage::new(
        SignalKind::Ice,
        "alice",
        "bob",
        remote_candidate(7).to_payload(),
    ))
    .await;
    assert_eq!(network.applied_candidates(transport).len(), before);
    assert_eq!(bob.session("alice").unwrap().pending_ice(), 0);
    assert_eq!(bob.state("alice"), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn unreachable_peer_exhausts_retries_then_fails_for_good() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    network.set_partitioned(true);
    let config = SessionConfig {
        phase_timeout: Duration::from_millis(200),
        retry_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        max_retries: 2,
        ..SessionConfig::default()
    };
    let alice = peer("alice", &mailbox, &network, config.clone());
    let bob = peer("bob", &mailbox, &network, config);
    let mut alice_events = alice.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    let failure = next_matching(&mut alice_events, |event| {
        matches!(event, SessionEvent::ConnectionFailed { .. })
    })
    .await;
    assert_eq!(failure.peer(), "bob");
    assert_eq!(alice.state("bob"), Some(ConnectionState::Failed));
    assert_eq!(network.transports("alice", "bob").len(), 3);

    // A terminal failure stays put: no further attempts are scheduled.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(network.transports("alice", "bob").len(), 3);
    assert!(matches!(
        alice.send_message("bob", "anyone?").await,
        Err(SessionError::NotConnected(_))
    ));
}

#[tokio::test]
async fn offerer_recovers_after_transport_failure() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;

    network.fail(network.transports("bob", "alice")[0]);
    network.fail(network.transports("alice", "bob")[0]);

    next_matching(&mut alice_events, |event| {
        matches!(event, SessionEvent::StateChanged { state: ConnectionState::Failed, .. })
    })
    .await;
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;
    assert_eq!(network.transports("alice", "bob").len(), 2);
    assert!(alice.session("bob").unwrap().is_offerer());
}

#[tokio::test]
async fn garbage_on_the_data_channel_reports_decryption_failure() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut bob_events = bob.subscribe_peer("alice");
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut bob_events, "alice").await;

    let transport = *network.transports("bob", "alice").last().unwrap();
    network.inject(transport, Bytes::from_static(b"far too short"));
    let event = next_matching(&mut bob_events, |event| {
        matches!(event, SessionEvent::DecryptionFailed { .. })
    })
    .await;
    assert_eq!(event.peer(), "alice");
    assert_eq!(bob.state("alice"), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn teardown_releases_the_transport() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    let session = alice.session("bob").unwrap();

    alice.teardown("bob").await;
    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(alice.state("bob").is_none());
    assert!(network.is_closed(network.transports("alice", "bob")[0]));
    assert!(matches!(
        alice.send_message("bob", "hello?").await,
        Err(SessionError::UnknownPeer(_))
    ));

    // Closing twice is harmless.
    session.close().await;
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn peer_that_tore_down_can_reconnect() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;

    alice.teardown("bob").await;
    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;
    assert_eq!(alice.state("bob"), Some(ConnectionState::Connected));
    assert_eq!(bob.state("alice"), Some(ConnectionState::Connected));

    let bob_transports = network.transports("bob", "alice");
    assert_eq!(bob_transports.len(), 2);
    assert!(network.is_closed(bob_transports[0]));

    alice.send_message("bob", "again").await.unwrap();
    let received = next_matching(&mut bob_events, |event| {
        matches!(event, SessionEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        SessionEvent::MessageReceived {
            peer: "alice".into(),
            text: "again".into()
        }
    );
}

#[tokio::test]
async fn answerer_returns_to_idle_when_the_offerer_goes_away() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe_peer("alice");
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;

    alice.teardown("bob").await;
    next_matching(&mut bob_events, |event| {
        matches!(event, SessionEvent::StateChanged { state: ConnectionState::Failed, .. })
    })
    .await;
    reaches_state(&bob, "alice", ConnectionState::Idle).await;
    assert!(matches!(
        bob.send_message("alice", "still there?").await,
        Err(SessionError::NotConnected(_))
    ));

    // The answerer never re-offers on its own.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(network.transports("bob", "alice").len(), 1);
    assert_eq!(bob.state("alice"), Some(ConnectionState::Idle));
}

#[tokio::test]
async fn offerer_reoffers_after_the_answerer_drops() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;

    bob.teardown("alice").await;
    next_matching(&mut alice_events, |event| {
        matches!(event, SessionEvent::StateChanged { state: ConnectionState::Failed, .. })
    })
    .await;
    connected(&mut alice_events, "bob").await;
    connected(&mut bob_events, "alice").await;
    assert!(alice.session("bob").unwrap().is_offerer());
    assert_eq!(network.transports("alice", "bob").len(), 2);
}

#[tokio::test]
async fn teardown_during_offer_discards_the_late_completion() {
    let mailbox = Arc::new(RecordingMailbox::default());
    let network = MockNetwork::new();
    let (alice, entered, release) = held_peer("alice", &mailbox, &network);

    let connecting = tokio::spawn({
        let alice = alice.clone();
        async move { alice.connect("bob").await }
    });
    timeout(WAIT, entered.notified()).await.expect("offer never reached set_local_description");
    let session = alice.session("bob").unwrap();
    assert_eq!(session.state(), ConnectionState::Offering);

    alice.teardown("bob").await;
    release.notify_one();
    timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(alice.state("bob").is_none());
    assert_eq!(mailbox.count("alice", SignalKind::Offer), 0);
    let transports = network.transports("alice", "bob");
    assert_eq!(transports.len(), 1);
    assert!(network.is_closed(transports[0]));
}

#[tokio::test]
async fn teardown_during_answer_discards_the_late_completion() {
    let mailbox = Arc::new(RecordingMailbox::default());
    let network = MockNetwork::new();
    let (alice, entered, release) = held_peer("alice", &mailbox, &network);

    let answering = tokio::spawn({
        let alice = alice.clone();
        async move {
            alice
                .route(SignalingMessage::new(SignalKind::Offer, "bob", "alice", offer_from(77)))
                .await
        }
    });
    timeout(WAIT, entered.notified()).await.expect("answer never reached set_local_description");
    let session = alice.session("bob").unwrap();
    assert_eq!(session.state(), ConnectionState::AnsweringRemoteOffer);

    alice.teardown("bob").await;
    release.notify_one();
    timeout(WAIT, answering).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(mailbox.count("alice", SignalKind::Answer), 0);
    let transports = network.transports("alice", "bob");
    assert_eq!(transports.len(), 1);
    assert!(network.is_closed(transports[0]));
}

#[tokio::test]
async fn teardown_releases_the_senders_inbound_lane() {
    let mailbox = Arc::new(LocalMailbox::new());
    let network = MockNetwork::new();
    let alice = peer("alice", &mailbox, &network, fast_config());
    let bob = peer("bob", &mailbox, &network, fast_config());
    let mut alice_events = alice.subscribe();
    alice.spawn_inbox().await.unwrap();
    bob.spawn_inbox().await.unwrap();

    alice.connect("bob").await.unwrap();
    connected(&mut alice_events, "bob").await;
    // Let bob's trailing candidates drain through the lane.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.inbound_lanes(), 1);

    alice.teardown("bob").await;
    assert_eq!(alice.inbound_lanes(), 0);
}
