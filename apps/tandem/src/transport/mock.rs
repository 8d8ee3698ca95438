//! In-process stand-in for a peer connection.
//!
//! Transports created from the same [`MockNetwork`] find each other through the
//! ids embedded in their descriptions and candidates. A pair connects once both
//! sides hold each other's descriptions and each has applied at least one
//! candidate gathered by the other, which mirrors what ICE needs in practice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{
    IceCandidate, PeerTransport, SessionDescription, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};

/// Host candidates gathered per transport.
pub const CANDIDATES_PER_TRANSPORT: usize = 2;

#[derive(Default)]
struct Endpoint {
    owner: String,
    peer: String,
    events: Option<TransportEvents>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_id: Option<u64>,
    applied: Vec<IceCandidate>,
    heard_from: HashSet<u64>,
    channel_label: Option<String>,
    connected: bool,
    closed: bool,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<u64, Endpoint>,
    partitioned: bool,
}

#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// While partitioned no pair can finish connectivity checks.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.state.lock().partitioned = partitioned;
    }

    /// Ids of transports `owner` created for talking to `peer`, oldest first.
    pub fn transports(&self, owner: &str, peer: &str) -> Vec<u64> {
        let state = self.state.lock();
        let mut ids: Vec<u64> = state
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.owner == owner && ep.peer == peer)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn applied_candidates(&self, id: u64) -> Vec<IceCandidate> {
        self.state
            .lock()
            .endpoints
            .get(&id)
            .map(|ep| ep.applied.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, id: u64) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&id)
            .map(|ep| ep.closed)
            .unwrap_or(true)
    }

    pub fn channel_label(&self, id: u64) -> Option<String> {
        self.state
            .lock()
            .endpoints
            .get(&id)
            .and_then(|ep| ep.channel_label.clone())
    }

    /// Reports an ICE failure on transport `id`.
    pub fn fail(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(ep) = state.endpoints.get_mut(&id) {
            ep.connected = false;
            ep.emit(TransportEvent::StateChanged(TransportState::Failed));
        }
    }

    /// Makes transport `id` gather one more local candidate.
    pub fn regather(&self, id: u64) {
        if let Some(ep) = self.state.lock().endpoints.get(&id) {
            ep.emit(TransportEvent::LocalCandidate(candidate_for(id, CANDIDATES_PER_TRANSPORT)));
        }
    }

    /// Emits a raw data-channel frame into transport `id`, bypassing its peer.
    pub fn inject(&self, id: u64, payload: Bytes) {
        if let Some(ep) = self.state.lock().endpoints.get(&id) {
            ep.emit(TransportEvent::Message(payload));
        }
    }

    fn register(&self, owner: &str, peer: &str, events: TransportEvents) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.endpoints.insert(
            id,
            Endpoint {
                owner: owner.to_string(),
                peer: peer.to_string(),
                events: Some(events),
                ..Endpoint::default()
            },
        );
        id
    }

    fn with_endpoint<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Endpoint) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.state.lock();
        let ep = state
            .endpoints
            .get_mut(&id)
            .ok_or(TransportError::ChannelClosed)?;
        if ep.closed {
            return Err(TransportError::ChannelClosed);
        }
        f(ep)
    }

    fn evaluate(&self, id: u64) {
        let mut state = self.state.lock();
        if state.partitioned {
            return;
        }
        let Some(a) = state.endpoints.get(&id) else {
            return;
        };
        let Some(remote_id) = a.remote_id else {
            return;
        };
        let Some(b) = state.endpoints.get(&remote_id) else {
            return;
        };
        let ready = !a.connected
            && !a.closed
            && !b.closed
            && a.local.is_some()
            && b.local.is_some()
            && b.remote_id == Some(id)
            && a.heard_from.contains(&remote_id)
            && b.heard_from.contains(&id);
        if !ready {
            return;
        }
        for side in [id, remote_id] {
            if let Some(ep) = state.endpoints.get_mut(&side) {
                ep.connected = true;
                ep.emit(TransportEvent::StateChanged(TransportState::Checking));
                ep.emit(TransportEvent::StateChanged(TransportState::Connected));
                ep.emit(TransportEvent::DataChannelOpen);
            }
        }
    }
}

fn description_sdp(id: u64, role: &str) -> String {
    format!("v=0\r\no=mock {id} 0 IN IP4 127.0.0.1\r\ns={role}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n")
}

fn id_from_sdp(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=mock "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

fn candidate_for(id: u64, index: usize) -> IceCandidate {
    IceCandidate::new(
        format!(
            "candidate:{id}-{index} 1 udp 2130706431 127.0.0.1 {} typ host",
            40_000 + id * 10 + index as u64
        ),
        "0",
        0,
    )
}

fn id_from_candidate(candidate: &IceCandidate) -> Option<u64> {
    candidate
        .candidate
        .strip_prefix("candidate:")
        .and_then(|rest| rest.split('-').next())
        .and_then(|id| id.parse().ok())
}

pub struct MockTransport {
    id: u64,
    network: Arc<MockNetwork>,
}

impl MockTransport {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.network
            .with_endpoint(self.id, |_| Ok(SessionDescription::offer(description_sdp(self.id, "offer"))))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.network.with_endpoint(self.id, |ep| {
            if ep.remote.is_none() {
                return Err(TransportError::Negotiation(
                    "answer requested before remote offer".into(),
                ));
            }
            Ok(SessionDescription::answer(description_sdp(self.id, "answer")))
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let id = self.id;
        self.network.with_endpoint(id, |ep| {
            ep.local = Some(desc);
            for index in 0..CANDIDATES_PER_TRANSPORT {
                ep.emit(TransportEvent::LocalCandidate(candidate_for(id, index)));
            }
            Ok(())
        })?;
        self.network.evaluate(id);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let remote_id = id_from_sdp(&desc.sdp)
            .ok_or_else(|| TransportError::Negotiation("unrecognised session description".into()))?;
        self.network.with_endpoint(self.id, |ep| {
            ep.remote = Some(desc);
            ep.remote_id = Some(remote_id);
            Ok(())
        })?;
        self.network.evaluate(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.network.with_endpoint(self.id, |ep| {
            if ep.remote.is_none() {
                return Err(TransportError::Negotiation(
                    "candidate added before remote description".into(),
                ));
            }
            if let Some(source) = id_from_candidate(&candidate) {
                ep.heard_from.insert(source);
            }
            ep.applied.push(candidate);
            Ok(())
        })?;
        self.network.evaluate(self.id);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.network.with_endpoint(self.id, |ep| {
            ep.channel_label = Some(label.to_string());
            Ok(())
        })
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let remote_id = match state.endpoints.get(&self.id) {
            Some(ep) if ep.closed => return Err(TransportError::ChannelClosed),
            Some(ep) if ep.connected => ep.remote_id,
            Some(_) => return Err(TransportError::NotReady),
            None => return Err(TransportError::ChannelClosed),
        };
        let Some(remote_id) = remote_id else {
            return Err(TransportError::ChannelClosed);
        };
        match state.endpoints.get_mut(&remote_id) {
            Some(remote) if remote.connected && !remote.closed => {
                remote.emit(TransportEvent::Message(payload));
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.network.state.lock();
        let remote_id = match state.endpoints.get_mut(&self.id) {
            Some(ep) if !ep.closed => {
                ep.closed = true;
                ep.connected = false;
                ep.events = None;
                ep.remote_id
            }
            _ => return Ok(()),
        };
        // The remote sees its channel close and then loses connectivity.
        if let Some(remote) = remote_id.and_then(|rid| state.endpoints.get_mut(&rid)) {
            if remote.connected && remote.remote_id == Some(self.id) {
                remote.connected = false;
                remote.emit(TransportEvent::DataChannelClosed);
                remote.emit(TransportEvent::StateChanged(TransportState::Disconnected));
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.network
            .state
            .lock()
            .endpoints
            .get(&self.id)
            .map(|ep| ep.connected)
            .unwrap_or(false)
    }
}

/// Factory handing out [`MockTransport`]s owned by one local identity.
pub struct MockTransportFactory {
    network: Arc<MockNetwork>,
    owner: String,
}

impl MockTransportFactory {
    pub fn new(network: Arc<MockNetwork>, owner: impl Into<String>) -> Self {
        Self {
            network,
            owner: owner.into(),
        }
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let id = self.network.register(&self.owner, peer, events);
        Ok(Arc::new(MockTransport {
            id,
            network: self.network.clone(),
        }))
    }
}
