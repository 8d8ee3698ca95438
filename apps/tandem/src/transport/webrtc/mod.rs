//! [`PeerTransport`] backed by a `webrtc` peer connection with one ordered
//! data channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    IceCandidate, PeerTransport, SdpKind, SessionDescription, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};
use crate::config::SessionConfig;

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates one peer connection per negotiation attempt, each configured with
/// a single STUN server.
pub struct WebRtcTransportFactory {
    api: API,
    stun_server: String,
}

impl WebRtcTransportFactory {
    pub fn new(stun_server: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api(SettingEngine::default())?,
            stun_server: stun_server.into(),
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self, TransportError> {
        Self::new(config.stun_server.clone())
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        tracing::debug!(target = "tandem::webrtc", peer, stun = %self.stun_server, "peer connection created");
        Ok(Arc::new(WebRtcTransport::new(peer.to_string(), pc, events)))
    }
}

struct WebRtcTransport {
    peer: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    dc_ready: Arc<Notify>,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    events: TransportEvents,
}

impl WebRtcTransport {
    fn new(peer: String, pc: Arc<RTCPeerConnection>, events: TransportEvents) -> Self {
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let dc_ready = Arc::new(Notify::new());

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!(target = "tandem::webrtc", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(from_init(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "tandem::webrtc", error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                tracing::debug!(target = "tandem::webrtc", peer = %peer, ?state, "peer connection state changed");
                let _ = events.send(TransportEvent::StateChanged(map_state(state)));
            })
        }));

        // The answering side adopts the channel announced in the remote offer.
        let adopt_slot = channel.clone();
        let adopt_ready = dc_ready.clone();
        let adopt_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = adopt_slot.clone();
            let ready = adopt_ready.clone();
            let events = adopt_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "tandem::webrtc", label = dc.label(), "remote data channel announced");
                attach_channel(&dc, &events, &ready);
                *slot.lock() = Some(dc);
            })
        }));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_sender(
            peer.clone(),
            channel.clone(),
            dc_ready.clone(),
            outbound_rx,
        ));

        Self {
            peer,
            pc,
            channel,
            dc_ready,
            outbound_tx,
            events,
        }
    }
}

/// Writes queued frames once the data channel has opened.
async fn run_sender(
    peer: String,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    dc_ready: Arc<Notify>,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut opened = false;
    while let Some(frame) = outbound_rx.recv().await {
        if !opened {
            dc_ready.notified().await;
            opened = true;
            tracing::trace!(target = "tandem::webrtc", peer = %peer, "data channel ready; draining queue");
        }
        let dc = channel.lock().clone();
        let Some(dc) = dc else {
            tracing::warn!(target = "tandem::webrtc", peer = %peer, "data channel vanished; dropping frame");
            continue;
        };
        if let Err(err) = dc.send(&frame).await {
            tracing::warn!(
                target = "tandem::webrtc",
                peer = %peer,
                frame_len = frame.len(),
                error = %err,
                "data channel send failed"
            );
        }
    }
    tracing::trace!(target = "tandem::webrtc", peer = %peer, "sender loop end");
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: &TransportEvents, ready: &Arc<Notify>) {
    let open_events = events.clone();
    let open_ready = ready.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        let ready = open_ready.clone();
        Box::pin(async move {
            tracing::debug!(target = "tandem::webrtc", "data channel opened");
            ready.notify_waiters();
            ready.notify_one();
            let _ = events.send(TransportEvent::DataChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            tracing::trace!(target = "tandem::webrtc", frame_len = msg.data.len(), "received frame");
            let _ = events.send(TransportEvent::Message(msg.data));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "tandem::webrtc", "data channel closed");
            let _ = events.send(TransportEvent::DataChannelClosed);
        })
    }));
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(dc_init))
            .await
            .map_err(to_setup_error)?;
        attach_channel(&dc, &self.events, &self.dc_ready);
        *self.channel.lock() = Some(dc);
        tracing::debug!(target = "tandem::webrtc", peer = %self.peer, label, "data channel created");
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.channel.lock().is_none() {
            return Err(TransportError::NotReady);
        }
        self.outbound_tx
            .send(payload)
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Take the channel first so in-flight callbacks see a closed slot.
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "tandem::webrtc", peer = %self.peer, error = %err, "data channel close failed");
            }
        }
        self.pc.close().await.map_err(to_setup_error)
    }

    fn is_connected(&self) -> bool {
        self.pc.connection_state() == RTCPeerConnectionState::Connected
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(to_negotiation_error)
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate::new(
        init.candidate,
        init.sdp_mid.unwrap_or_default(),
        init.sdp_mline_index.unwrap_or(0),
    )
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Checking,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_connection_states_map_onto_transport_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Connecting), TransportState::Checking);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), TransportState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), TransportState::New);
    }

    #[test]
    fn candidate_init_defaults_missing_media_fields() {
        let candidate = from_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        });
        assert_eq!(candidate.sdp_mid, "");
        assert_eq!(candidate.sdp_mline_index, 0);
    }

    #[test]
    fn configuration_carries_exactly_one_stun_server() {
        let factory = match WebRtcTransportFactory::new("stun:stun.example.org:3478") {
            Ok(factory) => factory,
            Err(err) => {
                tracing::trace!(target = "tandem::webrtc", error = %err, "skipping configuration test");
                return;
            }
        };
        let config = factory.rtc_configuration();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
    }

    #[tokio::test]
    async fn transport_reports_not_ready_before_channel_exists() {
        let factory = match WebRtcTransportFactory::new(crate::config::DEFAULT_STUN_SERVER) {
            Ok(factory) => factory,
            Err(_) => return,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create("bob", tx).await.unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"x")).await,
            Err(TransportError::NotReady)
        ));
        assert!(!transport.is_connected());
        transport.close().await.unwrap();
    }
}
