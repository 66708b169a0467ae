//! WebRTC-backed peer transport. Peer connection callbacks are bridged onto
//! the transport event channel so the coordinator never touches the webrtc
//! crate's handler types directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use signal_store::{IceCandidateRecord, SdpKind, SignalDescriptor};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    IceConfig, IceServer, PeerConnectionState, PeerTransport, PeerTransportFactory,
    TransportError, TransportEvent, TransportEvents,
};

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(4);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(12);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

pub struct RtcTransportFactory;

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice: &IceConfig,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (transport, events) = RtcPeerTransport::new(ice).await?;
        Ok((transport, events))
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RtcPeerTransport {
    pub async fn new(
        ice: &IceConfig,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice.servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(json) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(IceCandidateRecord {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                                username_fragment: json.username_fragment,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "link",
                                error = %err,
                                "failed to serialize local ice candidate"
                            );
                        }
                    },
                    None => {
                        let _ = tx.send(TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Connection(map_connection_state(state)));
            })
        }));

        let dc_slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        // Inbound channel announced by the remote peer.
        let slot = Arc::clone(&dc_slot);
        let inbound_tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let events = inbound_tx.clone();
            Box::pin(async move {
                attach_data_channel(&channel, &events);
                slot.lock().await.replace(channel);
            })
        }));

        let transport = Arc::new(Self {
            pc,
            dc: dc_slot,
            events: events_tx,
        });
        Ok((transport, events_rx))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SignalDescriptor, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Sdp(err.to_string()))?;
        Ok(SignalDescriptor::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SignalDescriptor, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Sdp(err.to_string()))?;
        Ok(SignalDescriptor::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError> {
        let description = rtc_description(desc)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| TransportError::Sdp(err.to_string()))
    }

    async fn set_remote_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError> {
        let description = rtc_description(desc)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::Sdp(err.to_string()))
    }

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidateRecord,
    ) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        attach_data_channel(&channel, &self.events);
        self.dc.lock().await.replace(channel);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> bool {
        let channel = { self.dc.lock().await.clone() };
        let Some(channel) = channel else {
            return false;
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return false;
        }
        match channel.send_text(text.to_string()).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(target: "link", error = %err, "data channel send failed");
                false
            }
        }
    }

    async fn close(&self) {
        if let Some(channel) = self.dc.lock().await.take() {
            if let Err(err) = channel.close().await {
                tracing::debug!(target: "link", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "link", error = %err, "peer connection close failed");
        }
    }
}

fn attach_data_channel(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<TransportEvent>) {
    let open_tx = events.clone();
    channel.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelOpen);
        })
    }));

    let close_tx = events.clone();
    channel.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelClosed);
        })
    }));

    let message_tx = events.clone();
    channel.on_message(Box::new(move |message| {
        let tx = message_tx.clone();
        Box::pin(async move {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(TransportEvent::Message(text));
                }
                Err(err) => {
                    tracing::debug!(
                        target: "link",
                        error = %err,
                        "discarding non-utf8 data channel frame"
                    );
                }
            }
        })
    }));
}

fn rtc_description(desc: &SignalDescriptor) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    result.map_err(|err| TransportError::Sdp(err.to_string()))
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(to_setup_error)?;
    let mut setting_engine = SettingEngine::default();
    setting_engine.set_ice_timeouts(
        Some(ICE_DISCONNECTED_TIMEOUT),
        Some(ICE_FAILED_TIMEOUT),
        Some(ICE_KEEPALIVE_INTERVAL),
    );
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn to_setup_error(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}
