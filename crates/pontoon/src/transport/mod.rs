//! The peer transport seam. The link coordinator drives negotiation through
//! these traits; production uses the WebRTC implementation, tests wire two
//! mock endpoints directly together.

use std::sync::Arc;

use async_trait::async_trait;
use signal_store::{IceCandidateRecord, SignalDescriptor};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod webrtc;

pub use mock::{MockBehavior, MockEndpoint, MockTransportFactory};
pub use webrtc::{RtcPeerTransport, RtcTransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a transport reports back, bridged onto one channel so the
/// coordinator has a single place to react.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidateRecord),
    GatheringComplete,
    Connection(PeerConnectionState),
    DataChannelOpen,
    DataChannelClosed,
    Message(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description exchange failed: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
}

#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
        }
    }
}

/// One peer endpoint. Descriptions and candidates flow in through these
/// methods; everything the endpoint produces flows out on the event channel
/// handed over at creation.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SignalDescriptor, TransportError>;
    async fn create_answer(&self) -> Result<SignalDescriptor, TransportError>;
    async fn set_local_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidateRecord)
    -> Result<(), TransportError>;
    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError>;
    /// Queues one text frame. `false` when the channel is not open; delivery
    /// problems are not errors at this seam.
    async fn send_text(&self, text: &str) -> bool;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}
