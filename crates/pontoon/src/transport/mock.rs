//! In-process transport pair. Two endpoints share one state table; the link
//! becomes "connected" as soon as both sides hold a local and a remote
//! description, and text frames are delivered straight to the peer's event
//! channel. Local candidates are scripted per endpoint so gathering-timeout
//! behavior can be exercised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use signal_store::{IceCandidateRecord, SignalDescriptor};
use tokio::sync::mpsc;

use super::{
    IceConfig, PeerConnectionState, PeerTransport, PeerTransportFactory, TransportError,
    TransportEvent, TransportEvents,
};

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Candidates emitted right after the local description is set.
    pub local_candidates: Vec<IceCandidateRecord>,
    /// Whether a gathering-complete event follows the scripted candidates.
    pub signal_gathering_complete: bool,
    /// Candidates emitted on a timer after the local description is set, for
    /// exercising stragglers that show up once signaling is already underway.
    pub delayed_candidates: Vec<(Duration, IceCandidateRecord)>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            local_candidates: vec![
                host_candidate("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host"),
                host_candidate("candidate:2 1 udp 2122194687 192.168.1.2 50001 typ host"),
            ],
            signal_gathering_complete: true,
            delayed_candidates: Vec::new(),
        }
    }
}

fn host_candidate(candidate: &str) -> IceCandidateRecord {
    IceCandidateRecord {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[derive(Default)]
struct SideState {
    local: Option<SignalDescriptor>,
    remote: Option<SignalDescriptor>,
    open: bool,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    remote_candidates: Vec<IceCandidateRecord>,
    set_remote_calls: usize,
    channel_request: Option<(String, bool)>,
}

impl SideState {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

struct MockNet {
    sides: Mutex<[SideState; 2]>,
}

pub struct MockEndpoint {
    net: Arc<MockNet>,
    index: usize,
    behavior: MockBehavior,
}

impl MockEndpoint {
    fn peer(&self) -> usize {
        1 - self.index
    }

    /// How many times a remote description was applied to this endpoint.
    pub fn set_remote_calls(&self) -> usize {
        self.net.sides.lock()[self.index].set_remote_calls
    }

    /// Remote candidates this endpoint accepted, in arrival order.
    pub fn remote_candidates(&self) -> Vec<IceCandidateRecord> {
        self.net.sides.lock()[self.index].remote_candidates.clone()
    }

    pub fn is_open(&self) -> bool {
        self.net.sides.lock()[self.index].open
    }

    /// Label and ordered flag of the requested data channel, if any.
    pub fn channel_request(&self) -> Option<(String, bool)> {
        self.net.sides.lock()[self.index].channel_request.clone()
    }

    fn try_open(sides: &mut [SideState; 2]) {
        if sides[0].open {
            return;
        }
        let ready = sides
            .iter()
            .all(|side| side.local.is_some() && side.remote.is_some());
        if !ready {
            return;
        }
        for side in sides.iter_mut() {
            side.open = true;
            side.emit(TransportEvent::Connection(PeerConnectionState::Connected));
            side.emit(TransportEvent::DataChannelOpen);
        }
    }
}

#[async_trait]
impl PeerTransport for MockEndpoint {
    async fn create_offer(&self) -> Result<SignalDescriptor, TransportError> {
        Ok(SignalDescriptor::offer(format!(
            "v=0 mock offer from endpoint {}",
            self.index
        )))
    }

    async fn create_answer(&self) -> Result<SignalDescriptor, TransportError> {
        let sides = self.net.sides.lock();
        if sides[self.index].remote.is_none() {
            return Err(TransportError::Sdp(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        Ok(SignalDescriptor::answer(format!(
            "v=0 mock answer from endpoint {}",
            self.index
        )))
    }

    async fn set_local_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError> {
        let mut sides = self.net.sides.lock();
        sides[self.index].local = Some(desc.clone());
        for candidate in &self.behavior.local_candidates {
            sides[self.index].emit(TransportEvent::LocalCandidate(candidate.clone()));
        }
        if self.behavior.signal_gathering_complete {
            sides[self.index].emit(TransportEvent::GatheringComplete);
        }
        if let Some(tx) = &sides[self.index].events {
            for (delay, candidate) in &self.behavior.delayed_candidates {
                let tx = tx.clone();
                let delay = *delay;
                let candidate = candidate.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TransportEvent::LocalCandidate(candidate));
                });
            }
        }
        MockEndpoint::try_open(&mut sides);
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SignalDescriptor) -> Result<(), TransportError> {
        let mut sides = self.net.sides.lock();
        sides[self.index].set_remote_calls += 1;
        sides[self.index].remote = Some(desc.clone());
        MockEndpoint::try_open(&mut sides);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: &IceCandidateRecord,
    ) -> Result<(), TransportError> {
        let mut sides = self.net.sides.lock();
        if sides[self.index].remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        sides[self.index].remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), TransportError> {
        self.net.sides.lock()[self.index].channel_request = Some((label.to_string(), ordered));
        Ok(())
    }

    async fn send_text(&self, text: &str) -> bool {
        let sides = self.net.sides.lock();
        if !sides[self.index].open || !sides[self.peer()].open {
            return false;
        }
        sides[self.peer()].emit(TransportEvent::Message(text.to_string()));
        true
    }

    async fn close(&self) {
        let mut sides = self.net.sides.lock();
        if sides[self.index].open {
            sides[self.index].open = false;
            let peer = self.peer();
            sides[peer].emit(TransportEvent::DataChannelClosed);
            sides[peer].emit(TransportEvent::Connection(
                PeerConnectionState::Disconnected,
            ));
        }
        sides[self.index].emit(TransportEvent::Connection(PeerConnectionState::Closed));
    }
}

pub struct MockTransportFactory {
    endpoint: Arc<MockEndpoint>,
}

impl MockTransportFactory {
    /// Two linked factories with default behavior, one per role.
    pub fn pair() -> (Self, Self) {
        Self::pair_with(MockBehavior::default(), MockBehavior::default())
    }

    pub fn pair_with(first: MockBehavior, second: MockBehavior) -> (Self, Self) {
        let net = Arc::new(MockNet {
            sides: Mutex::new([SideState::default(), SideState::default()]),
        });
        let a = Self {
            endpoint: Arc::new(MockEndpoint {
                net: Arc::clone(&net),
                index: 0,
                behavior: first,
            }),
        };
        let b = Self {
            endpoint: Arc::new(MockEndpoint {
                net,
                index: 1,
                behavior: second,
            }),
        };
        (a, b)
    }

    pub fn endpoint(&self) -> Arc<MockEndpoint> {
        Arc::clone(&self.endpoint)
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.net_register(tx);
        Ok((Arc::clone(&self.endpoint) as Arc<dyn PeerTransport>, rx))
    }
}

impl MockTransportFactory {
    fn net_register(&self, tx: mpsc::UnboundedSender<TransportEvent>) {
        let mut sides = self.endpoint.net.sides.lock();
        sides[self.endpoint.index].events = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_opens_once_both_descriptions_land() {
        let (a, b) = MockTransportFactory::pair();
        let ice = IceConfig::default();
        let (left, mut left_events) = a.create(&ice).await.expect("left transport");
        let (right, mut right_events) = b.create(&ice).await.expect("right transport");

        assert!(!left.send_text("too early").await);

        let offer = left.create_offer().await.expect("offer");
        left.set_local_description(&offer).await.expect("local offer");
        right
            .set_remote_description(&offer)
            .await
            .expect("remote offer");
        let answer = right.create_answer().await.expect("answer");
        right
            .set_local_description(&answer)
            .await
            .expect("local answer");
        left.set_remote_description(&answer)
            .await
            .expect("remote answer");

        assert!(a.endpoint().is_open());
        assert!(left.send_text("hello").await);

        let mut saw_message = false;
        while let Ok(event) = right_events.try_recv() {
            if let TransportEvent::Message(text) = event {
                assert_eq!(text, "hello");
                saw_message = true;
            }
        }
        assert!(saw_message);

        // Both sides observed the scripted gathering sequence.
        let mut saw_complete = false;
        while let Ok(event) = left_events.try_recv() {
            if matches!(event, TransportEvent::GatheringComplete) {
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[tokio::test]
    async fn candidates_rejected_before_remote_description() {
        let (a, _b) = MockTransportFactory::pair();
        let (left, _events) = a.create(&IceConfig::default()).await.expect("transport");
        let candidate = host_candidate("candidate:9 1 udp 1 10.0.0.9 9 typ host");
        let err = left.add_ice_candidate(&candidate).await.expect_err("reject");
        assert!(matches!(err, TransportError::Candidate(_)));
    }
}
