//! Drives one peer link from signaling to an open data channel. The offerer
//! publishes its description plus whatever candidates gathered within the
//! bounded wait, then trickles stragglers; the answerer fetches, answers and
//! does the same. Remote candidates arriving before the remote description
//! are buffered and flushed afterwards.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use signal_store::{
    IceCandidateRecord, SdpKind, SessionMetadata, SignalStore, SignalStoreError,
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::protocol::Envelope;
use crate::transport::{
    IceConfig, PeerConnectionState, PeerTransport, PeerTransportFactory, TransportEvent,
    TransportEvents,
};

pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "pontoon-proof";
pub const DEFAULT_ICE_GATHERING_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

impl LinkRole {
    fn local_side(self) -> SdpKind {
        match self {
            LinkRole::Offerer => SdpKind::Offer,
            LinkRole::Answerer => SdpKind::Answer,
        }
    }

    fn remote_side(self) -> SdpKind {
        self.local_side().other()
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkRole::Offerer => write!(f, "offerer"),
            LinkRole::Answerer => write!(f, "answerer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Init,
    Offer,
    Answer,
    DataChannel,
}

impl fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationPhase::Init => "init",
            NegotiationPhase::Offer => "offer",
            NegotiationPhase::Answer => "answer",
            NegotiationPhase::DataChannel => "data-channel",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NegotiationError {
    #[error("{role} negotiation failed during {phase}: {message}")]
    Phase {
        role: LinkRole,
        phase: NegotiationPhase,
        message: String,
    },
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalStoreError),
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub data_channel_label: String,
    pub ordered: bool,
    pub ice: IceConfig,
    pub ice_gathering_timeout: Duration,
    /// Extra fields published with the offer, opaque to the link layer.
    pub offer_metadata: Option<SessionMetadata>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            ordered: true,
            ice: IceConfig::default(),
            ice_gathering_timeout: DEFAULT_ICE_GATHERING_TIMEOUT,
            offer_metadata: None,
        }
    }
}

#[derive(Default)]
struct GatherBuf {
    collecting: bool,
    candidates: Vec<IceCandidateRecord>,
}

pub struct LinkCoordinator {
    session_id: String,
    role: LinkRole,
    config: LinkConfig,
    store: Arc<dyn SignalStore>,
    factory: Arc<dyn PeerTransportFactory>,
    transport: AsyncMutex<Option<Arc<dyn PeerTransport>>>,
    state_tx: watch::Sender<ConnectionState>,
    error_tx: watch::Sender<Option<NegotiationError>>,
    messages_tx: mpsc::UnboundedSender<String>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
    /// Set before the answer is applied so concurrent notifications cannot
    /// race into a second apply; cleared only when applying fails.
    answer_applied: AtomicBool,
    remote_described: AtomicBool,
    pending_remote: Mutex<Vec<IceCandidateRecord>>,
    gather: Mutex<GatherBuf>,
    gather_done: AtomicBool,
    gather_notify: Notify,
}

impl LinkCoordinator {
    pub fn new(
        role: LinkRole,
        session_id: impl Into<String>,
        config: LinkConfig,
        store: Arc<dyn SignalStore>,
        factory: Arc<dyn PeerTransportFactory>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (error_tx, _) = watch::channel(None);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            session_id: session_id.into(),
            role,
            config,
            store,
            factory,
            transport: AsyncMutex::new(None),
            state_tx,
            error_tx,
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            tasks: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            answer_applied: AtomicBool::new(false),
            remote_described: AtomicBool::new(false),
            pending_remote: Mutex::new(Vec::new()),
            gather: Mutex::new(GatherBuf {
                collecting: true,
                candidates: Vec::new(),
            }),
            gather_done: AtomicBool::new(false),
            gather_notify: Notify::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn last_error(&self) -> watch::Receiver<Option<NegotiationError>> {
        self.error_tx.subscribe()
    }

    /// Inbound text frames. Takeable once.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.messages_rx.lock().take()
    }

    /// Runs the signaling exchange for this coordinator's role. Returns once
    /// the local side of negotiation is published and watchers are in place;
    /// the connection itself comes up asynchronously and is reported through
    /// [`LinkCoordinator::state`].
    pub async fn negotiate(self: &Arc<Self>) -> Result<(), NegotiationError> {
        self.set_state(ConnectionState::Initializing);
        let result = match self.role {
            LinkRole::Offerer => self.negotiate_offerer().await,
            LinkRole::Answerer => self.negotiate_answerer().await,
        };
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    async fn negotiate_offerer(self: &Arc<Self>) -> Result<(), NegotiationError> {
        self.store.initialize().await?;
        let (transport, events) = self
            .factory
            .create(&self.config.ice)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Init, err))?;
        self.transport.lock().await.replace(Arc::clone(&transport));
        self.spawn_event_pump(events);

        transport
            .create_data_channel(&self.config.data_channel_label, self.config.ordered)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::DataChannel, err))?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Offer, err))?;
        transport
            .set_local_description(&offer)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Offer, err))?;

        self.set_state(ConnectionState::Connecting);
        let gathered = self.wait_for_gathering().await;
        let bundled = gathered.len();
        self.store
            .publish_offer(
                &self.session_id,
                offer,
                gathered,
                self.config.offer_metadata.clone(),
            )
            .await?;
        self.finish_gathering(bundled).await;
        tracing::debug!(
            target: "link",
            session = %self.session_id,
            "offer published; waiting for an answer"
        );

        let mut answers = self.store.subscribe_answer(&self.session_id).await?;
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(notice) = answers.recv().await {
                let Some(answer) = notice else { continue };
                if !this.active.load(Ordering::SeqCst) {
                    break;
                }
                if this.answer_applied.swap(true, Ordering::SeqCst) {
                    tracing::debug!(
                        target: "link",
                        session = %this.session_id,
                        "ignoring answer notification after one was applied"
                    );
                    continue;
                }
                if let Err(err) = this.apply_answer(answer).await {
                    this.answer_applied.store(false, Ordering::SeqCst);
                    tracing::warn!(
                        target: "link",
                        session = %this.session_id,
                        error = %err,
                        "failed to apply remote answer"
                    );
                    this.fail(err);
                }
            }
        }));

        self.spawn_candidate_forwarder().await?;
        Ok(())
    }

    async fn negotiate_answerer(self: &Arc<Self>) -> Result<(), NegotiationError> {
        self.store.initialize().await?;
        let offer_record = self.store.fetch_offer(&self.session_id).await?;

        let (transport, events) = self
            .factory
            .create(&self.config.ice)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Init, err))?;
        self.transport.lock().await.replace(Arc::clone(&transport));
        self.spawn_event_pump(events);

        transport
            .set_remote_description(&offer_record.offer)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Answer, err))?;
        self.remote_described.store(true, Ordering::SeqCst);
        for candidate in offer_record.candidates {
            self.add_remote_candidate(&transport, candidate).await;
        }

        let answer = transport
            .create_answer()
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Answer, err))?;
        transport
            .set_local_description(&answer)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Answer, err))?;

        self.set_state(ConnectionState::Connecting);
        let gathered = self.wait_for_gathering().await;
        let bundled = gathered.len();
        self.store
            .publish_answer(&self.session_id, answer, gathered)
            .await?;
        self.finish_gathering(bundled).await;
        tracing::debug!(
            target: "link",
            session = %self.session_id,
            "answer published"
        );

        self.spawn_candidate_forwarder().await?;
        Ok(())
    }

    /// Watches the store for candidates from the remote side and feeds them
    /// into the transport, buffering while the remote description is absent.
    async fn spawn_candidate_forwarder(self: &Arc<Self>) -> Result<(), NegotiationError> {
        let mut candidates = self
            .store
            .subscribe_candidates(&self.session_id, self.role.remote_side())
            .await?;
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if !this.active.load(Ordering::SeqCst) {
                    break;
                }
                this.deliver_remote_candidate(candidate).await;
            }
        }));
        Ok(())
    }

    /// Buffers or applies one remote candidate. The buffer-or-apply decision
    /// is made under the pending lock: the flag flips before the flush takes
    /// that lock, so a candidate pushed here is either drained by the flush or
    /// applied directly, never stranded.
    async fn deliver_remote_candidate(&self, candidate: IceCandidateRecord) {
        let direct = {
            let mut pending = self.pending_remote.lock();
            if self.remote_described.load(Ordering::SeqCst) {
                Some(candidate)
            } else {
                pending.push(candidate);
                None
            }
        };
        let Some(candidate) = direct else {
            return;
        };
        let transport = { self.transport.lock().await.clone() };
        if let Some(transport) = transport {
            self.add_remote_candidate(&transport, candidate).await;
        }
    }

    async fn apply_answer(&self, answer: signal_store::AnswerRecord) -> Result<(), NegotiationError> {
        let transport = self.transport_handle().await?;
        transport
            .set_remote_description(&answer.answer)
            .await
            .map_err(|err| self.phase_error(NegotiationPhase::Answer, err))?;
        self.remote_described.store(true, Ordering::SeqCst);
        for candidate in answer.candidates {
            self.add_remote_candidate(&transport, candidate).await;
        }
        self.flush_pending(&transport).await;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        transport: &Arc<dyn PeerTransport>,
        candidate: IceCandidateRecord,
    ) {
        if let Err(err) = transport.add_ice_candidate(&candidate).await {
            tracing::warn!(
                target: "link",
                session = %self.session_id,
                error = %err,
                "skipping remote candidate the transport rejected"
            );
        }
    }

    async fn flush_pending(&self, transport: &Arc<dyn PeerTransport>) {
        let pending: Vec<IceCandidateRecord> =
            { self.pending_remote.lock().drain(..).collect() };
        for candidate in pending {
            self.add_remote_candidate(transport, candidate).await;
        }
    }

    /// Collects locally gathered candidates until the transport reports the
    /// end of gathering or the configured wait elapses, whichever is first.
    /// Returns a snapshot for the bundled publish; collection stays on until
    /// [`LinkCoordinator::finish_gathering`] so candidates arriving while the
    /// publish is in flight are trickled afterwards instead of being wiped by
    /// the descriptor upsert.
    async fn wait_for_gathering(&self) -> Vec<IceCandidateRecord> {
        let wait = timeout(self.config.ice_gathering_timeout, async {
            loop {
                let notified = self.gather_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.gather_done.load(Ordering::SeqCst) {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if wait.is_err() {
            tracing::debug!(
                target: "link",
                session = %self.session_id,
                timeout_ms = self.config.ice_gathering_timeout.as_millis() as u64,
                "ice gathering still running; publishing the partial candidate set"
            );
        }
        self.gather.lock().candidates.clone()
    }

    /// Ends candidate collection once the local description is published and
    /// trickles whatever gathered beyond the first `published` records.
    async fn finish_gathering(&self, published: usize) {
        let stragglers: Vec<IceCandidateRecord> = {
            let mut gather = self.gather.lock();
            gather.collecting = false;
            let buffered = std::mem::take(&mut gather.candidates);
            buffered.into_iter().skip(published).collect()
        };
        for candidate in stragglers {
            self.trickle_local(candidate).await;
        }
    }

    async fn trickle_local(&self, candidate: IceCandidateRecord) {
        if let Err(err) = self
            .store
            .publish_candidate(&self.session_id, self.role.local_side(), candidate)
            .await
        {
            tracing::warn!(
                target: "link",
                session = %self.session_id,
                error = %err,
                "failed to trickle local candidate"
            );
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: TransportEvents) {
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !this.active.load(Ordering::SeqCst) {
                    break;
                }
                this.handle_transport_event(event).await;
            }
        }));
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let direct = {
                    let mut gather = self.gather.lock();
                    if gather.collecting {
                        gather.candidates.push(candidate);
                        None
                    } else {
                        Some(candidate)
                    }
                };
                if let Some(candidate) = direct {
                    self.trickle_local(candidate).await;
                }
            }
            TransportEvent::GatheringComplete => {
                self.gather_done.store(true, Ordering::SeqCst);
                self.gather_notify.notify_waiters();
            }
            TransportEvent::Connection(state) => {
                match state {
                    PeerConnectionState::Connected => self.set_state(ConnectionState::Connected),
                    PeerConnectionState::Disconnected => {
                        self.set_state(ConnectionState::Disconnected)
                    }
                    PeerConnectionState::Failed => self.set_state(ConnectionState::Failed),
                    PeerConnectionState::New
                    | PeerConnectionState::Connecting
                    | PeerConnectionState::Closed => {}
                }
            }
            TransportEvent::DataChannelOpen => {
                tracing::debug!(
                    target: "link",
                    session = %self.session_id,
                    role = %self.role,
                    "data channel open"
                );
                self.set_state(ConnectionState::Connected);
            }
            TransportEvent::DataChannelClosed => {
                if *self.state_tx.borrow() == ConnectionState::Connected {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TransportEvent::Message(text) => {
                let _ = self.messages_tx.send(text);
            }
        }
    }

    /// Serializes and queues one envelope. `false` when the channel is not
    /// open; the caller decides whether that is worth retrying.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        let transport = { self.transport.lock().await.clone() };
        let Some(transport) = transport else {
            return false;
        };
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    target: "link",
                    session = %self.session_id,
                    error = %err,
                    "failed to serialize outbound envelope"
                );
                return false;
            }
        };
        transport.send_text(&text).await
    }

    /// Tears the link down. Every step runs even if an earlier one fails;
    /// calling again is a no-op.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let transport = { self.transport.lock().await.take() };
        if let Some(transport) = transport {
            transport.close().await;
        }
        if let Err(err) = self.store.cleanup_session(&self.session_id).await {
            tracing::warn!(
                target: "link",
                session = %self.session_id,
                error = %err,
                "session cleanup failed"
            );
        }
        let _ = self.state_tx.send_replace(ConnectionState::Closed);
        tracing::debug!(target: "link", session = %self.session_id, "link closed");
    }

    async fn transport_handle(&self) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        self.transport
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.phase_error(NegotiationPhase::Init, "transport not created"))
    }

    fn phase_error(&self, phase: NegotiationPhase, message: impl ToString) -> NegotiationError {
        NegotiationError::Phase {
            role: self.role,
            phase,
            message: message.to_string(),
        }
    }

    fn fail(&self, err: NegotiationError) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.error_tx.send_replace(Some(err));
        self.set_state(ConnectionState::Failed);
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            match *current {
                ConnectionState::Closed => false,
                ConnectionState::Failed if next != ConnectionState::Closed => false,
                _ => {
                    *current = next;
                    true
                }
            }
        });
        if changed {
            tracing::debug!(
                target: "link",
                session = %self.session_id,
                role = %self.role,
                state = %next,
                "connection state changed"
            );
        }
    }
}

impl Drop for LinkCoordinator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use signal_store::{MemorySignalStore, SignalDescriptor};
    use tokio::time::sleep;

    use crate::transport::{MockBehavior, MockTransportFactory};

    fn quick_config() -> LinkConfig {
        LinkConfig {
            ice_gathering_timeout: Duration::from_millis(500),
            ..LinkConfig::default()
        }
    }

    fn record(candidate: &str) -> IceCandidateRecord {
        IceCandidateRecord {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Memory store that holds descriptor upserts long enough for candidates
    /// gathered mid-publish to arrive.
    struct SlowPublishStore {
        inner: Arc<MemorySignalStore>,
        publish_delay: Duration,
    }

    #[async_trait::async_trait]
    impl SignalStore for SlowPublishStore {
        async fn initialize(&self) -> Result<(), SignalStoreError> {
            self.inner.initialize().await
        }

        async fn publish_offer(
            &self,
            session_id: &str,
            offer: SignalDescriptor,
            candidates: Vec<IceCandidateRecord>,
            metadata: Option<SessionMetadata>,
        ) -> Result<(), SignalStoreError> {
            sleep(self.publish_delay).await;
            self.inner
                .publish_offer(session_id, offer, candidates, metadata)
                .await
        }

        async fn fetch_offer(
            &self,
            session_id: &str,
        ) -> Result<signal_store::OfferRecord, SignalStoreError> {
            self.inner.fetch_offer(session_id).await
        }

        async fn publish_answer(
            &self,
            session_id: &str,
            answer: SignalDescriptor,
            candidates: Vec<IceCandidateRecord>,
        ) -> Result<(), SignalStoreError> {
            sleep(self.publish_delay).await;
            self.inner
                .publish_answer(session_id, answer, candidates)
                .await
        }

        async fn fetch_answer(
            &self,
            session_id: &str,
        ) -> Result<Option<signal_store::AnswerRecord>, SignalStoreError> {
            self.inner.fetch_answer(session_id).await
        }

        async fn publish_candidate(
            &self,
            session_id: &str,
            side: SdpKind,
            candidate: IceCandidateRecord,
        ) -> Result<(), SignalStoreError> {
            self.inner.publish_candidate(session_id, side, candidate).await
        }

        async fn subscribe_answer(
            &self,
            session_id: &str,
        ) -> Result<signal_store::AnswerSubscription, SignalStoreError> {
            self.inner.subscribe_answer(session_id).await
        }

        async fn subscribe_candidates(
            &self,
            session_id: &str,
            side: SdpKind,
        ) -> Result<signal_store::CandidateSubscription, SignalStoreError> {
            self.inner.subscribe_candidates(session_id, side).await
        }

        async fn session_exists(&self, session_id: &str) -> Result<bool, SignalStoreError> {
            self.inner.session_exists(session_id).await
        }

        async fn cleanup_session(&self, session_id: &str) -> Result<(), SignalStoreError> {
            self.inner.cleanup_session(session_id).await
        }

        async fn close(&self) -> Result<(), SignalStoreError> {
            self.inner.close().await
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<ConnectionState>,
        want: ConnectionState,
    ) {
        timeout(Duration::from_secs(2), async {
            loop {
                if *rx.borrow() == want {
                    return;
                }
                rx.changed().await.expect("state channel open");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}"));
    }

    #[tokio::test]
    async fn offer_answer_exchange_opens_the_channel() {
        let store = MemorySignalStore::new();
        let (factory_a, factory_b) = MockTransportFactory::pair();
        let endpoint_a = factory_a.endpoint();
        let endpoint_b = factory_b.endpoint();

        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        let answerer = LinkCoordinator::new(
            LinkRole::Answerer,
            "s1",
            quick_config(),
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_b),
        );
        let mut answerer_inbox = answerer.messages().expect("answerer inbox");
        let mut offerer_inbox = offerer.messages().expect("offerer inbox");

        offerer.negotiate().await.expect("offerer negotiation");
        answerer.negotiate().await.expect("answerer negotiation");

        let mut offerer_state = offerer.state();
        let mut answerer_state = answerer.state();
        wait_for_state(&mut offerer_state, ConnectionState::Connected).await;
        wait_for_state(&mut answerer_state, ConnectionState::Connected).await;

        // The answerer received the offerer's bundled candidates.
        assert_eq!(endpoint_b.remote_candidates().len(), 2);

        // The offerer asked its transport for the configured channel.
        assert_eq!(
            endpoint_a.channel_request(),
            Some((DEFAULT_DATA_CHANNEL_LABEL.to_string(), true))
        );

        let ping = Envelope::new("ping", json!({"n": 1}));
        assert!(offerer.send(&ping).await);
        let frame = timeout(Duration::from_secs(1), answerer_inbox.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        let received: Envelope = serde_json::from_str(&frame).expect("parse frame");
        assert_eq!(received.kind, "ping");

        let pong = Envelope::new("pong", json!({"n": 2}));
        assert!(answerer.send(&pong).await);
        let frame = timeout(Duration::from_secs(1), offerer_inbox.recv())
            .await
            .expect("frame in time")
            .expect("channel open");
        let received: Envelope = serde_json::from_str(&frame).expect("parse frame");
        assert_eq!(received.kind, "pong");

        offerer.close().await;
        answerer.close().await;
    }

    #[tokio::test]
    async fn second_answer_is_never_applied() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let endpoint_a = factory_a.endpoint();

        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        offerer.negotiate().await.expect("offerer negotiation");

        store
            .publish_answer("s1", SignalDescriptor::answer("v=0 first"), Vec::new())
            .await
            .expect("first answer");
        sleep(Duration::from_millis(50)).await;
        store
            .publish_answer("s1", SignalDescriptor::answer("v=0 second"), Vec::new())
            .await
            .expect("second answer");
        sleep(Duration::from_millis(50)).await;

        assert_eq!(endpoint_a.set_remote_calls(), 1);
        offerer.close().await;
    }

    #[tokio::test]
    async fn gathering_timeout_publishes_partial_candidate_set() {
        let store = MemorySignalStore::new();
        let stalled = MockBehavior {
            local_candidates: vec![record("candidate:only 1 udp 1 10.0.0.1 9 typ host")],
            signal_gathering_complete: false,
            ..MockBehavior::default()
        };
        let (factory_a, _factory_b) =
            MockTransportFactory::pair_with(stalled, MockBehavior::default());

        let config = LinkConfig {
            ice_gathering_timeout: Duration::from_millis(100),
            ..LinkConfig::default()
        };
        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            config,
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        offerer.negotiate().await.expect("offerer negotiation");

        let offer = store.fetch_offer("s1").await.expect("offer stored");
        assert_eq!(offer.candidates.len(), 1);
        offerer.close().await;
    }

    #[tokio::test]
    async fn candidates_gathered_during_offer_publish_are_not_lost() {
        let inner = MemorySignalStore::new();
        let store = Arc::new(SlowPublishStore {
            inner: inner.clone(),
            publish_delay: Duration::from_millis(150),
        });
        // One candidate lands immediately, another while the offer upsert is
        // still in flight. The late one must survive the upsert.
        let behavior = MockBehavior {
            local_candidates: vec![record("candidate:prompt 1 udp 1 10.0.0.1 9 typ host")],
            signal_gathering_complete: true,
            delayed_candidates: vec![(
                Duration::from_millis(50),
                record("candidate:straggler 1 udp 1 10.0.0.2 9 typ host"),
            )],
        };
        let (factory_a, _factory_b) =
            MockTransportFactory::pair_with(behavior, MockBehavior::default());

        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        offerer.negotiate().await.expect("offerer negotiation");

        let offer = inner.fetch_offer("s1").await.expect("offer stored");
        let names: Vec<&str> = offer
            .candidates
            .iter()
            .map(|c| c.candidate.as_str())
            .collect();
        assert!(names.iter().any(|c| c.contains("candidate:prompt")));
        assert!(
            names.iter().any(|c| c.contains("candidate:straggler")),
            "candidate gathered during the publish was lost: {names:?}"
        );
        offerer.close().await;
    }

    #[tokio::test]
    async fn answerer_fails_fast_without_an_offer() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let answerer = LinkCoordinator::new(
            LinkRole::Answerer,
            "nobody-published",
            quick_config(),
            store as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );

        let err = answerer.negotiate().await.expect_err("must fail");
        assert_eq!(err, NegotiationError::Signaling(SignalStoreError::NotFound));
        assert_eq!(*answerer.state().borrow(), ConnectionState::Failed);
        assert_eq!(
            answerer.last_error().borrow().clone(),
            Some(NegotiationError::Signaling(SignalStoreError::NotFound))
        );
    }

    #[tokio::test]
    async fn remote_candidates_wait_for_the_remote_description() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let endpoint_a = factory_a.endpoint();

        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        offerer.negotiate().await.expect("offerer negotiation");

        // A candidate lands before any answer exists. It must be buffered,
        // not dropped and not rejected.
        store
            .publish_candidate(
                "s1",
                SdpKind::Answer,
                record("candidate:early 1 udp 1 10.0.0.7 9 typ host"),
            )
            .await
            .expect("early candidate");
        sleep(Duration::from_millis(50)).await;
        assert!(endpoint_a.remote_candidates().is_empty());

        store
            .publish_answer(
                "s1",
                SignalDescriptor::answer("v=0 answer"),
                vec![record("candidate:bundled 1 udp 1 10.0.0.8 9 typ host")],
            )
            .await
            .expect("answer");
        sleep(Duration::from_millis(100)).await;

        let applied = endpoint_a.remote_candidates();
        let names: Vec<&str> = applied.iter().map(|c| c.candidate.as_str()).collect();
        assert!(names.iter().any(|c| c.contains("candidate:early")));
        assert!(names.iter().any(|c| c.contains("candidate:bundled")));

        // Once the remote description is in, further trickled candidates go
        // straight to the transport instead of the buffer.
        store
            .publish_candidate(
                "s1",
                SdpKind::Answer,
                record("candidate:late 1 udp 1 10.0.0.9 9 typ host"),
            )
            .await
            .expect("late candidate");
        sleep(Duration::from_millis(50)).await;
        let names: Vec<IceCandidateRecord> = endpoint_a.remote_candidates();
        assert!(
            names.iter().any(|c| c.candidate.contains("candidate:late")),
            "candidate trickled after the answer was not applied"
        );
        offerer.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cleans_the_store() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store.clone() as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );
        offerer.negotiate().await.expect("offerer negotiation");
        assert!(store.session_exists("s1").await.expect("exists"));

        offerer.close().await;
        assert_eq!(*offerer.state().borrow(), ConnectionState::Closed);
        assert!(!store.session_exists("s1").await.expect("exists"));

        offerer.close().await;
        assert_eq!(*offerer.state().borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_reports_false_while_the_channel_is_down() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let offerer = LinkCoordinator::new(
            LinkRole::Offerer,
            "s1",
            quick_config(),
            store as Arc<dyn SignalStore>,
            Arc::new(factory_a),
        );

        let envelope = Envelope::new("ping", json!({}));
        assert!(!offerer.send(&envelope).await, "no transport yet");

        offerer.negotiate().await.expect("offerer negotiation");
        assert!(
            !offerer.send(&envelope).await,
            "channel not open before the answer"
        );
    }
}
