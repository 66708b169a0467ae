//! A proof session owns one link to a phone and turns the message exchange
//! into an unsigned transaction: hand out the QR payload, answer the phone's
//! parameter request, and when the proof arrives pick the right transaction
//! shape for the subject's registration status.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use signal_store::{SessionMetadata, SignalStore, now_unix};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::contract::{ContractBridge, TransactionBuildError, UnsignedTx};
use crate::link::{ConnectionState, LinkConfig, LinkCoordinator, LinkRole, NegotiationError};
use crate::protocol::{
    Envelope, HandshakePayload, MSG_PROOF_COMPLETED, MSG_PROOF_PARAMS, MSG_PROOF_PARAMS_REQUEST,
    ProofCompleted, ProofParamsRequest, ValidationError,
};
use crate::transport::PeerTransportFactory;

mod client;

pub use client::PontoonClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    WaitingForMobile,
    MobileConnected,
    ProofReceived,
    TransactionReady,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::WaitingForMobile => "waiting_for_mobile",
            SessionState::MobileConnected => "mobile_connected",
            SessionState::ProofReceived => "proof_received",
            SessionState::TransactionReady => "transaction_ready",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    TransactionBuild(#[from] TransactionBuildError),
    #[error("session closed before a transaction was ready")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub proof_type: String,
    /// Wallet that will sign and submit the resulting transaction. Required
    /// for verification queries.
    pub user_address: Option<String>,
    /// Verifier conditions shown to the phone, forwarded opaquely.
    pub conditions: Option<Value>,
    pub metadata: Option<SessionMetadata>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            proof_type: "passport".to_string(),
            user_address: None,
            conditions: None,
            metadata: None,
        }
    }
}

/// Resolves exactly once; every waiter sees the same outcome.
struct TransactionSlot {
    value: Mutex<Option<Result<UnsignedTx, SessionError>>>,
    notify: Notify,
}

impl TransactionSlot {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    fn resolve(&self, outcome: Result<UnsignedTx, SessionError>) -> bool {
        {
            let mut value = self.value.lock();
            if value.is_some() {
                return false;
            }
            *value = Some(outcome);
        }
        self.notify.notify_waiters();
        true
    }

    async fn wait(&self) -> Result<UnsignedTx, SessionError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.value.lock().clone() {
                return outcome;
            }
            notified.await;
        }
    }
}

pub struct ProofSession {
    id: String,
    options: SessionOptions,
    coordinator: Arc<LinkCoordinator>,
    bridge: Arc<dyn ContractBridge>,
    state_tx: watch::Sender<SessionState>,
    tx_slot: TransactionSlot,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicBool,
}

impl fmt::Debug for ProofSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofSession")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ProofSession {
    pub(crate) fn new(
        options: SessionOptions,
        store: Arc<dyn SignalStore>,
        bridge: Arc<dyn ContractBridge>,
        factory: Arc<dyn PeerTransportFactory>,
        mut link_config: LinkConfig,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().simple().to_string();
        link_config.offer_metadata = Some(offer_metadata(&options));
        let coordinator =
            LinkCoordinator::new(LinkRole::Offerer, id.clone(), link_config, store, factory);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            id,
            options,
            coordinator,
            bridge,
            state_tx,
            tx_slot: TransactionSlot::new(),
            tasks: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.coordinator.state()
    }

    /// What the desktop renders as a QR code for the phone.
    pub fn handshake_payload(&self) -> Result<String, ValidationError> {
        HandshakePayload {
            session_id: self.id.clone(),
            proof_type: self.options.proof_type.clone(),
            user_address: self.options.user_address.clone(),
            conditions: self.options.conditions.clone(),
        }
        .encode()
    }

    /// Publishes the offer and starts watching the link. Returns once the
    /// session is ready to be shown to the phone.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SessionError> {
        self.set_state(SessionState::Initializing);
        if let Err(err) = self.coordinator.negotiate().await {
            let err = SessionError::from(err);
            self.fail(err.clone());
            return Err(err);
        }
        self.set_state(SessionState::WaitingForMobile);
        self.spawn_inbox();
        self.spawn_connection_watcher();
        Ok(())
    }

    /// Completes when the proof exchange produced an unsigned transaction or
    /// the session failed. Safe to call from any number of tasks.
    pub async fn wait_for_transaction(&self) -> Result<UnsignedTx, SessionError> {
        self.tx_slot.wait().await
    }

    /// Tears down the link and settles any pending waiters. Idempotent.
    pub async fn close(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.coordinator.close().await;
        self.tx_slot.resolve(Err(SessionError::Closed));
        let _ = self.state_tx.send_if_modified(|current| {
            if *current == SessionState::Failed || *current == SessionState::Completed {
                return false;
            }
            *current = SessionState::Completed;
            true
        });
        tracing::debug!(target: "session", id = %self.id, "session closed");
    }

    fn spawn_inbox(self: &Arc<Self>) {
        let Some(mut inbox) = self.coordinator.messages() else {
            tracing::warn!(target: "session", id = %self.id, "message stream already taken");
            return;
        };
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                if !this.active.load(Ordering::SeqCst) {
                    break;
                }
                this.handle_frame(&frame).await;
            }
        }));
    }

    fn spawn_connection_watcher(self: &Arc<Self>) {
        let mut connection = self.coordinator.state();
        let errors = self.coordinator.last_error();
        let this = Arc::clone(self);
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                let state = *connection.borrow();
                match state {
                    ConnectionState::Connected => {
                        let _ = this.state_tx.send_if_modified(|current| {
                            if *current == SessionState::WaitingForMobile {
                                *current = SessionState::MobileConnected;
                                tracing::debug!(
                                    target: "session",
                                    id = %this.id,
                                    "mobile peer connected"
                                );
                                true
                            } else {
                                false
                            }
                        });
                    }
                    ConnectionState::Failed => {
                        let err = errors.borrow().clone().unwrap_or_else(|| {
                            NegotiationError::Phase {
                                role: LinkRole::Offerer,
                                phase: crate::link::NegotiationPhase::DataChannel,
                                message: "peer connection failed".to_string(),
                            }
                        });
                        this.fail(SessionError::Negotiation(err));
                        break;
                    }
                    ConnectionState::Closed => break,
                    _ => {}
                }
                if connection.changed().await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn handle_frame(self: &Arc<Self>, frame: &str) {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(
                    target: "session",
                    id = %self.id,
                    error = %err,
                    "discarding malformed frame"
                );
                return;
            }
        };
        match envelope.kind.as_str() {
            MSG_PROOF_PARAMS_REQUEST => self.handle_params_request(envelope.payload).await,
            MSG_PROOF_COMPLETED => self.handle_proof_completed(envelope.payload).await,
            other => {
                tracing::debug!(
                    target: "session",
                    id = %self.id,
                    kind = other,
                    "ignoring unrecognized message kind"
                );
            }
        }
    }

    async fn handle_params_request(self: &Arc<Self>, payload: Value) {
        let request: ProofParamsRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                self.fail(SessionError::Validation(ValidationError::new(
                    "payload",
                    err.to_string(),
                )));
                return;
            }
        };
        if let Err(err) = request.validate() {
            self.fail(SessionError::Validation(err));
            return;
        }
        let address = request
            .user_address
            .as_deref()
            .or(self.options.user_address.as_deref());
        let params = match self
            .bridge
            .get_proof_parameters(&request.passport_hash, &request.session_key, address)
            .await
        {
            Ok(params) => params,
            Err(err) => {
                self.fail(SessionError::TransactionBuild(err));
                return;
            }
        };
        let payload = match serde_json::to_value(&params) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    target: "session",
                    id = %self.id,
                    error = %err,
                    "failed to serialize proof parameters"
                );
                return;
            }
        };
        let reply = Envelope::new(MSG_PROOF_PARAMS, payload).with_timestamp(now_unix());
        if !self.coordinator.send(&reply).await {
            tracing::warn!(
                target: "session",
                id = %self.id,
                "proof parameters not delivered; channel not open"
            );
        }
    }

    async fn handle_proof_completed(self: &Arc<Self>, payload: Value) {
        let proof: ProofCompleted = match serde_json::from_value(payload) {
            Ok(proof) => proof,
            Err(err) => {
                self.fail(SessionError::Validation(ValidationError::new(
                    "payload",
                    err.to_string(),
                )));
                return;
            }
        };
        if let Err(err) = proof.validate() {
            self.fail(SessionError::Validation(err));
            return;
        }
        self.set_state(SessionState::ProofReceived);
        match self.build_transaction(proof).await {
            Ok(tx) => {
                self.tx_slot.resolve(Ok(tx));
                self.set_state(SessionState::TransactionReady);
                tracing::debug!(target: "session", id = %self.id, "transaction ready");
            }
            Err(err) => self.fail(err),
        }
    }

    /// Picks the transaction shape from what the proof carries and whether
    /// the subject is already registered on-chain.
    async fn build_transaction(
        &self,
        proof: ProofCompleted,
    ) -> Result<UnsignedTx, SessionError> {
        let registered = self.bridge.is_registered(&proof.session_key).await?;
        match (proof.registration, proof.query) {
            (Some(registration), Some(query)) => {
                let address = self.require_user_address()?;
                if registered {
                    Ok(self
                        .bridge
                        .build_query_proof_tx(&query, address, &proof.session_key)
                        .await?)
                } else {
                    Ok(self
                        .bridge
                        .build_combined_tx(&query, &registration, address)
                        .await?)
                }
            }
            (None, Some(query)) => {
                if !registered {
                    return Err(SessionError::TransactionBuild(TransactionBuildError(
                        "subject is not registered and no registration material was provided"
                            .to_string(),
                    )));
                }
                let address = self.require_user_address()?;
                Ok(self
                    .bridge
                    .build_query_proof_tx(&query, address, &proof.session_key)
                    .await?)
            }
            (Some(registration), None) => {
                if registered {
                    return Err(SessionError::TransactionBuild(TransactionBuildError(
                        "subject is already registered".to_string(),
                    )));
                }
                Ok(self.bridge.build_registration_tx(&registration).await?)
            }
            (None, None) => Err(SessionError::Validation(ValidationError::new(
                "payload",
                "neither registration nor zkPoints present",
            ))),
        }
    }

    fn require_user_address(&self) -> Result<&str, SessionError> {
        self.options
            .user_address
            .as_deref()
            .ok_or_else(|| {
                SessionError::Validation(ValidationError::new(
                    "user_address",
                    "required for verification queries",
                ))
            })
    }

    fn fail(&self, err: SessionError) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(target: "session", id = %self.id, error = %err, "session failed");
        self.tx_slot.resolve(Err(err));
        let _ = self.state_tx.send_replace(SessionState::Failed);
    }

    fn set_state(&self, next: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next || current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::debug!(
                target: "session",
                id = %self.id,
                state = %next,
                "session state changed"
            );
        }
    }
}

fn offer_metadata(options: &SessionOptions) -> SessionMetadata {
    let mut metadata = options.metadata.clone().unwrap_or_default();
    metadata.insert(
        "proof_type".to_string(),
        Value::String(options.proof_type.clone()),
    );
    if let Some(address) = &options.user_address {
        metadata.insert("user_address".to_string(), Value::String(address.clone()));
    }
    if let Some(conditions) = &options.conditions {
        metadata.insert("conditions".to_string(), conditions.clone());
    }
    metadata
}

impl Drop for ProofSession {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
