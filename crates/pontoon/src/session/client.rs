//! Entry point owning the shared store, contract bridge and transport
//! factory. Sessions are tracked per client instance and drop out of the set
//! on their own once they reach a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use signal_store::SignalStore;
use tokio::task::JoinHandle;

use crate::contract::ContractBridge;
use crate::link::LinkConfig;
use crate::transport::{PeerTransportFactory, RtcTransportFactory};

use super::{ProofSession, SessionError, SessionOptions};

pub struct PontoonClient {
    store: Arc<dyn SignalStore>,
    bridge: Arc<dyn ContractBridge>,
    factory: Arc<dyn PeerTransportFactory>,
    link_config: LinkConfig,
    sessions: Arc<Mutex<HashMap<String, Arc<ProofSession>>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl PontoonClient {
    pub fn new(store: Arc<dyn SignalStore>, bridge: Arc<dyn ContractBridge>) -> Self {
        Self {
            store,
            bridge,
            factory: Arc::new(RtcTransportFactory),
            link_config: LinkConfig::default(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn PeerTransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Creates a session, publishes its offer and returns it ready for the
    /// QR handshake.
    pub async fn create_proof_session(
        &self,
        options: SessionOptions,
    ) -> Result<Arc<ProofSession>, SessionError> {
        let session = ProofSession::new(
            options,
            Arc::clone(&self.store),
            Arc::clone(&self.bridge),
            Arc::clone(&self.factory),
            self.link_config.clone(),
        );
        let id = session.id().to_string();
        self.sessions.lock().insert(id.clone(), Arc::clone(&session));

        let sessions = Arc::clone(&self.sessions);
        let mut state = session.state();
        let watcher_id = id.clone();
        self.watchers.lock().push(tokio::spawn(async move {
            loop {
                if state.borrow().is_terminal() {
                    sessions.lock().remove(&watcher_id);
                    tracing::debug!(
                        target: "session",
                        id = %watcher_id,
                        "session removed from active set"
                    );
                    break;
                }
                if state.changed().await.is_err() {
                    sessions.lock().remove(&watcher_id);
                    break;
                }
            }
        }));

        if let Err(err) = session.initialize().await {
            self.sessions.lock().remove(&id);
            session.close().await;
            return Err(err);
        }
        Ok(session)
    }

    pub fn session(&self, id: &str) -> Option<Arc<ProofSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Closes every session and the underlying store.
    pub async fn close(&self) {
        let sessions: Vec<Arc<ProofSession>> =
            { self.sessions.lock().drain().map(|(_, s)| s).collect() };
        for session in sessions {
            session.close().await;
        }
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
        if let Err(err) = self.store.close().await {
            tracing::warn!(target: "session", error = %err, "signal store close failed");
        }
    }
}

impl Drop for PontoonClient {
    fn drop(&mut self) {
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_store::{MemorySignalStore, SignalStoreError};

    use crate::contract::testing::StubBridge;
    use crate::transport::MockTransportFactory;

    #[tokio::test]
    async fn failed_setup_leaves_no_session_behind() {
        let store = MemorySignalStore::new();
        store.close().await.expect("close store");
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let client = PontoonClient::new(
            store as Arc<dyn SignalStore>,
            Arc::new(StubBridge::new(false)) as Arc<dyn ContractBridge>,
        )
        .with_transport_factory(Arc::new(factory_a));

        let err = client
            .create_proof_session(SessionOptions::default())
            .await
            .expect_err("store is closed");
        assert!(matches!(
            err,
            SessionError::Negotiation(crate::link::NegotiationError::Signaling(
                SignalStoreError::Closed
            ))
        ));
        assert_eq!(client.active_sessions(), 0);
    }

    #[tokio::test]
    async fn sessions_are_retrievable_by_id_until_closed() {
        let store = MemorySignalStore::new();
        let (factory_a, _factory_b) = MockTransportFactory::pair();
        let client = PontoonClient::new(
            store as Arc<dyn SignalStore>,
            Arc::new(StubBridge::new(false)) as Arc<dyn ContractBridge>,
        )
        .with_transport_factory(Arc::new(factory_a));

        let session = client
            .create_proof_session(SessionOptions::default())
            .await
            .expect("create session");
        assert!(client.session(session.id()).is_some());

        client.close().await;
        assert_eq!(client.active_sessions(), 0);
        assert!(client.session(session.id()).is_none());
    }
}
