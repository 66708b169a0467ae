//! Bridge between the proof channel and the chain. Sessions never sign or
//! submit anything; the bridge assembles calldata and hands back unsigned
//! transactions for the caller's wallet.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{QueryProofData, RegistrationData};

/// Calldata ready for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub to: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Circuit inputs fetched from chain state for the prover. All values are
/// decimal or hex strings; the prover treats them as field elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofParameters {
    pub event_id: String,
    pub event_data: String,
    pub id_state_root: String,
    pub selector: String,
    pub current_date: String,
    pub timestamp_lowerbound: String,
    pub timestamp_upperbound: String,
    pub identity_counter_lowerbound: String,
    pub identity_counter_upperbound: String,
    pub birth_date_lowerbound: String,
    pub birth_date_upperbound: String,
    pub expiration_date_lowerbound: String,
    pub expiration_date_upperbound: String,
    pub citizenship_mask: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction build failed: {0}")]
pub struct TransactionBuildError(pub String);

#[async_trait]
pub trait ContractBridge: Send + Sync {
    /// Whether the proof subject behind `session_key` is already registered.
    async fn is_registered(&self, session_key: &str) -> Result<bool, TransactionBuildError>;

    /// Chain-derived inputs the prover needs before it can build a proof.
    async fn get_proof_parameters(
        &self,
        passport_hash: &str,
        session_key: &str,
        user_address: Option<&str>,
    ) -> Result<ProofParameters, TransactionBuildError>;

    async fn build_registration_tx(
        &self,
        registration: &RegistrationData,
    ) -> Result<UnsignedTx, TransactionBuildError>;

    async fn build_query_proof_tx(
        &self,
        query: &QueryProofData,
        user_address: &str,
        session_key: &str,
    ) -> Result<UnsignedTx, TransactionBuildError>;

    /// Registration and query proof in one transaction, for subjects not yet
    /// registered when the verification query arrives.
    async fn build_combined_tx(
        &self,
        query: &QueryProofData,
        registration: &RegistrationData,
        user_address: &str,
    ) -> Result<UnsignedTx, TransactionBuildError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Scriptable bridge: registration status is a flag, built transactions
    /// encode which branch produced them.
    pub struct StubBridge {
        registered: AtomicBool,
        pub calls: Mutex<Vec<String>>,
    }

    impl StubBridge {
        pub fn new(registered: bool) -> Self {
            Self {
                registered: AtomicBool::new(registered),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn parameters() -> ProofParameters {
            ProofParameters {
                event_id: "0x1".to_string(),
                event_data: "0x2".to_string(),
                id_state_root: "0x3".to_string(),
                selector: "0x1a01".to_string(),
                current_date: "260411".to_string(),
                timestamp_lowerbound: "0".to_string(),
                timestamp_upperbound: "1767225600".to_string(),
                identity_counter_lowerbound: "0".to_string(),
                identity_counter_upperbound: "1".to_string(),
                birth_date_lowerbound: "0".to_string(),
                birth_date_upperbound: "80101".to_string(),
                expiration_date_lowerbound: "260411".to_string(),
                expiration_date_upperbound: "0".to_string(),
                citizenship_mask: "0".to_string(),
            }
        }
    }

    #[async_trait]
    impl ContractBridge for StubBridge {
        async fn is_registered(&self, session_key: &str) -> Result<bool, TransactionBuildError> {
            self.calls
                .lock()
                .push(format!("is_registered:{session_key}"));
            Ok(self.registered.load(Ordering::SeqCst))
        }

        async fn get_proof_parameters(
            &self,
            passport_hash: &str,
            _session_key: &str,
            _user_address: Option<&str>,
        ) -> Result<ProofParameters, TransactionBuildError> {
            self.calls
                .lock()
                .push(format!("get_proof_parameters:{passport_hash}"));
            Ok(Self::parameters())
        }

        async fn build_registration_tx(
            &self,
            _registration: &RegistrationData,
        ) -> Result<UnsignedTx, TransactionBuildError> {
            self.calls.lock().push("build_registration_tx".to_string());
            Ok(UnsignedTx {
                to: "0xregistry".to_string(),
                data: "0xregistration".to_string(),
                value: None,
            })
        }

        async fn build_query_proof_tx(
            &self,
            _query: &QueryProofData,
            user_address: &str,
            _session_key: &str,
        ) -> Result<UnsignedTx, TransactionBuildError> {
            self.calls
                .lock()
                .push(format!("build_query_proof_tx:{user_address}"));
            Ok(UnsignedTx {
                to: "0xverifier".to_string(),
                data: "0xquery".to_string(),
                value: None,
            })
        }

        async fn build_combined_tx(
            &self,
            _query: &QueryProofData,
            _registration: &RegistrationData,
            user_address: &str,
        ) -> Result<UnsignedTx, TransactionBuildError> {
            self.calls
                .lock()
                .push(format!("build_combined_tx:{user_address}"));
            Ok(UnsignedTx {
                to: "0xverifier".to_string(),
                data: "0xcombined".to_string(),
                value: None,
            })
        }
    }
}
