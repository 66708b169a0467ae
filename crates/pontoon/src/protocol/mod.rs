//! Wire protocol for the proof channel: JSON text frames with a `type` tag,
//! plus the QR handshake payload the desktop shows to the phone.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod date;

pub use date::PassportDate;

pub const MSG_PROOF_PARAMS_REQUEST: &str = "proof_params_request";
pub const MSG_PROOF_PARAMS: &str = "proof_params";
pub const MSG_PROOF_COMPLETED: &str = "proof_completed";

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// `0x`-prefixed hex string, at least one digit.
pub fn require_hex(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ValidationError::new(field, "missing 0x prefix"))?;
    if digits.is_empty() {
        return Err(ValidationError::new(field, "no hex digits after 0x"));
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::new(field, "contains non-hex characters"));
    }
    Ok(())
}

/// Unsigned decimal string, as used for field elements and date integers.
pub fn require_decimal(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "empty value"));
    }
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new(field, "contains non-decimal characters"));
    }
    Ok(())
}

/// One frame on the data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Mobile asks for the circuit inputs it needs before proving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofParamsRequest {
    pub passport_hash: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
}

impl ProofParamsRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_hex("passport_hash", &self.passport_hash)?;
        require_hex("session_key", &self.session_key)?;
        if let Some(address) = &self.user_address {
            require_hex("user_address", address)?;
        }
        Ok(())
    }
}

/// Proof material that registers a fresh identity on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub passport_hash: String,
    pub identity_key: String,
    pub dg1_commitment: String,
    /// Opaque zk proof blob, forwarded untouched to the contract bridge.
    pub proof: Value,
}

impl RegistrationData {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_hex("passport_hash", &self.passport_hash)?;
        require_hex("identity_key", &self.identity_key)?;
        require_hex("dg1_commitment", &self.dg1_commitment)?;
        if self.proof.is_null() {
            return Err(ValidationError::new("proof", "missing proof blob"));
        }
        Ok(())
    }
}

/// Proof material answering a verification query for an already registered
/// identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProofData {
    pub nullifier: String,
    pub zk_points: Value,
    pub current_date: String,
}

impl QueryProofData {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_decimal("nullifier", &self.nullifier)?;
        require_decimal("current_date", &self.current_date)?;
        if self.current_date.parse::<u32>().is_err() {
            return Err(ValidationError::new(
                "current_date",
                "not a YYMMDD integer",
            ));
        }
        if self.zk_points.is_null() {
            return Err(ValidationError::new("zk_points", "missing proof points"));
        }
        Ok(())
    }
}

/// Terminal message from the phone. Carries registration material, query
/// material, or both, depending on what the subject still needs on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofCompleted {
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationData>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "zkPoints")]
    pub query: Option<QueryProofData>,
}

impl ProofCompleted {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_hex("session_key", &self.session_key)?;
        if self.registration.is_none() && self.query.is_none() {
            return Err(ValidationError::new(
                "payload",
                "neither registration nor zkPoints present",
            ));
        }
        if let Some(registration) = &self.registration {
            registration.validate()?;
        }
        if let Some(query) = &self.query {
            query.validate()?;
        }
        Ok(())
    }
}

/// What the desktop encodes into the QR code: enough for the phone to find
/// the offer in the signal store and know what it is being asked to prove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub session_id: String,
    pub proof_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
}

impl HandshakePayload {
    pub fn encode(&self) -> Result<String, ValidationError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|err| ValidationError::new("handshake", err.to_string()))?;
        Ok(BASE64.encode(bytes))
    }

    pub fn decode(encoded: &str) -> Result<Self, ValidationError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| ValidationError::new("handshake", err.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| ValidationError::new("handshake", err.to_string()))
    }
}
