//! Store-and-notify signaling between two peers that cannot reach each other
//! directly yet. One side publishes an SDP offer under a session id, the other
//! side fetches it, answers, and both sides trickle ICE candidates through the
//! same store until the direct link comes up.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod memory;
pub mod rtdb;

pub use memory::MemorySignalStore;
pub use rtdb::{RtdbConfig, RtdbSignalStore};

/// Opaque session identifier, generated by the offering side.
pub type SessionId = String;

/// Which side of the exchange a description or candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn other(self) -> Self {
        match self {
            SdpKind::Offer => SdpKind::Answer,
            SdpKind::Answer => SdpKind::Offer,
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// A session description as exchanged over the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalDescriptor {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SignalDescriptor {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate in transit. Hash/Eq cover the full record so stores and
/// subscribers can deduplicate replayed lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Free-form fields published alongside the offer (proof type, conditions, a
/// display label). The store treats them as opaque.
pub type SessionMetadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub offer: SignalDescriptor,
    #[serde(default)]
    pub candidates: Vec<IceCandidateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub answer: SignalDescriptor,
    #[serde(default)]
    pub candidates: Vec<IceCandidateRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalStoreError {
    #[error("signaling initialization failed: {0}")]
    Init(String),
    #[error("signaling request failed: {0}")]
    Io(String),
    #[error("no offer published for this session")]
    NotFound,
    #[error("the published offer has expired")]
    Expired,
    #[error("signal store is closed")]
    Closed,
}

/// Seconds since the unix epoch.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Answer notifications. Yields the current value on subscribe (`None` while
/// no answer is stored) and again whenever an answer lands. Dropping the
/// subscription stops the backing watcher.
pub struct AnswerSubscription {
    rx: mpsc::UnboundedReceiver<Option<AnswerRecord>>,
    task: Option<JoinHandle<()>>,
}

impl AnswerSubscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Option<AnswerRecord>>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, task }
    }

    pub async fn recv(&mut self) -> Option<Option<AnswerRecord>> {
        self.rx.recv().await
    }
}

impl Drop for AnswerSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Remote-candidate notifications. Backends may replay the full stored list
/// on every change; the subscription filters so each distinct record is
/// delivered exactly once.
pub struct CandidateSubscription {
    rx: mpsc::UnboundedReceiver<IceCandidateRecord>,
    task: Option<JoinHandle<()>>,
}

impl CandidateSubscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<IceCandidateRecord>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, task }
    }

    pub async fn recv(&mut self) -> Option<IceCandidateRecord> {
        self.rx.recv().await
    }
}

impl Drop for CandidateSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Tracks which candidate records have already been delivered.
#[derive(Debug, Default)]
pub struct CandidateDedup {
    seen: HashSet<IceCandidateRecord>,
}

impl CandidateDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters a (possibly replayed) batch down to records not seen before.
    pub fn fresh(
        &mut self,
        batch: impl IntoIterator<Item = IceCandidateRecord>,
    ) -> Vec<IceCandidateRecord> {
        batch
            .into_iter()
            .filter(|record| self.seen.insert(record.clone()))
            .collect()
    }
}

/// Rendezvous contract between the two peers. Implementations must keep every
/// operation usable from multiple tasks concurrently.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Establishes whatever connectivity the backend needs. Idempotent.
    async fn initialize(&self) -> Result<(), SignalStoreError>;

    /// Writes the offer for `session_id`, replacing any previous record.
    async fn publish_offer(
        &self,
        session_id: &str,
        offer: SignalDescriptor,
        candidates: Vec<IceCandidateRecord>,
        metadata: Option<SessionMetadata>,
    ) -> Result<(), SignalStoreError>;

    /// Reads the stored offer. `NotFound` when absent, `Expired` when its
    /// lifetime has lapsed.
    async fn fetch_offer(&self, session_id: &str) -> Result<OfferRecord, SignalStoreError>;

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SignalDescriptor,
        candidates: Vec<IceCandidateRecord>,
    ) -> Result<(), SignalStoreError>;

    /// Reads the stored answer, `None` while nobody has answered yet.
    async fn fetch_answer(&self, session_id: &str)
    -> Result<Option<AnswerRecord>, SignalStoreError>;

    /// Appends one locally gathered candidate for `side` after that side's
    /// description was already published.
    async fn publish_candidate(
        &self,
        session_id: &str,
        side: SdpKind,
        candidate: IceCandidateRecord,
    ) -> Result<(), SignalStoreError>;

    async fn subscribe_answer(
        &self,
        session_id: &str,
    ) -> Result<AnswerSubscription, SignalStoreError>;

    /// Watches candidates published by `side`. Delivery is exactly-once per
    /// distinct record even when the backend replays whole lists.
    async fn subscribe_candidates(
        &self,
        session_id: &str,
        side: SdpKind,
    ) -> Result<CandidateSubscription, SignalStoreError>;

    async fn session_exists(&self, session_id: &str) -> Result<bool, SignalStoreError>;

    /// Removes every record stored under `session_id` and ends subscriptions
    /// attached to it. No-op when nothing is stored.
    async fn cleanup_session(&self, session_id: &str) -> Result<(), SignalStoreError>;

    /// Shuts the store down; later operations fail with `Closed`.
    async fn close(&self) -> Result<(), SignalStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(candidate: &str) -> IceCandidateRecord {
        IceCandidateRecord {
            candidate: candidate.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn dedup_filters_replayed_lists() {
        let mut dedup = CandidateDedup::new();
        let first = dedup.fresh(vec![record("candidate:1")]);
        assert_eq!(first.len(), 1);

        let second = dedup.fresh(vec![record("candidate:1"), record("candidate:2")]);
        assert_eq!(second, vec![record("candidate:2")]);

        let third = dedup.fresh(vec![
            record("candidate:1"),
            record("candidate:2"),
            record("candidate:3"),
        ]);
        assert_eq!(third, vec![record("candidate:3")]);
    }

    #[test]
    fn descriptor_serializes_kind_as_type() {
        let desc = SignalDescriptor::offer("v=0");
        let json = serde_json::to_value(&desc).expect("serialize descriptor");
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");

        let back: SignalDescriptor = serde_json::from_value(json).expect("parse descriptor");
        assert_eq!(back, desc);
    }

    #[test]
    fn candidate_record_tolerates_missing_optional_fields() {
        let parsed: IceCandidateRecord =
            serde_json::from_str(r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host"}"#)
                .expect("parse candidate");
        assert!(parsed.sdp_mid.is_none());
        assert!(parsed.sdp_mline_index.is_none());
    }
}
