//! In-process signal store. Used by tests and by single-process demos where
//! both peers live in the same runtime. Candidate watchers are re-sent the
//! full stored list on every mutation, which exercises the subscription-side
//! dedup the same way a realtime-database backend would.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    AnswerRecord, AnswerSubscription, CandidateDedup, CandidateSubscription, IceCandidateRecord,
    OfferRecord, SdpKind, SessionMetadata, SignalDescriptor, SignalStore, SignalStoreError,
    now_unix,
};

#[derive(Default)]
struct SessionSlot {
    offer: Option<OfferRecord>,
    answer: Option<AnswerRecord>,
    offer_trickle: Vec<IceCandidateRecord>,
    answer_trickle: Vec<IceCandidateRecord>,
    answer_watchers: Vec<mpsc::UnboundedSender<Option<AnswerRecord>>>,
    candidate_watchers: Vec<(SdpKind, mpsc::UnboundedSender<Vec<IceCandidateRecord>>)>,
}

impl SessionSlot {
    fn candidates_for(&self, side: SdpKind) -> Vec<IceCandidateRecord> {
        let (bundled, trickled) = match side {
            SdpKind::Offer => (
                self.offer.as_ref().map(|o| o.candidates.as_slice()),
                &self.offer_trickle,
            ),
            SdpKind::Answer => (
                self.answer.as_ref().map(|a| a.candidates.as_slice()),
                &self.answer_trickle,
            ),
        };
        let mut list: Vec<IceCandidateRecord> = bundled.unwrap_or_default().to_vec();
        list.extend(trickled.iter().cloned());
        list
    }

    fn notify_candidates(&mut self, side: SdpKind) {
        let list = self.candidates_for(side);
        self.candidate_watchers
            .retain(|(watched, tx)| *watched != side || tx.send(list.clone()).is_ok());
    }

    fn notify_answer(&mut self) {
        let answer = self.answer.clone();
        self.answer_watchers
            .retain(|tx| tx.send(answer.clone()).is_ok());
    }
}

pub struct MemorySignalStore {
    sessions: Mutex<HashMap<String, SessionSlot>>,
    ttl: Option<Duration>,
    closed: AtomicBool,
}

impl MemorySignalStore {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Offers published through this store expire `ttl` after creation.
    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Self::build(Some(ttl))
    }

    fn build(ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), SignalStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalStoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemorySignalStore {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: None,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn initialize(&self) -> Result<(), SignalStoreError> {
        self.ensure_open()
    }

    async fn publish_offer(
        &self,
        session_id: &str,
        offer: SignalDescriptor,
        candidates: Vec<IceCandidateRecord>,
        metadata: Option<SessionMetadata>,
    ) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let created_at = now_unix();
        let expires_at = self.ttl.map(|ttl| created_at + ttl.as_secs() as i64);
        let mut sessions = self.sessions.lock();
        let slot = sessions.entry(session_id.to_string()).or_default();
        slot.offer = Some(OfferRecord {
            offer,
            candidates,
            metadata,
            created_at,
            expires_at,
        });
        slot.offer_trickle.clear();
        slot.notify_candidates(SdpKind::Offer);
        Ok(())
    }

    async fn fetch_offer(&self, session_id: &str) -> Result<OfferRecord, SignalStoreError> {
        self.ensure_open()?;
        let sessions = self.sessions.lock();
        let slot = sessions.get(session_id).ok_or(SignalStoreError::NotFound)?;
        let offer = slot.offer.clone().ok_or(SignalStoreError::NotFound)?;
        if let Some(expires_at) = offer.expires_at {
            if expires_at <= now_unix() {
                return Err(SignalStoreError::Expired);
            }
        }
        let mut offer = offer;
        offer.candidates = slot.candidates_for(SdpKind::Offer);
        Ok(offer)
    }

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SignalDescriptor,
        candidates: Vec<IceCandidateRecord>,
    ) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let mut sessions = self.sessions.lock();
        let slot = sessions.entry(session_id.to_string()).or_default();
        slot.answer = Some(AnswerRecord { answer, candidates });
        slot.answer_trickle.clear();
        slot.notify_answer();
        slot.notify_candidates(SdpKind::Answer);
        Ok(())
    }

    async fn fetch_answer(
        &self,
        session_id: &str,
    ) -> Result<Option<AnswerRecord>, SignalStoreError> {
        self.ensure_open()?;
        let sessions = self.sessions.lock();
        let Some(slot) = sessions.get(session_id) else {
            return Ok(None);
        };
        let Some(mut answer) = slot.answer.clone() else {
            return Ok(None);
        };
        answer.candidates = slot.candidates_for(SdpKind::Answer);
        Ok(Some(answer))
    }

    async fn publish_candidate(
        &self,
        session_id: &str,
        side: SdpKind,
        candidate: IceCandidateRecord,
    ) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let mut sessions = self.sessions.lock();
        let slot = sessions.entry(session_id.to_string()).or_default();
        match side {
            SdpKind::Offer => slot.offer_trickle.push(candidate),
            SdpKind::Answer => slot.answer_trickle.push(candidate),
        }
        slot.notify_candidates(side);
        Ok(())
    }

    async fn subscribe_answer(
        &self,
        session_id: &str,
    ) -> Result<AnswerSubscription, SignalStoreError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.lock();
        let slot = sessions.entry(session_id.to_string()).or_default();
        let _ = tx.send(slot.answer.clone());
        slot.answer_watchers.push(tx);
        Ok(AnswerSubscription::new(rx, None))
    }

    async fn subscribe_candidates(
        &self,
        session_id: &str,
        side: SdpKind,
    ) -> Result<CandidateSubscription, SignalStoreError> {
        self.ensure_open()?;
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Vec<IceCandidateRecord>>();
        {
            let mut sessions = self.sessions.lock();
            let slot = sessions.entry(session_id.to_string()).or_default();
            let current = slot.candidates_for(side);
            if !current.is_empty() {
                let _ = raw_tx.send(current);
            }
            slot.candidate_watchers.push((side, raw_tx));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut dedup = CandidateDedup::new();
            while let Some(batch) = raw_rx.recv().await {
                for record in dedup.fresh(batch) {
                    if out_tx.send(record).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(CandidateSubscription::new(out_rx, Some(task)))
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, SignalStoreError> {
        self.ensure_open()?;
        let sessions = self.sessions.lock();
        Ok(sessions
            .get(session_id)
            .is_some_and(|slot| slot.offer.is_some()))
    }

    async fn cleanup_session(&self, session_id: &str) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        // Dropping the slot drops its watcher senders, ending subscriptions.
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), SignalStoreError> {
        self.closed.store(true, Ordering::SeqCst);
        self.sessions.lock().clear();
        Ok(())
    }
}
