//! Realtime-database signal store speaking the Firebase REST dialect:
//! `{base}/sessions/{id}/{offer|answer}.json` with an optional `auth` query
//! token, `PUT` for descriptors, `POST` (push) for trickled candidates and
//! `DELETE` for cleanup. Subscriptions poll; the REST surface has no push
//! channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::{
    AnswerRecord, AnswerSubscription, CandidateDedup, CandidateSubscription, IceCandidateRecord,
    OfferRecord, SdpKind, SessionMetadata, SignalDescriptor, SignalStore, SignalStoreError,
    now_unix,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RtdbConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub poll_interval: Duration,
    pub ttl: Option<Duration>,
}

impl RtdbConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ttl: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OfferNode {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<SessionMetadata>,
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerNode {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ice: Option<Value>,
}

pub struct RtdbSignalStore {
    http: reqwest::Client,
    config: RtdbConfig,
    closed: Arc<AtomicBool>,
}

impl RtdbSignalStore {
    pub fn new(config: RtdbConfig) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn ensure_open(&self) -> Result<(), SignalStoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalStoreError::Closed);
        }
        Ok(())
    }

    fn node_url(&self, path: &str, shallow: bool) -> String {
        build_node_url(
            &self.config.base_url,
            self.config.auth_token.as_deref(),
            path,
            shallow,
        )
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> Result<(), SignalStoreError> {
        let response = self
            .http
            .put(self.node_url(path, false))
            .json(body)
            .send()
            .await
            .map_err(to_io)?;
        check_status(&response)?;
        Ok(())
    }
}

fn build_node_url(base: &str, auth_token: Option<&str>, path: &str, shallow: bool) -> String {
    let base = base.trim_end_matches('/');
    let mut url = format!("{base}/{path}.json");
    let mut sep = '?';
    if let Some(token) = auth_token {
        url.push(sep);
        url.push_str("auth=");
        url.push_str(token);
        sep = '&';
    }
    if shallow {
        url.push(sep);
        url.push_str("shallow=true");
    }
    url
}

fn to_io(err: reqwest::Error) -> SignalStoreError {
    SignalStoreError::Io(err.to_string())
}

fn check_status(response: &reqwest::Response) -> Result<(), SignalStoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(SignalStoreError::Io(format!(
            "signaling endpoint returned {status}"
        )))
    }
}

async fn get_value(http: &reqwest::Client, url: &str) -> Result<Value, SignalStoreError> {
    let response = http.get(url).send().await.map_err(to_io)?;
    check_status(&response)?;
    response.json::<Value>().await.map_err(to_io)
}

/// Candidate nodes are either a plain array (bundled at publish time) or a
/// push-id keyed object (trickled appends), or a mix after both happened.
fn flatten_candidates(node: Option<&Value>) -> Vec<IceCandidateRecord> {
    let mut out = Vec::new();
    match node {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for item in items {
                push_candidate(&mut out, item);
            }
        }
        Some(Value::Object(map)) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                push_candidate(&mut out, &map[key]);
            }
        }
        Some(other) => {
            tracing::debug!(target: "signal", node = %other, "unexpected candidate node shape");
        }
    }
    out
}

fn push_candidate(out: &mut Vec<IceCandidateRecord>, value: &Value) {
    match serde_json::from_value::<IceCandidateRecord>(value.clone()) {
        Ok(record) => out.push(record),
        Err(err) => {
            tracing::debug!(target: "signal", error = %err, "skipping malformed candidate record");
        }
    }
}

fn bundle_candidates(candidates: &[IceCandidateRecord]) -> Option<Value> {
    if candidates.is_empty() {
        return None;
    }
    let mut map = serde_json::Map::new();
    for (index, record) in candidates.iter().enumerate() {
        match serde_json::to_value(record) {
            Ok(value) => {
                map.insert(format!("{index:04}"), value);
            }
            Err(err) => {
                tracing::debug!(target: "signal", error = %err, "skipping unserializable candidate");
            }
        }
    }
    Some(Value::Object(map))
}

fn parse_offer(value: Value, now: i64) -> Result<OfferRecord, SignalStoreError> {
    if value.is_null() {
        return Err(SignalStoreError::NotFound);
    }
    let node: OfferNode = serde_json::from_value(value)
        .map_err(|err| SignalStoreError::Io(format!("malformed offer record: {err}")))?;
    if let Some(expires_at) = node.expires_at {
        if expires_at <= now {
            return Err(SignalStoreError::Expired);
        }
    }
    Ok(OfferRecord {
        offer: SignalDescriptor {
            kind: node.kind,
            sdp: node.sdp,
        },
        candidates: flatten_candidates(node.ice.as_ref()),
        metadata: node.metadata,
        created_at: node.created_at,
        expires_at: node.expires_at,
    })
}

fn parse_answer(value: Value) -> Result<Option<AnswerRecord>, SignalStoreError> {
    if value.is_null() {
        return Ok(None);
    }
    let node: AnswerNode = serde_json::from_value(value)
        .map_err(|err| SignalStoreError::Io(format!("malformed answer record: {err}")))?;
    Ok(Some(AnswerRecord {
        answer: SignalDescriptor {
            kind: node.kind,
            sdp: node.sdp,
        },
        candidates: flatten_candidates(node.ice.as_ref()),
    }))
}

#[async_trait]
impl SignalStore for RtdbSignalStore {
    async fn initialize(&self) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url("sessions", true);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| SignalStoreError::Init(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SignalStoreError::Init(format!(
                "signaling endpoint returned {status}"
            )))
        }
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
        let node = OfferNode {
            kind: offer.kind,
            sdp: offer.sdp,
            metadata,
            created_at,
            expires_at: self
                .config
                .ttl
                .map(|ttl| created_at + ttl.as_secs() as i64),
            ice: bundle_candidates(&candidates),
        };
        self.put(&format!("sessions/{session_id}/offer"), &node).await
    }

    async fn fetch_offer(&self, session_id: &str) -> Result<OfferRecord, SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url(&format!("sessions/{session_id}/offer"), false);
        let value = get_value(&self.http, &url).await?;
        parse_offer(value, now_unix())
    }

    async fn publish_answer(
        &self,
        session_id: &str,
        answer: SignalDescriptor,
        candidates: Vec<IceCandidateRecord>,
    ) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let node = AnswerNode {
            kind: answer.kind,
            sdp: answer.sdp,
            ice: bundle_candidates(&candidates),
        };
        self.put(&format!("sessions/{session_id}/answer"), &node).await
    }

    async fn fetch_answer(
        &self,
        session_id: &str,
    ) -> Result<Option<AnswerRecord>, SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url(&format!("sessions/{session_id}/answer"), false);
        let value = get_value(&self.http, &url).await?;
        parse_answer(value)
    }

    async fn publish_candidate(
        &self,
        session_id: &str,
        side: SdpKind,
        candidate: IceCandidateRecord,
    ) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url(&format!("sessions/{session_id}/{side}/ice"), false);
        let response = self
            .http
            .post(&url)
            .json(&candidate)
            .send()
            .await
            .map_err(to_io)?;
        check_status(&response)
    }

    async fn subscribe_answer(
        &self,
        session_id: &str,
    ) -> Result<AnswerSubscription, SignalStoreError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let url = self.node_url(&format!("sessions/{session_id}/answer"), false);
        let interval = self.config.poll_interval;
        let closed = Arc::clone(&self.closed);
        let task = tokio::spawn(async move {
            let mut reported_absent = false;
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match get_value(&http, &url).await.and_then(parse_answer) {
                    Ok(Some(answer)) => {
                        let _ = tx.send(Some(answer));
                        break;
                    }
                    Ok(None) => {
                        if !reported_absent {
                            if tx.send(None).is_err() {
                                break;
                            }
                            reported_absent = true;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target: "signal", error = %err, "answer poll failed");
                    }
                }
                sleep(interval).await;
            }
        });
        Ok(AnswerSubscription::new(rx, Some(task)))
    }

    async fn subscribe_candidates(
        &self,
        session_id: &str,
        side: SdpKind,
    ) -> Result<CandidateSubscription, SignalStoreError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let url = self.node_url(&format!("sessions/{session_id}/{side}/ice"), false);
        let interval = self.config.poll_interval;
        let closed = Arc::clone(&self.closed);
        let task = tokio::spawn(async move {
            let mut dedup = CandidateDedup::new();
            loop {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                match get_value(&http, &url).await {
                    Ok(value) => {
                        let batch = flatten_candidates(Some(&value));
                        let mut gone = false;
                        for record in dedup.fresh(batch) {
                            if tx.send(record).is_err() {
                                gone = true;
                                break;
                            }
                        }
                        if gone {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target: "signal", error = %err, "candidate poll failed");
                    }
                }
                sleep(interval).await;
            }
        });
        Ok(CandidateSubscription::new(rx, Some(task)))
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url(&format!("sessions/{session_id}/offer/sdp"), true);
        let value = get_value(&self.http, &url).await?;
        Ok(!value.is_null())
    }

    async fn cleanup_session(&self, session_id: &str) -> Result<(), SignalStoreError> {
        self.ensure_open()?;
        let url = self.node_url(&format!("sessions/{session_id}"), false);
        let response = self.http.delete(&url).send().await.map_err(to_io)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(&response)
    }

    async fn close(&self) -> Result<(), SignalStoreError> {
        // Poll tasks observe the flag on their next tick and stop.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_url_carries_auth_and_shallow_params() {
        let plain = build_node_url("https://db.example.com/", None, "sessions/s1/offer", false);
        assert_eq!(plain, "https://db.example.com/sessions/s1/offer.json");

        let authed = build_node_url(
            "https://db.example.com",
            Some("secret"),
            "sessions",
            true,
        );
        assert_eq!(
            authed,
            "https://db.example.com/sessions.json?auth=secret&shallow=true"
        );
    }

    #[test]
    fn flatten_handles_arrays_and_push_maps() {
        let array = json!([
            { "candidate": "candidate:1" },
            { "candidate": "candidate:2" }
        ]);
        let records = flatten_candidates(Some(&array));
        assert_eq!(records.len(), 2);

        let pushed = json!({
            "0000": { "candidate": "candidate:1" },
            "-Nabc": { "candidate": "candidate:0" }
        });
        let records = flatten_candidates(Some(&pushed));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].candidate, "candidate:0");

        assert!(flatten_candidates(None).is_empty());
        assert!(flatten_candidates(Some(&Value::Null)).is_empty());
    }

    #[test]
    fn parse_offer_honors_expiry_and_absence() {
        assert_eq!(parse_offer(Value::Null, 100), Err(SignalStoreError::NotFound));

        let live = json!({
            "type": "offer",
            "sdp": "v=0",
            "created_at": 50,
            "expires_at": 200
        });
        let record = parse_offer(live.clone(), 100).expect("live offer");
        assert_eq!(record.offer.kind, SdpKind::Offer);
        assert!(record.candidates.is_empty());

        assert_eq!(parse_offer(live, 200), Err(SignalStoreError::Expired));
    }

    #[test]
    fn offer_node_round_trips_bundled_candidates() {
        let candidates = vec![IceCandidateRecord {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }];
        let node = OfferNode {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
            metadata: None,
            created_at: 10,
            expires_at: None,
            ice: bundle_candidates(&candidates),
        };
        let value = serde_json::to_value(&node).expect("serialize offer node");
        let record = parse_offer(value, 20).expect("parse back");
        assert_eq!(record.candidates, candidates);
    }
}
