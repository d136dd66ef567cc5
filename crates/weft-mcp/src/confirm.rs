//! Confirmation records and the deadline sweeper.
//!
//! A record pairs a posted prompt with its pending result. Resolution is a
//! compare-and-swap on `outcome == pending`: the callback handler and the
//! sweeper race, exactly one wins, and the record is immutable afterwards.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_bus::envelope::{topics, ConfirmationResult, Envelope, Payload};
use weft_bus::{Bus, Kv};
use weft_core::types::{ChatId, CorrelationId, EndpointId};
use weft_core::{Result, WeftError};

/// Default deadline when the request body does not carry `timeout_sec`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Resolved records linger this long for the audit trail, then expire.
const RECORD_TTL_SECS: u64 = 24 * 60 * 60;
/// Sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationOutcome {
    Pending,
    Confirmed,
    Rejected,
    Replied,
    Timeout,
}

impl fmt::Display for ConfirmationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfirmationOutcome::Pending => "pending",
            ConfirmationOutcome::Confirmed => "confirmed",
            ConfirmationOutcome::Rejected => "rejected",
            ConfirmationOutcome::Replied => "replied",
            ConfirmationOutcome::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConfirmationOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConfirmationOutcome::Pending),
            "confirmed" => Ok(ConfirmationOutcome::Confirmed),
            "rejected" => Ok(ConfirmationOutcome::Rejected),
            "replied" => Ok(ConfirmationOutcome::Replied),
            "timeout" => Ok(ConfirmationOutcome::Timeout),
            other => Err(format!("unknown confirmation outcome: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub correlation_id: CorrelationId,
    pub endpoint_id: EndpointId,
    pub chat_id: ChatId,
    pub prompt: String,
    pub deadline_ts: String,
    pub outcome: ConfirmationOutcome,
    pub reply: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

pub struct ConfirmationStore {
    kv: Arc<Kv>,
}

impl ConfirmationStore {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    fn key(id: &CorrelationId) -> String {
        format!("confirmation:{id}")
    }

    /// Create a pending record. A caller-supplied correlation id that
    /// already exists is a conflict.
    pub fn create(
        &self,
        correlation_id: Option<CorrelationId>,
        endpoint_id: EndpointId,
        chat_id: ChatId,
        prompt: &str,
        timeout_secs: u64,
    ) -> Result<ConfirmationRecord> {
        let record = ConfirmationRecord {
            correlation_id: correlation_id.unwrap_or_default(),
            endpoint_id,
            chat_id,
            prompt: prompt.to_string(),
            deadline_ts: (chrono::Utc::now() + chrono::Duration::seconds(timeout_secs as i64))
                .to_rfc3339(),
            outcome: ConfirmationOutcome::Pending,
            reply: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
        };

        let raw = serde_json::to_string(&record)?;
        if !self.kv.insert(&Self::key(&record.correlation_id), &raw)? {
            return Err(WeftError::Conflict(format!(
                "duplicate correlation: {}",
                record.correlation_id
            )));
        }
        debug!(correlation = %record.correlation_id, "confirmation created");
        Ok(record)
    }

    pub fn get(&self, id: &CorrelationId) -> Result<Option<ConfirmationRecord>> {
        self.kv.get_json(&Self::key(id))
    }

    /// Resolve a pending record. Returns the resolved record when this
    /// caller won the compare-and-swap, `None` when the record was already
    /// resolved (or never existed). Once resolved, a record never changes.
    pub fn resolve(
        &self,
        id: &CorrelationId,
        outcome: ConfirmationOutcome,
        reply: Option<String>,
    ) -> Result<Option<ConfirmationRecord>> {
        if outcome == ConfirmationOutcome::Pending {
            return Err(WeftError::Internal(
                "cannot resolve to pending".to_string(),
            ));
        }

        let key = Self::key(id);
        let Some(old_raw) = self.kv.get(&key)? else {
            return Ok(None);
        };
        let Ok(mut record) = serde_json::from_str::<ConfirmationRecord>(&old_raw) else {
            return Ok(None);
        };
        if record.outcome != ConfirmationOutcome::Pending {
            return Ok(None);
        }

        record.outcome = outcome;
        record.reply = reply;
        record.completed_at = Some(chrono::Utc::now().to_rfc3339());

        let new_raw = serde_json::to_string(&record)?;
        if self.kv.cas(&key, &old_raw, &new_raw, Some(RECORD_TTL_SECS))? {
            info!(correlation = %id, outcome = %record.outcome, "confirmation resolved");
            Ok(Some(record))
        } else {
            // Lost the race against the other resolver.
            Ok(None)
        }
    }

    /// Pending records whose deadline has passed.
    pub fn expired_pending(&self) -> Result<Vec<ConfirmationRecord>> {
        let now = chrono::Utc::now().to_rfc3339();
        Ok(self
            .kv
            .list("confirmation:")?
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str::<ConfirmationRecord>(&raw).ok())
            .filter(|r| r.outcome == ConfirmationOutcome::Pending && r.deadline_ts <= now)
            .collect())
    }
}

/// Publish the authoritative resolution: a `ConfirmationResult` envelope on
/// the tenant's event topic (live SSE listeners) and a queued line in the
/// replies queue (late joiners bridge the gap by draining it).
pub fn emit_resolution(bus: &Bus, record: &ConfirmationRecord) -> Result<()> {
    let payload = Payload::ConfirmationResult(ConfirmationResult {
        endpoint_id: record.endpoint_id.clone(),
        correlation_id: record.correlation_id.clone(),
        outcome: record.outcome.to_string(),
        reply: record.reply.clone(),
        extra: Default::default(),
    });
    bus.publish(
        &topics::mcp_events(record.endpoint_id.as_str()),
        Envelope::broadcast("mcp".into(), payload),
    )?;

    queue_reply_line(
        bus.kv(),
        &record.endpoint_id,
        &serde_json::json!({
            "type": "confirmation",
            "correlation_id": record.correlation_id,
            "outcome": record.outcome.to_string(),
            "confirmed": record.outcome == ConfirmationOutcome::Confirmed,
            "reply": record.reply,
        }),
    )
}

/// Append a JSON line to the tenant's replies queue (`mcp:feedback:<id>`).
pub fn queue_reply_line(kv: &Kv, endpoint_id: &EndpointId, line: &serde_json::Value) -> Result<()> {
    let key = format!("mcp:feedback:{endpoint_id}");
    // CAS loop: concurrent writers both keep their lines.
    for _ in 0..8 {
        let old = kv.get(&key)?;
        let mut items: Vec<serde_json::Value> = match &old {
            Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
            None => Vec::new(),
        };
        items.push(line.clone());
        let new = serde_json::to_string(&items)?;
        let stored = match old {
            Some(prev) => kv.cas(&key, &prev, &new, None)?,
            None => kv.insert(&key, &new)?,
        };
        if stored {
            return Ok(());
        }
    }
    Err(WeftError::Internal("replies queue update lost races".into()))
}

/// Atomically drain the tenant's replies queue.
pub fn drain_replies(kv: &Kv, endpoint_id: &EndpointId) -> Result<Vec<serde_json::Value>> {
    let key = format!("mcp:feedback:{endpoint_id}");
    loop {
        let Some(raw) = kv.get(&key)? else {
            return Ok(Vec::new());
        };
        if kv.del_if(&key, &raw)? {
            return Ok(serde_json::from_str(&raw).unwrap_or_default());
        }
        // A writer slipped in between read and delete — retry.
    }
}

/// Single global deadline sweeper: 1 s cadence, marks expired pending
/// records `timeout` and emits the same envelopes as a live resolution.
pub async fn run_sweeper(store: Arc<ConfirmationStore>, bus: Arc<Bus>, cancel: CancellationToken) {
    info!("confirmation sweeper started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }

        let expired = match store.expired_pending() {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "sweep scan failed");
                continue;
            }
        };

        for record in expired {
            match store.resolve(&record.correlation_id, ConfirmationOutcome::Timeout, None) {
                Ok(Some(resolved)) => {
                    if let Err(e) = emit_resolution(&bus, &resolved) {
                        warn!(correlation = %resolved.correlation_id, error = %e, "timeout emit failed");
                    }
                }
                // Lost to a late callback — that resolution already emitted.
                Ok(None) => {}
                Err(e) => warn!(correlation = %record.correlation_id, error = %e, "timeout resolve failed"),
            }
        }
    }
    info!("confirmation sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (Arc<Kv>, ConfirmationStore) {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        (Arc::clone(&kv), ConfirmationStore::new(kv))
    }

    fn create_pending(store: &ConfirmationStore, timeout_secs: u64) -> ConfirmationRecord {
        store
            .create(
                None,
                EndpointId::from("ep1"),
                ChatId::from("1"),
                "deploy?",
                timeout_secs,
            )
            .unwrap()
    }

    #[test]
    fn first_resolution_wins_then_record_is_immutable() {
        let (_, store) = store();
        let record = create_pending(&store, 120);

        let won = store
            .resolve(&record.correlation_id, ConfirmationOutcome::Confirmed, None)
            .unwrap();
        assert!(won.is_some());

        // The losing click is ignored.
        let lost = store
            .resolve(&record.correlation_id, ConfirmationOutcome::Rejected, None)
            .unwrap();
        assert!(lost.is_none());

        let stored = store.get(&record.correlation_id).unwrap().unwrap();
        assert_eq!(stored.outcome, ConfirmationOutcome::Confirmed);
    }

    #[test]
    fn replied_resolution_keeps_the_text() {
        let (_, store) = store();
        let record = create_pending(&store, 120);
        let resolved = store
            .resolve(
                &record.correlation_id,
                ConfirmationOutcome::Replied,
                Some("ship it".to_string()),
            )
            .unwrap()
            .unwrap();
        assert_eq!(resolved.reply.as_deref(), Some("ship it"));
        assert!(resolved.completed_at.is_some());
    }

    #[test]
    fn duplicate_correlation_is_a_conflict() {
        let (_, store) = store();
        let id = CorrelationId::from("fixed");
        store
            .create(
                Some(id.clone()),
                EndpointId::from("ep1"),
                ChatId::from("1"),
                "x",
                10,
            )
            .unwrap();
        assert!(store
            .create(
                Some(id),
                EndpointId::from("ep1"),
                ChatId::from("1"),
                "y",
                10,
            )
            .is_err());
    }

    #[test]
    fn expired_pending_only_returns_past_deadline() {
        let (_, store) = store();
        let expired = create_pending(&store, 0);
        let _live = create_pending(&store, 3600);

        let found = store.expired_pending().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].correlation_id, expired.correlation_id);
    }

    #[test]
    fn replies_queue_appends_and_drains_atomically() {
        let (kv, _) = store();
        let ep = EndpointId::from("ep1");
        queue_reply_line(&kv, &ep, &serde_json::json!({"type": "feedback", "text": "a"})).unwrap();
        queue_reply_line(&kv, &ep, &serde_json::json!({"type": "feedback", "text": "b"})).unwrap();

        let drained = drain_replies(&kv, &ep).unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["text"], "a");

        assert!(drain_replies(&kv, &ep).unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweeper_times_out_expired_records_and_emits() {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(Arc::clone(&kv)));
        let store = Arc::new(ConfirmationStore::new(Arc::clone(&kv)));

        let record = store
            .create(
                None,
                EndpointId::from("ep1"),
                ChatId::from("1"),
                "deploy?",
                0,
            )
            .unwrap();

        let mut events = bus.subscribe(&topics::mcp_events("ep1"));

        let cancel = CancellationToken::new();
        tokio::spawn(run_sweeper(
            Arc::clone(&store),
            Arc::clone(&bus),
            cancel.clone(),
        ));

        let env = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("sweeper never emitted")
            .unwrap();
        cancel.cancel();

        let Payload::ConfirmationResult(result) = env.payload else {
            panic!("expected confirmation result");
        };
        assert_eq!(result.outcome, "timeout");
        assert_eq!(result.correlation_id, record.correlation_id);

        // Record is resolved; later clicks are ignored.
        let late = store
            .resolve(&record.correlation_id, ConfirmationOutcome::Confirmed, None)
            .unwrap();
        assert!(late.is_none());

        // The resolution is also queued for late /replies drains.
        let queued = drain_replies(&kv, &EndpointId::from("ep1")).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0]["outcome"], "timeout");
    }
}
