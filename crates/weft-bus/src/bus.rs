//! Pub/sub half of the bus.
//!
//! Topics are lazily-created tokio broadcast channels. Delivery is
//! at-most-once: there is no replay for late joiners and a slow consumer
//! that overruns the channel capacity observes a gap instead of the missed
//! envelopes. Consumers must be idempotent on retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use weft_core::{Result, WeftError};

use crate::envelope::Envelope;
use crate::kv::Kv;

/// Per-topic buffer. A consumer further behind than this sees a gap.
const TOPIC_CAPACITY: usize = 256;
/// Publish retry schedule when the durable side is unavailable; the sum
/// stays inside the 5 s budget the failure model allows.
const PUBLISH_BACKOFF_MS: [u64; 4] = [100, 400, 1200, 3000];

/// The shared envelope fabric: topic pub/sub plus the durable KV store.
pub struct Bus {
    topics: DashMap<String, broadcast::Sender<Envelope>>,
    kv: Arc<Kv>,
}

impl Bus {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self {
            topics: DashMap::new(),
            kv,
        }
    }

    pub fn kv(&self) -> &Kv {
        &self.kv
    }

    pub fn kv_arc(&self) -> Arc<Kv> {
        Arc::clone(&self.kv)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Broadcast an envelope to all current subscribers on `topic`.
    ///
    /// No acknowledgment; publishing to a topic with no subscribers is not
    /// an error. The envelope is validated (size cap, redaction) before the
    /// send so every subscriber sees the same redacted wire form.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        // encode() enforces the size cap and applies redaction; the broadcast
        // carries the redacted envelope itself so in-process consumers never
        // see an unredacted form either.
        envelope.encode()?;
        let redacted = envelope.redacted();

        debug!(topic, kind = redacted.kind(), seq = redacted.seq, "publish");
        let _ = self.sender(topic).send(redacted);
        Ok(())
    }

    /// Publish, retrying with backoff while the durable side is down.
    ///
    /// Used on paths that must not drop envelopes silently (finalization,
    /// confirmation results). Gives up after ~5 s and surfaces
    /// `BusUnavailable` so the caller can fail its task.
    pub async fn publish_with_retry(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let mut last_err: Option<WeftError> = None;
        for (attempt, backoff_ms) in PUBLISH_BACKOFF_MS.iter().enumerate() {
            match self.publish(topic, envelope.clone()) {
                Ok(()) => return Ok(()),
                // Size violations will not improve with retries.
                Err(e @ WeftError::EnvelopeTooLarge { .. }) => return Err(e),
                Err(e) => {
                    warn!(topic, attempt, error = %e, "publish failed, backing off");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| WeftError::BusUnavailable(topic.to_string())))
    }

    /// Subscribe to a topic. Delivery starts with the next publish; there is
    /// no replay of past envelopes.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            rx: self.sender(topic).subscribe(),
        }
    }
}

/// Errors a subscription can surface.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The consumer fell behind and `missed` envelopes were dropped.
    /// Consumers tracking a task must treat this as data loss for that task.
    #[error("subscription gap: missed {missed} envelopes on {topic}")]
    Gap { topic: String, missed: u64 },

    #[error("topic {topic} closed")]
    Closed { topic: String },
}

pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next envelope. A `Gap` is returned once per overrun; the
    /// subscription remains usable afterwards, positioned at the oldest
    /// retained envelope.
    pub async fn recv(&mut self) -> std::result::Result<Envelope, SubscribeError> {
        match self.rx.recv().await {
            Ok(env) => Ok(env),
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(SubscribeError::Gap {
                topic: self.topic.clone(),
                missed,
            }),
            Err(broadcast::error::RecvError::Closed) => Err(SubscribeError::Closed {
                topic: self.topic.clone(),
            }),
        }
    }
}
