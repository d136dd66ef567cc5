//! Bus-side half of the MCP gateway.
//!
//! Listens for resolution attempts published by channel adapters (button
//! callbacks, grace-window replies) and for `/dev` feedback, and turns them
//! into record resolutions, tenant event-topic envelopes, and queued reply
//! lines. Attempts whose correlation has no record belong to the
//! orchestrator's own confirmation rounds and are ignored here.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_bus::bus::SubscribeError;
use weft_bus::envelope::{topics, Envelope, FeedbackMessage, Payload};
use weft_bus::Bus;

use crate::confirm::{
    emit_resolution, queue_reply_line, ConfirmationOutcome, ConfirmationStore,
};
use crate::endpoints::EndpointStore;

pub struct McpEngine {
    bus: Arc<Bus>,
    endpoints: Arc<EndpointStore>,
    confirmations: Arc<ConfirmationStore>,
}

impl McpEngine {
    pub fn new(
        bus: Arc<Bus>,
        endpoints: Arc<EndpointStore>,
        confirmations: Arc<ConfirmationStore>,
    ) -> Self {
        Self {
            bus,
            endpoints,
            confirmations,
        }
    }

    /// Subscribe eagerly, then spawn the consume loop, so resolution
    /// attempts published right after startup are never lost to an
    /// unpolled future.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let resolutions = self.bus.subscribe(topics::CONFIRMATION_RESULT);
        let feedback = self.bus.subscribe(topics::FEEDBACK);
        tokio::spawn(self.run(resolutions, feedback, cancel))
    }

    async fn run(
        self: Arc<Self>,
        mut resolutions: weft_bus::Subscription,
        mut feedback: weft_bus::Subscription,
        cancel: CancellationToken,
    ) {
        info!("mcp engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = resolutions.recv() => match msg {
                    Ok(env) => self.handle_resolution_attempt(env),
                    Err(SubscribeError::Gap { missed, .. }) => {
                        // Missed attempts are recovered by the sweeper: the
                        // records time out instead of resolving.
                        warn!(missed, "confirmation attempts lost, sweeper will time them out");
                    }
                    Err(SubscribeError::Closed { .. }) => break,
                },
                msg = feedback.recv() => match msg {
                    Ok(env) => self.handle_feedback(env),
                    Err(SubscribeError::Gap { missed, .. }) => {
                        warn!(missed, "feedback messages lost");
                    }
                    Err(SubscribeError::Closed { .. }) => break,
                },
            }
        }
        info!("mcp engine stopped");
    }

    fn handle_resolution_attempt(&self, env: Envelope) {
        let Payload::ConfirmationResult(attempt) = env.payload else {
            return;
        };
        let Ok(outcome) = attempt.outcome.parse::<ConfirmationOutcome>() else {
            warn!(outcome = %attempt.outcome, "unparseable resolution outcome");
            return;
        };

        match self
            .confirmations
            .resolve(&attempt.correlation_id, outcome, attempt.reply.clone())
        {
            Ok(Some(record)) => {
                if let Err(e) = emit_resolution(&self.bus, &record) {
                    warn!(correlation = %record.correlation_id, error = %e, "resolution emit failed");
                }
            }
            Ok(None) => {
                // Already resolved, or an orchestrator-owned correlation.
                debug!(correlation = %attempt.correlation_id, "resolution attempt ignored");
            }
            Err(e) => {
                warn!(correlation = %attempt.correlation_id, error = %e, "resolution failed");
            }
        }
    }

    /// Route `/dev` feedback to the matching tenant: the adapter only knows
    /// the chat, so the oldest live endpoint for that chat wins.
    fn handle_feedback(&self, env: Envelope) {
        let Payload::FeedbackMessage(msg) = env.payload else {
            return;
        };

        let endpoint = match self.resolve_tenant(&msg) {
            Some(ep) => ep,
            None => {
                debug!(chat_id = %msg.chat_id, "feedback with no matching tenant, dropped");
                return;
            }
        };

        let line = serde_json::json!({
            "type": "feedback",
            "chat_id": msg.chat_id,
            "text": msg.text,
        });
        if let Err(e) = queue_reply_line(self.bus.kv(), &endpoint.id, &line) {
            warn!(endpoint_id = %endpoint.id, error = %e, "feedback queue write failed");
            return;
        }

        // Live SSE listeners get the event inline.
        let publish = self.bus.publish(
            &topics::mcp_events(endpoint.id.as_str()),
            Envelope::broadcast(
                "mcp".into(),
                Payload::FeedbackMessage(FeedbackMessage {
                    endpoint_id: endpoint.id.clone(),
                    chat_id: msg.chat_id.clone(),
                    text: msg.text.clone(),
                    extra: Default::default(),
                }),
            ),
        );
        if let Err(e) = publish {
            warn!(endpoint_id = %endpoint.id, error = %e, "feedback event publish failed");
        }
    }

    fn resolve_tenant(&self, msg: &FeedbackMessage) -> Option<crate::endpoints::McpEndpoint> {
        // An explicit tenant on the envelope wins; otherwise infer by chat.
        if !msg.endpoint_id.as_str().is_empty() {
            if let Ok(Some(ep)) = self.endpoints.get(&msg.endpoint_id) {
                if !ep.revoked {
                    return Some(ep);
                }
            }
        }
        self.endpoints.oldest_for_chat(&msg.chat_id).ok().flatten()
    }
}
