//! Ingress pipeline for the Telegram adapter.
//!
//! Order of gates for every message: bot filter → allow-list (with the
//! `/start` pairing handshake) → token-bucket rate limit → `/dev` feedback
//! routing → confirmation grace-window reply routing → publish
//! `IncomingMessage`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use teloxide::prelude::*;
use tracing::{debug, info, warn};

use weft_bus::envelope::{
    topics, ConfirmationResult, Envelope, FeedbackMessage, IncomingMessage, Payload,
};
use weft_bus::ratelimit::RateLimiter;
use weft_bus::Bus;
use weft_core::config::ConfigHandle;
use weft_core::types::{ChannelTag, ChatId, CorrelationId, EndpointId, UserId};

use crate::allow::is_allowed;
use crate::stream::StreamTracker;

/// How long after a confirmation prompt a plain text reply from the same
/// chat is routed to the pending record instead of starting a task.
pub const REPLY_GRACE_WINDOW: Duration = Duration::from_secs(60);

/// A posted confirmation waiting for a possible free-form reply.
pub struct PendingIntent {
    pub correlation_id: CorrelationId,
    pub endpoint_id: EndpointId,
    pub expires_at: Instant,
}

pub struct AdapterState {
    pub bus: Arc<Bus>,
    pub config: ConfigHandle,
    /// chat id → pending confirmation intent (grace window).
    pub intents: DashMap<String, PendingIntent>,
    pub tracker: StreamTracker,
}

impl AdapterState {
    pub fn new(bus: Arc<Bus>, config: ConfigHandle) -> Self {
        Self {
            bus,
            config,
            intents: DashMap::new(),
            tracker: StreamTracker::new(),
        }
    }
}

/// What an incoming text turns into, before any bus traffic happens.
#[derive(Debug, PartialEq)]
pub enum MessageKind<'a> {
    /// `/start` — pairing handshake.
    Start,
    /// `/dev <rest>` — tenant feedback.
    Dev(&'a str),
    /// Anything else — a task trigger.
    Normal(&'a str),
}

pub fn classify_message(text: &str) -> MessageKind<'_> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("/start") {
        return MessageKind::Start;
    }
    if let Some(rest) = trimmed.strip_prefix("/dev ") {
        return MessageKind::Dev(rest.trim());
    }
    MessageKind::Normal(trimmed)
}

/// Parse a confirmation button payload (`confirm:<id>` / `reject:<id>`).
pub fn parse_callback(data: &str) -> Option<(&'static str, CorrelationId)> {
    if let Some(id) = data.strip_prefix("confirm:") {
        return Some(("confirmed", CorrelationId::from(id)));
    }
    if let Some(id) = data.strip_prefix("reject:") {
        return Some(("rejected", CorrelationId::from(id)));
    }
    None
}

/// Main message handler registered in the teloxide Dispatcher.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    state: Arc<AdapterState>,
) -> ResponseResult<()> {
    // Ignore other bots.
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = from.id.0;
    let chat_id = msg.chat.id.0;
    let kind = classify_message(text);

    // Allow-list, deny-by-default. Pairing mode admits /start senders.
    let hot = state.config.hot();
    if !is_allowed(&hot.allowed_user_ids, user_id) {
        let pairing = state
            .config
            .snapshot()
            .telegram
            .as_ref()
            .map(|t| t.pairing_mode)
            .unwrap_or(false);
        if pairing && kind == MessageKind::Start {
            pair_user(&state, user_id);
            let _ = bot
                .send_message(msg.chat.id, "Paired. You can talk to me now.")
                .await;
        }
        return Ok(());
    }

    // Rate limit before anything reaches the bus; a drained bucket drops
    // the event with only a log line.
    let snapshot = state.config.snapshot();
    let limiter = RateLimiter::new(state.bus.kv(), snapshot.rate_limit.clone());
    match limiter.try_acquire(&user_id.to_string()) {
        Ok(true) => {}
        Ok(false) => {
            debug!(user_id, "rate limited, dropping message");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "rate limiter unavailable, dropping message");
            return Ok(());
        }
    }

    match kind {
        MessageKind::Start => {
            let _ = bot.send_message(msg.chat.id, "Ready.").await;
        }
        MessageKind::Dev(feedback) => {
            let publish = state.bus.publish(
                topics::FEEDBACK,
                Envelope::broadcast(
                    ChannelTag::telegram(),
                    Payload::FeedbackMessage(FeedbackMessage {
                        endpoint_id: EndpointId::from(""),
                        chat_id: ChatId::from(chat_id),
                        text: feedback.to_string(),
                        extra: Default::default(),
                    }),
                ),
            );
            if let Err(e) = publish {
                warn!(error = %e, "feedback publish failed");
            }
        }
        MessageKind::Normal(body) => {
            // A plain reply inside the grace window resolves the pending
            // confirmation instead of starting a task.
            if let Some(intent) = take_live_intent(&state, chat_id) {
                publish_resolution(&state, &intent, "replied", Some(body.to_string()));
                return Ok(());
            }

            let publish = state.bus.publish(
                topics::INCOMING,
                Envelope::broadcast(
                    ChannelTag::telegram(),
                    Payload::IncomingMessage(IncomingMessage {
                        message_id: msg.id.0.to_string(),
                        user_id: UserId::from(user_id.to_string()),
                        chat_id: ChatId::from(chat_id),
                        text: body.to_string(),
                        reasoning_requested: None,
                        reply_to: None,
                        extra: Default::default(),
                    }),
                ),
            );
            if let Err(e) = publish {
                warn!(error = %e, "incoming publish failed");
                let _ = bot
                    .send_message(msg.chat.id, "Something went wrong on our side. Please try again.")
                    .await;
            }
        }
    }

    Ok(())
}

/// Confirm/reject button handler.
pub async fn handle_callback(
    bot: Bot,
    query: CallbackQuery,
    state: Arc<AdapterState>,
) -> ResponseResult<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some((outcome, correlation_id)) = parse_callback(data) else {
        return Ok(());
    };

    // The intent (if registered for this chat) carries the tenant.
    let endpoint_id = query
        .message
        .as_ref()
        .map(|m| m.chat().id.0)
        .and_then(|chat| {
            state
                .intents
                .remove(&chat.to_string())
                .map(|(_, intent)| intent.endpoint_id)
        })
        .unwrap_or_else(|| EndpointId::from(""));

    let intent = PendingIntent {
        correlation_id,
        endpoint_id,
        expires_at: Instant::now(),
    };
    publish_resolution(&state, &intent, outcome, None);

    let ack = if outcome == "confirmed" { "Confirmed" } else { "Rejected" };
    let _ = bot.answer_callback_query(query.id).text(ack).await;
    Ok(())
}

/// Register the grace-window intent when a confirmation prompt is posted.
pub fn register_intent(
    state: &AdapterState,
    chat_id: i64,
    correlation_id: CorrelationId,
    endpoint_id: EndpointId,
) {
    state.intents.insert(
        chat_id.to_string(),
        PendingIntent {
            correlation_id,
            endpoint_id,
            expires_at: Instant::now() + REPLY_GRACE_WINDOW,
        },
    );
}

fn take_live_intent(state: &AdapterState, chat_id: i64) -> Option<PendingIntent> {
    let (_, intent) = state.intents.remove(&chat_id.to_string())?;
    if intent.expires_at < Instant::now() {
        return None;
    }
    Some(intent)
}

/// Publish a resolution attempt. The MCP engine (tenant records) or the
/// orchestrator (its own confirmation rounds) picks it up by correlation.
fn publish_resolution(
    state: &AdapterState,
    intent: &PendingIntent,
    outcome: &str,
    reply: Option<String>,
) {
    let publish = state.bus.publish(
        topics::CONFIRMATION_RESULT,
        Envelope::broadcast(
            ChannelTag::telegram(),
            Payload::ConfirmationResult(ConfirmationResult {
                endpoint_id: intent.endpoint_id.clone(),
                correlation_id: intent.correlation_id.clone(),
                outcome: outcome.to_string(),
                reply,
                extra: Default::default(),
            }),
        ),
    );
    match publish {
        Ok(()) => debug!(correlation = %intent.correlation_id, outcome, "resolution published"),
        Err(e) => warn!(error = %e, "resolution publish failed"),
    }
}

/// Admit a user via the pairing handshake: persist the updated allow-list
/// and publish the hot-config change.
fn pair_user(state: &AdapterState, user_id: u64) {
    let mut hot = state.config.hot();
    if hot.allowed_user_ids.contains(&user_id) {
        return;
    }
    hot.allowed_user_ids.push(user_id);

    let serialized = hot
        .allowed_user_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    if let Err(e) = state
        .bus
        .kv()
        .set("config:telegram.allowed_user_ids", &serialized)
    {
        warn!(error = %e, "pairing persistence failed");
    }
    state.config.publish_hot(hot);
    info!(user_id, "user paired");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_start_dev_and_normal() {
        assert_eq!(classify_message("/start"), MessageKind::Start);
        assert_eq!(classify_message("/dev too slow"), MessageKind::Dev("too slow"));
        assert_eq!(classify_message("hello"), MessageKind::Normal("hello"));
        // "/dev" without a space is a normal message, not feedback.
        assert_eq!(classify_message("/dev"), MessageKind::Normal("/dev"));
    }

    #[test]
    fn parse_callback_payloads() {
        let (outcome, id) = parse_callback("confirm:abc").unwrap();
        assert_eq!(outcome, "confirmed");
        assert_eq!(id.as_str(), "abc");

        let (outcome, _) = parse_callback("reject:abc").unwrap();
        assert_eq!(outcome, "rejected");

        assert!(parse_callback("something:else").is_none());
    }

    #[test]
    fn intents_expire_after_grace_window() {
        let kv = Arc::new(weft_bus::Kv::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(kv));
        let config = ConfigHandle::new(weft_core::config::WeftConfig {
            orchestrator: Default::default(),
            model: Default::default(),
            memory: Default::default(),
            sandbox: Default::default(),
            telegram: None,
            rate_limit: Default::default(),
            mcp: Default::default(),
            database: Default::default(),
        });
        let state = AdapterState::new(bus, config);

        register_intent(&state, 7, "c1".into(), "ep1".into());
        // Force expiry.
        state.intents.get_mut("7").unwrap().expires_at =
            Instant::now() - Duration::from_secs(1);
        assert!(take_live_intent(&state, 7).is_none());

        register_intent(&state, 7, "c2".into(), "ep1".into());
        let intent = take_live_intent(&state, 7).unwrap();
        assert_eq!(intent.correlation_id.as_str(), "c2");
        // Consumed: a second take finds nothing.
        assert!(take_live_intent(&state, 7).is_none());
    }
}
