//! Telegram channel adapter.
//!
//! Two halves run side by side: the teloxide Dispatcher drives ingress
//! (messages and confirm/reject callbacks), and the bus consumer renders
//! outbound traffic — stream tokens into one live-edited message per task,
//! final replies, and confirmation prompts with inline controls.

use std::sync::Arc;
use std::time::Instant;

use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_bus::bus::SubscribeError;
use weft_bus::envelope::{topics, Envelope, Payload};
use weft_bus::Bus;
use weft_core::config::ConfigHandle;

use crate::format::{render_markdown_v2, split_chunks, strip_think};
use crate::handler::{handle_callback, handle_message, register_intent, AdapterState};
use crate::stream::{StreamAction, INTERNAL_ERROR_TEXT, INTERRUPTED_SUFFIX};

pub struct TelegramAdapter {
    bot: Bot,
    state: Arc<AdapterState>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, bus: Arc<Bus>, config: ConfigHandle) -> Self {
        Self {
            bot: Bot::new(bot_token),
            state: Arc::new(AdapterState::new(bus, config)),
        }
    }

    /// Drive long polling and the bus consumer until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let consumer = tokio::spawn(run_bus_consumer(
            self.bot.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
        ));

        info!("telegram: starting long-polling dispatcher");
        let handler = dptree::entry()
            .branch(Update::filter_message().endpoint(handle_message))
            .branch(Update::filter_callback_query().endpoint(handle_callback));

        let mut dispatcher = Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![Arc::clone(&self.state)])
            .default_handler(|_upd| async {})
            .build();

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = dispatcher.dispatch() => {}
        }

        consumer.abort();
        info!("telegram adapter stopped");
    }
}

/// Render bus traffic into Telegram calls.
async fn run_bus_consumer(bot: Bot, state: Arc<AdapterState>, cancel: CancellationToken) {
    let mut stream_sub = state.bus.subscribe(topics::STREAM_TOKEN);
    let mut reply_sub = state.bus.subscribe(topics::OUTGOING_REPLY);
    let mut confirm_sub = state.bus.subscribe(topics::CONFIRMATION_REQUEST);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream_sub.recv() => match msg {
                Ok(env) => handle_stream_token(&bot, &state, env).await,
                Err(SubscribeError::Gap { missed, .. }) => {
                    warn!(missed, "stream gap, finalizing live messages with error text");
                    apply_gap(&bot, &state).await;
                }
                Err(SubscribeError::Closed { .. }) => break,
            },
            msg = reply_sub.recv() => match msg {
                Ok(env) => handle_outgoing_reply(&bot, &state, env).await,
                Err(SubscribeError::Gap { missed, .. }) => {
                    warn!(missed, "reply gap, finalizing live messages with error text");
                    apply_gap(&bot, &state).await;
                }
                Err(SubscribeError::Closed { .. }) => break,
            },
            msg = confirm_sub.recv() => match msg {
                Ok(env) => handle_confirmation_request(&bot, &state, env).await,
                Err(SubscribeError::Gap { missed, .. }) => {
                    warn!(missed, "confirmation prompts lost");
                }
                Err(SubscribeError::Closed { .. }) => break,
            },
        }
    }
}

fn parse_chat(raw: &str) -> Option<ChatId> {
    match raw.parse::<i64>() {
        Ok(id) => Some(ChatId(id)),
        Err(_) => {
            warn!(chat_id = raw, "non-numeric chat id, skipping");
            None
        }
    }
}

async fn handle_stream_token(bot: &Bot, state: &AdapterState, env: Envelope) {
    if env.channel.as_str() != "telegram" {
        return;
    }
    let Some(task_id) = env.task_id.clone() else {
        return;
    };
    let Payload::StreamToken(token) = env.payload else {
        return;
    };
    let Some(chat) = parse_chat(token.chat_id.as_str()) else {
        return;
    };

    let interrupted = token
        .extra
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let action = state.tracker.on_token(
        task_id.as_str(),
        chat.0,
        env.seq,
        &token.token,
        token.done,
        interrupted,
        Instant::now(),
    );
    apply_stream_action(bot, state, task_id.as_str(), chat, action).await;
}

async fn handle_outgoing_reply(bot: &Bot, state: &AdapterState, env: Envelope) {
    if env.channel.as_str() != "telegram" {
        return;
    }
    let Payload::OutgoingReply(reply) = env.payload else {
        return;
    };
    let Some(chat) = parse_chat(reply.chat_id.as_str()) else {
        return;
    };

    let mut text = reply.text.clone();
    if reply
        .extra
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        text.push_str(INTERRUPTED_SUFFIX);
    }

    match env.task_id {
        // Final sync for a task: replaces the live message if one exists.
        Some(task_id) => {
            let action = state.tracker.on_final_reply(task_id.as_str(), &text);
            apply_stream_action(bot, state, task_id.as_str(), chat, action).await;
        }
        // Broadcast delivery (MCP notify/question) — plain send.
        None => send_rendered(bot, chat, &text).await,
    }
}

async fn handle_confirmation_request(bot: &Bot, state: &AdapterState, env: Envelope) {
    if env.channel.as_str() != "telegram" {
        return;
    }
    let Payload::ConfirmationRequest(req) = env.payload else {
        return;
    };
    let Some(chat) = parse_chat(req.chat_id.as_str()) else {
        return;
    };

    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Confirm", format!("confirm:{}", req.correlation_id)),
        InlineKeyboardButton::callback("❌ Reject", format!("reject:{}", req.correlation_id)),
    ]]);

    match bot
        .send_message(chat, &req.message)
        .reply_markup(keyboard)
        .await
    {
        Ok(_) => {
            // A plain text reply inside the grace window resolves the record
            // as `replied`.
            register_intent(state, chat.0, req.correlation_id, req.endpoint_id);
        }
        Err(e) => warn!(error = %e, "confirmation prompt send failed"),
    }
}

async fn apply_stream_action(
    bot: &Bot,
    state: &AdapterState,
    task_id: &str,
    chat: ChatId,
    action: StreamAction,
) {
    match action {
        StreamAction::None => {}
        StreamAction::Start { text } => match bot.send_message(chat, &text).await {
            Ok(sent) => state.tracker.attach_message(task_id, sent.id.0),
            Err(e) => warn!(error = %e, "live message create failed"),
        },
        StreamAction::Edit { message_id, text } => {
            if let Err(e) = bot
                .edit_message_text(chat, MessageId(message_id), &text)
                .await
            {
                debug!(error = %e, "live edit failed");
            }
        }
        StreamAction::Finalize { message_id, text } => {
            deliver_final(bot, chat, message_id, &text).await;
        }
    }
}

/// Final rendering: strip think blocks, convert the Markdown subset, and
/// segment at the platform limit. The first segment edits the live message
/// when one exists; the rest go out as fresh messages.
async fn deliver_final(bot: &Bot, chat: ChatId, message_id: Option<i32>, text: &str) {
    let clean = strip_think(text);
    let chunks = split_chunks(&clean);
    let mut chunks = chunks.iter();

    if let Some(first) = chunks.next() {
        let rendered = render_markdown_v2(first);
        match message_id {
            Some(id) => {
                let edited = bot
                    .edit_message_text(chat, MessageId(id), &rendered)
                    .parse_mode(ParseMode::MarkdownV2)
                    .await;
                if edited.is_err() {
                    // MarkdownV2 rejected — plain-text fallback.
                    if let Err(e) = bot.edit_message_text(chat, MessageId(id), first).await {
                        debug!(error = %e, "final edit failed");
                    }
                }
            }
            None => send_chunk(bot, chat, first, &rendered).await,
        }
    }

    for chunk in chunks {
        let rendered = render_markdown_v2(chunk);
        send_chunk(bot, chat, chunk, &rendered).await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

async fn send_rendered(bot: &Bot, chat: ChatId, text: &str) {
    let clean = strip_think(text);
    for (i, chunk) in split_chunks(&clean).iter().enumerate() {
        let rendered = render_markdown_v2(chunk);
        send_chunk(bot, chat, chunk, &rendered).await;
        if i > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

/// Try MarkdownV2 first; fall back to plain text when Telegram rejects the
/// parse mode.
async fn send_chunk(bot: &Bot, chat: ChatId, plain: &str, rendered: &str) {
    let sent = bot
        .send_message(chat, rendered)
        .parse_mode(ParseMode::MarkdownV2)
        .await;
    if sent.is_err() {
        if let Err(e) = bot.send_message(chat, plain).await {
            warn!(error = %e, "plain-text send failed");
        }
    }
}

/// Replace every orphaned live message with the localized error text. The
/// task record itself is failed by its owner, never by the adapter.
async fn apply_gap(bot: &Bot, state: &AdapterState) {
    for orphan in state.tracker.on_gap() {
        let chat = ChatId(orphan.chat_id);
        match orphan.message_id {
            Some(id) => {
                if let Err(e) = bot
                    .edit_message_text(chat, MessageId(id), INTERNAL_ERROR_TEXT)
                    .await
                {
                    debug!(error = %e, "gap cleanup edit failed");
                }
            }
            None => {
                if let Err(e) = bot.send_message(chat, INTERNAL_ERROR_TEXT).await {
                    debug!(error = %e, "gap cleanup send failed");
                }
            }
        }
    }
}
