//! The deterministic task controller.
//!
//! One orchestrator instance owns a task from ingress to reply. Ownership is
//! a SETNX claim on the task record; losing the claim means another worker
//! took over and this one must stop touching the task. Within a task, model
//! calls and tool dispatches are strictly sequential — no two iterations
//! ever overlap.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_agent::{AssistantAgent, GatewayError, ModelTurn, TaskContext, TurnEvent};
use weft_bus::bus::{SubscribeError, Subscription};
use weft_bus::envelope::{
    topics, ConfirmationRequest, Envelope, OutgoingReply, Payload, StreamToken, ToolRequest,
    ToolResult,
};
use weft_bus::Bus;
use weft_core::config::ConfigHandle;
use weft_core::types::{ChannelTag, ChatId, CorrelationId, EndpointId, Role, TaskId};
use weft_core::{Result, WeftError};
use weft_skills::{AuditEntry, AuditLog, SkillRegistry};
use weft_tasks::{Task, TaskStatus, TaskStore};

use crate::context::{build_context, CONFIRM_SKILL};

/// Default deadline for a user confirmation requested by the model.
const CONFIRM_DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Slack added on top of the sandbox timeout when waiting for a ToolResult:
/// covers dispatcher scheduling and the result publish itself.
const TOOL_WAIT_MARGIN_SECS: u64 = 15;

/// Outcome of one model turn, normalized across the streaming and
/// non-streaming paths. The tool call wins when both text and a call appear.
enum TurnOutcome {
    Text {
        body: String,
        quality: Option<f32>,
        interrupted: bool,
    },
    Tool {
        name: String,
        arguments: Value,
    },
}

pub struct Orchestrator {
    worker_id: String,
    bus: Arc<Bus>,
    tasks: Arc<TaskStore>,
    assistant: Arc<AssistantAgent>,
    registry: Arc<SkillRegistry>,
    audit: Arc<AuditLog>,
    config: ConfigHandle,
}

impl Orchestrator {
    pub fn new(
        worker_id: impl Into<String>,
        bus: Arc<Bus>,
        tasks: Arc<TaskStore>,
        assistant: Arc<AssistantAgent>,
        registry: Arc<SkillRegistry>,
        audit: Arc<AuditLog>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            bus,
            tasks,
            assistant,
            registry,
            audit,
            config,
        }
    }

    /// Subscribe to ingress and spawn the consume loop. The subscription is
    /// taken before spawning so messages published right after this call
    /// are never lost to an unpolled future.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let sub = self.bus.subscribe(topics::INCOMING);
        tokio::spawn(self.run(sub, cancel))
    }

    /// Consume `assistant:incoming` until cancelled. Each message is handled
    /// in its own task so a slow model call never blocks ingress.
    async fn run(self: Arc<Self>, mut sub: Subscription, cancel: CancellationToken) {
        info!(worker = %self.worker_id, "orchestrator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = sub.recv() => match msg {
                    Ok(env) => {
                        let channel = env.channel.clone();
                        if let Payload::IncomingMessage(incoming) = env.payload {
                            let this = Arc::clone(&self);
                            let child = cancel.child_token();
                            tokio::spawn(async move {
                                this.handle_incoming(channel, incoming, child).await;
                            });
                        }
                    }
                    Err(SubscribeError::Gap { missed, .. }) => {
                        // Lost ingress envelopes have no task yet — nothing to
                        // fail, but the senders will not be answered.
                        warn!(missed, "ingress gap: dropped incoming messages");
                    }
                    Err(SubscribeError::Closed { .. }) => break,
                }
            }
        }
        info!(worker = %self.worker_id, "orchestrator stopped");
    }

    async fn handle_incoming(
        &self,
        channel: ChannelTag,
        incoming: weft_bus::envelope::IncomingMessage,
        cancel: CancellationToken,
    ) {
        // Deterministic id: every core process derives the same task for the
        // same message, so the claim below is what arbitrates ownership.
        let task_id = TaskId::from(format!(
            "{}:{}:{}",
            channel, incoming.chat_id, incoming.message_id
        ));
        let chat_id = incoming.chat_id.clone();

        match self.setup_task(&task_id, &channel, &incoming) {
            Ok(true) => {}
            Ok(false) => return, // another worker owns it — drop silently
            Err(e) => {
                error!(task_id = %task_id, error = %e, "task setup failed");
                self.fail_task(&task_id, &chat_id, &channel, &e).await;
                return;
            }
        }

        let deadline =
            Duration::from_secs(self.config.snapshot().orchestrator.task_deadline_secs);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(WeftError::Internal("shutting down".to_string())),
            res = tokio::time::timeout(deadline, self.run_task(&task_id, &chat_id, &channel)) => {
                match res {
                    Ok(r) => r,
                    Err(_) => Err(WeftError::Timeout { ms: deadline.as_millis() as u64 }),
                }
            }
        };

        if let Err(e) = outcome {
            error!(task_id = %task_id, error = %e, "task failed");
            self.fail_task(&task_id, &chat_id, &channel, &e).await;
        }
    }

    /// Create, claim, and start the task. `Ok(false)` means another worker
    /// owns it.
    fn setup_task(
        &self,
        task_id: &TaskId,
        channel: &ChannelTag,
        incoming: &weft_bus::envelope::IncomingMessage,
    ) -> Result<bool> {
        let task = Task::new(
            task_id.clone(),
            incoming.user_id.clone(),
            channel.clone(),
            incoming.chat_id.clone(),
            incoming.message_id.clone(),
        );
        // A collision means a sibling process created it first; the claim
        // decides who proceeds.
        let _ = self.tasks.create(&task);

        if !self.tasks.claim_default(task_id, &self.worker_id)? {
            debug!(task_id = %task_id, "claim lost, dropping");
            return Ok(false);
        }

        let window_limit = self.config.snapshot().memory.short_term_window;
        self.tasks
            .append_message(task_id, Role::User, &incoming.text, window_limit)?;

        if !self
            .tasks
            .transition(task_id, TaskStatus::Pending, TaskStatus::Running, |_| {})?
        {
            // Already progressed (stale duplicate) — nothing to do.
            self.tasks.release_claim(task_id, &self.worker_id)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// The autonomous loop (§state machine): model turn, then tool /
    /// confirmation round trips, until a final text or a stop condition.
    async fn run_task(&self, task_id: &TaskId, chat_id: &ChatId, channel: &ChannelTag) -> Result<()> {
        let snapshot = self.config.snapshot().clone();
        let window_limit = snapshot.memory.short_term_window;
        let mut streamed = false;

        loop {
            // Ownership check each iteration: a lapsed claim means another
            // worker may be driving the task now.
            if !self.tasks.refresh_claim(task_id, &self.worker_id)? {
                warn!(task_id = %task_id, "claim lost mid-task, stopping");
                return Ok(());
            }

            let hot = self.config.hot();
            let Some(task) = self.tasks.get(task_id)? else {
                return Ok(());
            };

            let iteration = task.iterations + 1;
            if iteration > hot.max_iterations {
                info!(task_id = %task_id, "iteration cap reached");
                return self
                    .finalize(
                        task_id,
                        chat_id,
                        channel,
                        "Stopped: iteration limit reached.",
                        streamed,
                        false,
                    )
                    .await;
            }
            self.tasks
                .transition(task_id, TaskStatus::Running, TaskStatus::Running, |t| {
                    t.iterations = iteration;
                })?;

            let ctx = build_context(&task, self.bus.kv(), &self.registry)?;

            let started = std::time::Instant::now();
            let turn_result = if snapshot.model.streaming_enabled {
                streamed = true;
                self.stream_turn(task_id, chat_id, channel, &ctx, &snapshot)
                    .await
            } else {
                match self.assistant.respond(&ctx).await {
                    Ok(ModelTurn::Text { body, quality }) => Ok(TurnOutcome::Text {
                        body,
                        quality,
                        interrupted: false,
                    }),
                    Ok(ModelTurn::ToolCall { name, arguments }) => {
                        Ok(TurnOutcome::Tool { name, arguments })
                    }
                    Err(e) => Err(model_error(e)),
                }
            };
            self.audit_model_call(&task, iteration, &turn_result, started.elapsed().as_millis() as u64);
            let turn = turn_result?;

            match turn {
                TurnOutcome::Tool { name, arguments } => {
                    if !snapshot.orchestrator.autonomous_mode {
                        // Tool loop disabled: surface the request as a
                        // diagnostic instead of executing it.
                        let diagnostic =
                            format!("Tool requested but not executed: {name} {arguments}");
                        return self
                            .finalize(task_id, chat_id, channel, &diagnostic, streamed, false)
                            .await;
                    }

                    let entry = if name == CONFIRM_SKILL {
                        self.confirmation_round(task_id, chat_id, channel, &arguments)
                            .await?
                    } else {
                        self.tool_round(task_id, chat_id, channel, &name, arguments, &snapshot)
                            .await?
                    };
                    self.tasks
                        .append_message(task_id, Role::Tool, &entry, window_limit)?;
                    // Next iteration.
                }
                TurnOutcome::Text {
                    body,
                    quality,
                    interrupted,
                } => {
                    if interrupted {
                        return self
                            .finalize(task_id, chat_id, channel, &body, streamed, true)
                            .await;
                    }
                    self.tasks
                        .append_message(task_id, Role::Assistant, &body, window_limit)?;

                    // Below-threshold self-rating sends the loop around for
                    // another attempt while iterations remain.
                    if let Some(q) = quality {
                        if q < hot.quality_threshold && iteration < hot.max_iterations {
                            debug!(task_id = %task_id, quality = q, "below quality threshold, iterating");
                            continue;
                        }
                    }
                    return self
                        .finalize(task_id, chat_id, channel, &body, streamed, false)
                        .await;
                }
            }
        }
    }

    /// One audit row per model turn, full trace redacted.
    fn audit_model_call(
        &self,
        task: &Task,
        iteration: u32,
        turn: &Result<TurnOutcome>,
        duration_ms: u64,
    ) {
        let outcome = match turn {
            Ok(TurnOutcome::Text { .. }) => "ok:text".to_string(),
            Ok(TurnOutcome::Tool { name, .. }) => format!("ok:tool:{name}"),
            Err(e) => format!("error: {e}"),
        };
        let entry = AuditEntry::new(
            task.user_id.as_str(),
            "model.call",
            task.id.as_str(),
            &json!({ "iteration": iteration }),
        )
        .with_outcome(&outcome, duration_ms);
        if let Err(e) = self.audit.record(&entry) {
            warn!(task_id = %task.id, error = %e, "model-call audit write failed");
        }
    }

    /// Pump one streamed model turn, publishing a `StreamToken` per token in
    /// per-task sequence order. A disconnect after tokens were emitted turns
    /// into an interrupted text outcome; the buffered text is what the user
    /// keeps.
    async fn stream_turn(
        &self,
        task_id: &TaskId,
        chat_id: &ChatId,
        channel: &ChannelTag,
        ctx: &TaskContext,
        snapshot: &weft_core::config::WeftConfig,
    ) -> Result<TurnOutcome> {
        let mut stream = self
            .assistant
            .respond_stream(ctx)
            .await
            .map_err(model_error)?;

        let budget = Duration::from_secs(snapshot.model.stream_timeout_secs);
        let mut text = String::new();
        let mut tool: Option<(String, Value)> = None;
        let mut quality: Option<f32> = None;
        let mut interrupted = false;

        let pump = async {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(TurnEvent::Token(token)) => {
                        text.push_str(&token);
                        // Streaming order is seq order; adapters drop late
                        // tokens, so publish strictly in allocation order.
                        if tool.is_none() {
                            let seq = self.tasks.next_seq(task_id)?;
                            self.bus.publish(
                                topics::STREAM_TOKEN,
                                Envelope::new(
                                    Some(task_id.clone()),
                                    channel.clone(),
                                    seq,
                                    Payload::StreamToken(StreamToken {
                                        chat_id: chat_id.clone(),
                                        token,
                                        done: false,
                                        extra: Default::default(),
                                    }),
                                ),
                            )?;
                        }
                    }
                    Ok(TurnEvent::ToolCall { name, arguments }) => {
                        tool = Some((name, arguments));
                    }
                    Ok(TurnEvent::Done { quality: q }) => {
                        quality = q;
                        break;
                    }
                    Err(GatewayError::Disconnected(reason)) => {
                        warn!(task_id = %task_id, %reason, "model stream disconnected");
                        interrupted = true;
                        break;
                    }
                    Err(e) if !text.is_empty() => {
                        // Tokens already reached the user; finish what we have.
                        warn!(task_id = %task_id, error = %e, "stream error after partial output");
                        interrupted = true;
                        break;
                    }
                    Err(e) => return Err(model_error(e)),
                }
            }
            Ok(())
        };

        // Bind first: the pump future borrows the accumulators above, and
        // the borrow must end before the arms below touch them.
        let pump_result = tokio::time::timeout(budget, pump).await;
        match pump_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(task_id = %task_id, "stream budget exhausted");
                interrupted = true;
            }
        }

        if let Some((name, arguments)) = tool {
            return Ok(TurnOutcome::Tool { name, arguments });
        }
        Ok(TurnOutcome::Text {
            body: text,
            quality,
            interrupted,
        })
    }

    /// One tool round trip: publish the request, wait for the matching
    /// result, and render it as a window entry for the next model turn.
    async fn tool_round(
        &self,
        task_id: &TaskId,
        _chat_id: &ChatId,
        channel: &ChannelTag,
        name: &str,
        arguments: Value,
        snapshot: &weft_core::config::WeftConfig,
    ) -> Result<String> {
        // Subscribe before publishing so the result cannot slip past.
        let mut sub = self.bus.subscribe(topics::TOOL_RESULT);

        let seq = self.tasks.next_seq(task_id)?;
        self.bus.publish(
            topics::TOOL_REQUEST,
            Envelope::new(
                Some(task_id.clone()),
                channel.clone(),
                seq,
                Payload::ToolRequest(ToolRequest {
                    name: name.to_string(),
                    arguments,
                    extra: Default::default(),
                }),
            ),
        )?;
        self.tasks
            .transition(task_id, TaskStatus::Running, TaskStatus::AwaitingTool, |_| {})?;

        let wait = Duration::from_secs(snapshot.sandbox.timeout_secs + TOOL_WAIT_MARGIN_SECS);
        let result = self.wait_tool_result(&mut sub, task_id, name, wait).await?;

        self.tasks
            .transition(task_id, TaskStatus::AwaitingTool, TaskStatus::Running, |_| {})?;

        Ok(render_tool_entry(&result))
    }

    async fn wait_tool_result(
        &self,
        sub: &mut Subscription,
        task_id: &TaskId,
        name: &str,
        wait: Duration,
    ) -> Result<ToolResult> {
        let recv_loop = async {
            loop {
                match sub.recv().await {
                    Ok(env) => {
                        if env.task_id.as_ref() != Some(task_id) {
                            continue;
                        }
                        if let Payload::ToolResult(result) = env.payload {
                            return Ok(result);
                        }
                    }
                    Err(SubscribeError::Gap { missed, .. }) => {
                        return Err(WeftError::SequenceGap {
                            task_id: task_id.to_string(),
                            missed,
                        });
                    }
                    Err(SubscribeError::Closed { topic }) => {
                        return Err(WeftError::BusUnavailable(topic));
                    }
                }
            }
        };

        match tokio::time::timeout(wait, recv_loop).await {
            Ok(result) => result,
            // Skill never answered — surface a timeout result so the model
            // can recover; the loop continues.
            Err(_) => Ok(ToolResult {
                name: name.to_string(),
                ok: false,
                result: Value::Null,
                error: Some("timeout".to_string()),
                extra: Default::default(),
            }),
        }
    }

    /// Confirmation round trip: identical in shape to a tool round, but
    /// correlates over the confirmation topics and treats a deadline expiry
    /// as rejection.
    async fn confirmation_round(
        &self,
        task_id: &TaskId,
        chat_id: &ChatId,
        channel: &ChannelTag,
        arguments: &Value,
    ) -> Result<String> {
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Confirm?")
            .to_string();
        let timeout_secs = arguments
            .get("timeout_sec")
            .and_then(|v| v.as_u64())
            .unwrap_or(CONFIRM_DEFAULT_TIMEOUT_SECS);

        let correlation = CorrelationId::new();
        let deadline_ts =
            (chrono::Utc::now() + chrono::Duration::seconds(timeout_secs as i64)).to_rfc3339();

        let mut sub = self.bus.subscribe(topics::CONFIRMATION_RESULT);

        let seq = self.tasks.next_seq(task_id)?;
        self.bus.publish(
            topics::CONFIRMATION_REQUEST,
            Envelope::new(
                Some(task_id.clone()),
                channel.clone(),
                seq,
                Payload::ConfirmationRequest(ConfirmationRequest {
                    endpoint_id: EndpointId::from("orchestrator"),
                    correlation_id: correlation.clone(),
                    chat_id: chat_id.clone(),
                    message,
                    deadline_ts,
                    extra: Default::default(),
                }),
            ),
        )?;
        self.tasks.transition(
            task_id,
            TaskStatus::Running,
            TaskStatus::AwaitingConfirmation,
            |_| {},
        )?;

        let recv_loop = async {
            loop {
                match sub.recv().await {
                    Ok(env) => {
                        if let Payload::ConfirmationResult(result) = env.payload {
                            if result.correlation_id == correlation {
                                return Ok(result);
                            }
                        }
                    }
                    Err(SubscribeError::Gap { missed, .. }) => {
                        return Err(WeftError::SequenceGap {
                            task_id: task_id.to_string(),
                            missed,
                        });
                    }
                    Err(SubscribeError::Closed { topic }) => {
                        return Err(WeftError::BusUnavailable(topic));
                    }
                }
            }
        };

        let (outcome, reply) =
            match tokio::time::timeout(Duration::from_secs(timeout_secs), recv_loop).await {
                Ok(Ok(result)) => (result.outcome, result.reply),
                Ok(Err(e)) => return Err(e),
                // Deadline expiry is a rejection; the loop continues.
                Err(_) => ("timeout".to_string(), None),
            };

        self.tasks.transition(
            task_id,
            TaskStatus::AwaitingConfirmation,
            TaskStatus::Running,
            |_| {},
        )?;

        let confirmed = outcome == "confirmed";
        let entry = json!({
            "tool": CONFIRM_SKILL,
            "ok": confirmed || outcome == "replied",
            "outcome": if outcome == "timeout" { "rejected" } else { outcome.as_str() },
            "reply": reply,
        });
        Ok(entry.to_string())
    }

    /// Publish the final reply and close the task. When the task streamed,
    /// the terminating `done=true` token goes out first; the reply then
    /// serves as idempotent final sync for the adapter.
    async fn finalize(
        &self,
        task_id: &TaskId,
        chat_id: &ChatId,
        channel: &ChannelTag,
        text: &str,
        streamed: bool,
        interrupted: bool,
    ) -> Result<()> {
        if streamed {
            let mut extra = serde_json::Map::new();
            if interrupted {
                extra.insert("interrupted".to_string(), json!(true));
            }
            let seq = self.tasks.next_seq(task_id)?;
            self.bus.publish(
                topics::STREAM_TOKEN,
                Envelope::new(
                    Some(task_id.clone()),
                    channel.clone(),
                    seq,
                    Payload::StreamToken(StreamToken {
                        chat_id: chat_id.clone(),
                        token: String::new(),
                        done: true,
                        extra,
                    }),
                ),
            )?;
        }

        let mut extra = serde_json::Map::new();
        if interrupted {
            extra.insert("interrupted".to_string(), json!(true));
        }
        let seq = self.tasks.next_seq(task_id)?;
        self.bus
            .publish_with_retry(
                topics::OUTGOING_REPLY,
                Envelope::new(
                    Some(task_id.clone()),
                    channel.clone(),
                    seq,
                    Payload::OutgoingReply(OutgoingReply {
                        chat_id: chat_id.clone(),
                        message_id: None,
                        text: text.to_string(),
                        done: true,
                        extra,
                    }),
                ),
            )
            .await?;

        self.tasks
            .transition(task_id, TaskStatus::Running, TaskStatus::Completed, |_| {})?;
        self.tasks.release_claim(task_id, &self.worker_id)?;
        info!(task_id = %task_id, "task completed");
        Ok(())
    }

    /// Mark the task failed and send the localized, non-technical reply.
    /// Internal detail stays in the logs.
    async fn fail_task(&self, task_id: &TaskId, chat_id: &ChatId, channel: &ChannelTag, err: &WeftError) {
        if let Err(e) = self.tasks.fail(task_id) {
            error!(task_id = %task_id, error = %e, "could not mark task failed");
        }

        let seq = self.tasks.next_seq(task_id).unwrap_or(0);
        let publish = self
            .bus
            .publish_with_retry(
                topics::OUTGOING_REPLY,
                Envelope::new(
                    Some(task_id.clone()),
                    channel.clone(),
                    seq,
                    Payload::OutgoingReply(OutgoingReply {
                        chat_id: chat_id.clone(),
                        message_id: None,
                        text: err.user_message().to_string(),
                        done: true,
                        extra: Default::default(),
                    }),
                ),
            )
            .await;
        if let Err(e) = publish {
            error!(task_id = %task_id, error = %e, "could not deliver failure reply");
        }
        let _ = self.tasks.release_claim(task_id, &self.worker_id);
    }
}

fn model_error(e: GatewayError) -> WeftError {
    WeftError::Model(e.to_string())
}

/// Render a tool result as the window entry the model sees next turn.
fn render_tool_entry(result: &ToolResult) -> String {
    json!({
        "tool": result.name,
        "ok": result.ok,
        "result": result.result,
        "error": result.error,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_entry_carries_result_and_error() {
        let ok = ToolResult {
            name: "fs_read".to_string(),
            ok: true,
            result: json!("X"),
            error: None,
            extra: Default::default(),
        };
        let rendered = render_tool_entry(&ok);
        assert!(rendered.contains("fs_read"));
        assert!(rendered.contains("\"X\""));

        let failed = ToolResult {
            name: "fs_read".to_string(),
            ok: false,
            result: Value::Null,
            error: Some("timeout".to_string()),
            extra: Default::default(),
        };
        assert!(render_tool_entry(&failed).contains("timeout"));
    }
}
