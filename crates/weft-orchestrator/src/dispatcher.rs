//! The skill dispatcher — a stateless worker consuming `ToolRequest`
//! envelopes and answering with `ToolResult`.
//!
//! Runs in its own concurrency domain so a long skill subprocess never
//! stalls the orchestrator's ingress loop. Sequence numbers come from the
//! shared per-task allocator, keeping the task's envelope order intact
//! across the two workers.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_agent::ToolAgent;
use weft_bus::bus::SubscribeError;
use weft_bus::envelope::{topics, Envelope, Payload};
use weft_bus::Bus;
use weft_core::types::{ChannelTag, TaskId};
use weft_tasks::TaskStore;

pub struct SkillDispatcher {
    bus: Arc<Bus>,
    tasks: Arc<TaskStore>,
    tools: Arc<ToolAgent>,
}

impl SkillDispatcher {
    pub fn new(bus: Arc<Bus>, tasks: Arc<TaskStore>, tools: Arc<ToolAgent>) -> Self {
        Self { bus, tasks, tools }
    }

    /// Subscribe eagerly, then spawn the consume loop.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let sub = self.bus.subscribe(topics::TOOL_REQUEST);
        tokio::spawn(self.run(sub, cancel))
    }

    async fn run(self: Arc<Self>, mut sub: weft_bus::Subscription, cancel: CancellationToken) {
        info!("skill dispatcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = sub.recv() => match msg {
                    Ok(env) => {
                        let Some(task_id) = env.task_id.clone() else { continue };
                        let channel = env.channel.clone();
                        if let Payload::ToolRequest(req) = env.payload {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                this.dispatch_one(task_id, channel, req.name, req.arguments)
                                    .await;
                            });
                        }
                    }
                    Err(SubscribeError::Gap { missed, .. }) => {
                        // The requesting orchestrator times out and feeds the
                        // model a timeout result; nothing to answer here.
                        warn!(missed, "tool-request gap: requests lost");
                    }
                    Err(SubscribeError::Closed { .. }) => break,
                }
            }
        }
        info!("skill dispatcher stopped");
    }

    async fn dispatch_one(
        &self,
        task_id: TaskId,
        channel: ChannelTag,
        name: String,
        arguments: Value,
    ) {
        // The audit actor is the task's owning user, not the worker.
        let actor = self
            .tasks
            .get(&task_id)
            .ok()
            .flatten()
            .map(|t| t.user_id.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let result = self.tools.dispatch(&task_id, &actor, &name, arguments).await;

        let seq = match self.tasks.next_seq(&task_id) {
            Ok(seq) => seq,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "seq allocation failed, dropping tool result");
                return;
            }
        };

        let publish = self
            .bus
            .publish_with_retry(
                topics::TOOL_RESULT,
                Envelope::new(
                    Some(task_id.clone()),
                    channel,
                    seq,
                    Payload::ToolResult(result),
                ),
            )
            .await;
        if let Err(e) = publish {
            warn!(task_id = %task_id, error = %e, "tool result publish failed");
        }
    }
}
