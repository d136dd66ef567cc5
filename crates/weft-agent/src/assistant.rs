//! The AssistantAgent — stateless bridge from a TaskContext to one model
//! turn, with retry and optional cloud fallback.

use std::sync::Arc;

use tracing::{info, warn};

use weft_core::config::ModelConfig;
use weft_core::types::Role;

use crate::context::TaskContext;
use crate::gateway::{
    call_with_retry, GatewayError, ModelGateway, ModelMessage, ModelRequest, ModelTurn,
    ToolDefinition, TurnStream,
};

const DEFAULT_MAX_TOKENS: u32 = 4096;

const SYSTEM_PROMPT: &str = "You are a personal assistant reachable through chat. \
Answer plainly and concisely. When a task needs an external capability, call \
one of the provided tools instead of guessing.";

pub struct AssistantAgent {
    gateway: Arc<dyn ModelGateway>,
    fallback: Option<Arc<dyn ModelGateway>>,
    config: ModelConfig,
}

impl AssistantAgent {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        fallback: Option<Arc<dyn ModelGateway>>,
        config: ModelConfig,
    ) -> Self {
        Self {
            gateway,
            fallback,
            config,
        }
    }

    /// Build the message array: system prompt + memory blocks + short-term
    /// window. The window's final entry is the current user message.
    pub fn build_request(&self, ctx: &TaskContext) -> ModelRequest {
        let mut system = String::from(SYSTEM_PROMPT);
        for fragment in &ctx.memory {
            if !fragment.is_empty() {
                system.push_str("\n\n");
                system.push_str(fragment);
            }
        }

        let messages: Vec<ModelMessage> = ctx
            .window
            .iter()
            .map(|entry| ModelMessage {
                role: match entry.role {
                    // Tool results ride as user-role content in the
                    // chat-completions dialect.
                    Role::Tool => Role::User,
                    other => other,
                },
                content: entry.text.clone(),
            })
            .collect();

        let tools: Vec<ToolDefinition> = ctx
            .skills
            .iter()
            .map(|d| ToolDefinition {
                name: d.name.clone(),
                description: d.description.clone(),
                input_schema: d.input_schema(),
            })
            .collect();

        ModelRequest {
            model: self.config.name.clone(),
            system,
            messages,
            max_tokens: DEFAULT_MAX_TOKENS,
            tools,
        }
    }

    /// One non-streaming turn with retries; falls back to the cloud provider
    /// only when enabled and the primary is exhausted.
    pub async fn respond(&self, ctx: &TaskContext) -> Result<ModelTurn, GatewayError> {
        let req = self.build_request(ctx);
        info!(model = %req.model, provider = %self.gateway.name(), "model turn");

        match call_with_retry(self.gateway.name(), || self.gateway.complete(&req)).await {
            Ok(turn) => Ok(turn),
            Err(primary_err) => self.try_fallback_complete(&req, primary_err).await,
        }
    }

    /// Open a streamed turn. Retry applies to opening the stream; a
    /// disconnect mid-stream is the caller's to handle (partial flush).
    pub async fn respond_stream(&self, ctx: &TaskContext) -> Result<TurnStream, GatewayError> {
        let req = self.build_request(ctx);
        info!(model = %req.model, provider = %self.gateway.name(), "model turn (stream)");

        match call_with_retry(self.gateway.name(), || self.gateway.stream(&req)).await {
            Ok(stream) => Ok(stream),
            Err(primary_err) => {
                let fallback = self.fallback_or(primary_err)?;
                call_with_retry(fallback.name(), || fallback.stream(&req)).await
            }
        }
    }

    async fn try_fallback_complete(
        &self,
        req: &ModelRequest,
        primary_err: GatewayError,
    ) -> Result<ModelTurn, GatewayError> {
        let fallback = self.fallback_or(primary_err)?;
        call_with_retry(fallback.name(), || fallback.complete(req)).await
    }

    fn fallback_or(&self, primary_err: GatewayError) -> Result<&Arc<dyn ModelGateway>, GatewayError> {
        if !self.config.cloud_fallback_enabled {
            return Err(primary_err);
        }
        match &self.fallback {
            Some(fb) => {
                warn!(error = %primary_err, fallback = %fb.name(), "primary model exhausted, trying fallback");
                Ok(fb)
            }
            None => Err(primary_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockGateway, ScriptedTurn};
    use weft_core::types::{ChannelTag, ChatId, UserId};
    use weft_tasks::WindowEntry;

    fn ctx() -> TaskContext {
        TaskContext {
            user_id: UserId::from("u1"),
            channel: ChannelTag::telegram(),
            chat_id: ChatId::from("1"),
            window: vec![
                WindowEntry {
                    role: Role::User,
                    text: "earlier question".to_string(),
                },
                WindowEntry {
                    role: Role::Assistant,
                    text: "earlier answer".to_string(),
                },
                WindowEntry {
                    role: Role::User,
                    text: "hello".to_string(),
                },
            ],
            memory: vec!["Summary: likes terse answers.".to_string(), String::new()],
            skills: vec![],
        }
    }

    fn config(fallback_enabled: bool) -> ModelConfig {
        ModelConfig {
            base_url: "http://localhost".to_string(),
            name: "test-model".to_string(),
            cloud_fallback_enabled: fallback_enabled,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn request_carries_window_and_memory() {
        let gw = Arc::new(MockGateway::new(vec![ScriptedTurn::text("hi")]));
        let agent = AssistantAgent::new(gw.clone(), None, config(false));

        agent.respond(&ctx()).await.unwrap();

        let reqs = gw.requests();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].messages.len(), 3);
        assert_eq!(reqs[0].messages[2].content, "hello");
        assert!(reqs[0].system.contains("likes terse answers"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_on_primary() {
        let gw = Arc::new(MockGateway::new(vec![
            ScriptedTurn::Error(GatewayError::Unavailable("down".into())),
            ScriptedTurn::text("recovered"),
        ]));
        let agent = AssistantAgent::new(gw.clone(), None, config(false));

        let ModelTurn::Text { body, .. } = agent.respond(&ctx()).await.unwrap() else {
            panic!("expected text");
        };
        assert_eq!(body, "recovered");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_used_only_when_enabled() {
        let dead = || {
            MockGateway::new(vec![
                ScriptedTurn::Error(GatewayError::Unavailable("1".into())),
                ScriptedTurn::Error(GatewayError::Unavailable("2".into())),
                ScriptedTurn::Error(GatewayError::Unavailable("3".into())),
                ScriptedTurn::Error(GatewayError::Unavailable("4".into())),
            ])
        };

        // Disabled: the fallback is never consulted.
        let fb = Arc::new(MockGateway::new(vec![ScriptedTurn::text("from cloud")]));
        let agent = AssistantAgent::new(Arc::new(dead()), Some(fb.clone()), config(false));
        assert!(agent.respond(&ctx()).await.is_err());
        assert_eq!(fb.remaining(), 1);

        // Enabled: the fallback answers.
        let fb = Arc::new(MockGateway::new(vec![ScriptedTurn::text("from cloud")]));
        let agent = AssistantAgent::new(Arc::new(dead()), Some(fb.clone()), config(true));
        let ModelTurn::Text { body, .. } = agent.respond(&ctx()).await.unwrap() else {
            panic!("expected text");
        };
        assert_eq!(body, "from cloud");
    }
}
