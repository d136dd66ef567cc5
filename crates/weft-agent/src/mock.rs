//! Scripted mock gateway for tests.
//!
//! Queue up turns in order; each `complete`/`stream` call consumes one.
//! Errors and mid-stream disconnects are scriptable so retry and
//! partial-flush behavior can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::{
    GatewayError, ModelGateway, ModelRequest, ModelTurn, TurnEvent, TurnStream,
};

/// One scripted model turn.
pub enum ScriptedTurn {
    /// Plain text. `tokens` controls the streamed chunking; when `None`,
    /// streaming yields the whole body as one token.
    Text {
        body: String,
        quality: Option<f32>,
        tokens: Option<Vec<String>>,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    /// A transient failure consumed by one attempt.
    Error(GatewayError),
    /// Streaming yields these tokens, then disconnects mid-turn.
    TextThenDisconnect { tokens: Vec<String> },
}

impl ScriptedTurn {
    pub fn text(body: &str) -> Self {
        ScriptedTurn::Text {
            body: body.to_string(),
            quality: None,
            tokens: None,
        }
    }

    pub fn text_with_quality(body: &str, quality: f32) -> Self {
        ScriptedTurn::Text {
            body: body.to_string(),
            quality: Some(quality),
            tokens: None,
        }
    }

    pub fn streamed(tokens: &[&str]) -> Self {
        ScriptedTurn::Text {
            body: tokens.concat(),
            quality: None,
            tokens: Some(tokens.iter().map(|t| t.to_string()).collect()),
        }
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        ScriptedTurn::ToolCall {
            name: name.to_string(),
            arguments,
        }
    }
}

#[derive(Default)]
pub struct MockGateway {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockGateway {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far, for assertions on context assembly.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap().len()
    }

    fn next_turn(&self, req: &ModelRequest) -> Result<ScriptedTurn, GatewayError> {
        self.requests.lock().unwrap().push(req.clone());
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| GatewayError::Unavailable("mock script exhausted".to_string()))
    }
}

#[async_trait]
impl ModelGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: &ModelRequest) -> Result<ModelTurn, GatewayError> {
        match self.next_turn(req)? {
            ScriptedTurn::Text { body, quality, .. } => Ok(ModelTurn::Text { body, quality }),
            ScriptedTurn::ToolCall { name, arguments } => {
                Ok(ModelTurn::ToolCall { name, arguments })
            }
            ScriptedTurn::Error(e) => Err(e),
            ScriptedTurn::TextThenDisconnect { .. } => Err(GatewayError::Disconnected(
                "scripted disconnect".to_string(),
            )),
        }
    }

    async fn stream(&self, req: &ModelRequest) -> Result<TurnStream, GatewayError> {
        let events: Vec<Result<TurnEvent, GatewayError>> = match self.next_turn(req)? {
            ScriptedTurn::Text {
                body,
                quality,
                tokens,
            } => {
                let chunks = tokens.unwrap_or_else(|| vec![body]);
                chunks
                    .into_iter()
                    .map(|t| Ok(TurnEvent::Token(t)))
                    .chain(std::iter::once(Ok(TurnEvent::Done { quality })))
                    .collect()
            }
            ScriptedTurn::ToolCall { name, arguments } => vec![
                Ok(TurnEvent::ToolCall { name, arguments }),
                Ok(TurnEvent::Done { quality: None }),
            ],
            ScriptedTurn::Error(e) => return Err(e),
            ScriptedTurn::TextThenDisconnect { tokens } => tokens
                .into_iter()
                .map(|t| Ok(TurnEvent::Token(t)))
                .chain(std::iter::once(Err(GatewayError::Disconnected(
                    "scripted disconnect".to_string(),
                ))))
                .collect(),
        };
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}
