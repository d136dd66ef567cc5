//! OpenAI-compatible chat-completions provider.
//!
//! Works against any endpoint speaking the `/v1/chat/completions` dialect.
//! Streaming uses SSE `data:` lines terminated by a literal `[DONE]`.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use weft_core::config::ModelConfig;

use crate::gateway::{
    GatewayError, ModelGateway, ModelRequest, ModelTurn, TurnEvent, TurnStream,
};

pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl OpenAiGateway {
    pub fn new(config: &ModelConfig) -> Self {
        Self::named("model", &config.base_url, &config.api_key, config)
    }

    /// Build the cloud-fallback provider from its own coordinates.
    pub fn fallback(config: &ModelConfig) -> Option<Self> {
        config
            .fallback
            .as_ref()
            .map(|fb| Self::named("fallback", &fb.base_url, &fb.api_key, config))
    }

    fn named(name: &str, base_url: &str, api_key: &str, config: &ModelConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            provider_name: name.to_string(),
        }
    }

    fn build_body(&self, req: &ModelRequest, stream: bool) -> Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": req.system,
        })];
        for m in &req.messages {
            messages.push(serde_json::json!({
                "role": m.role,
                "content": m.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }

        body
    }

    async fn send(&self, req: &ModelRequest, stream: bool) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        debug!(model = %req.model, stream, "sending model request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&self.build_body(req, stream))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(GatewayError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "model API error");
            return Err(GatewayError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(&self, req: &ModelRequest) -> Result<ModelTurn, GatewayError> {
        let resp = self.send(req, false).await?;
        let api: ApiResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        let choice = api
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Parse("no choices in response".to_string()))?;

        // Tool call wins over any accompanying text.
        if let Some(call) = choice.message.tool_calls.and_then(|c| c.into_iter().next()) {
            let arguments: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or_default();
            return Ok(ModelTurn::ToolCall {
                name: call.function.name,
                arguments,
            });
        }

        Ok(ModelTurn::Text {
            body: choice.message.content.unwrap_or_default(),
            quality: None,
        })
    }

    async fn stream(&self, req: &ModelRequest) -> Result<TurnStream, GatewayError> {
        let resp = self.send(req, true).await?;
        Ok(Box::pin(sse_turn_stream(resp)))
    }
}

/// Parse the SSE byte stream into turn events.
///
/// Lines may be split across chunks, so a partial line is buffered until its
/// newline arrives. A transport error mid-stream surfaces as `Disconnected`
/// — the caller decides how to flush what it already forwarded.
fn sse_turn_stream(
    resp: reqwest::Response,
) -> impl futures_util::Stream<Item = Result<TurnEvent, GatewayError>> {
    async_stream::stream! {
        let mut byte_stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut tool_name = String::new();
        let mut tool_args = String::new();
        let mut saw_tool_call = false;

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(GatewayError::Disconnected(e.to_string()));
                    return;
                }
            };
            let Ok(text) = std::str::from_utf8(&chunk) else {
                continue;
            };

            line_buf.push_str(text);
            let lines: Vec<&str> = line_buf.split('\n').collect();
            let (complete, remainder) = lines.split_at(lines.len() - 1);
            let remainder = remainder.first().unwrap_or(&"").to_string();

            for line in complete {
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    break 'outer;
                }
                let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(data) else {
                    continue;
                };
                for choice in &chunk_resp.choices {
                    if let Some(calls) = &choice.delta.tool_calls {
                        saw_tool_call = true;
                        for c in calls {
                            if let Some(f) = &c.function {
                                if let Some(n) = &f.name {
                                    tool_name.push_str(n);
                                }
                                if let Some(a) = &f.arguments {
                                    tool_args.push_str(a);
                                }
                            }
                        }
                    }
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(TurnEvent::Token(content.clone()));
                        }
                    }
                }
            }

            line_buf = remainder;
        }

        if saw_tool_call && !tool_name.is_empty() {
            let arguments: Value = serde_json::from_str(&tool_args).unwrap_or_default();
            yield Ok(TurnEvent::ToolCall { name: tool_name, arguments });
        }
        yield Ok(TurnEvent::Done { quality: None });
    }
}

// Wire types for the chat-completions dialect.

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
