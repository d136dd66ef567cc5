//! Typed envelopes carried on the bus.
//!
//! Wire format is schema-versioned JSON. The header (v, task_id, channel,
//! seq, ts) is shared by every kind; the payload fields are flattened next
//! to it with a `kind` discriminator. Unknown fields survive a
//! deserialize → forward → serialize round trip via the flattened `extra`
//! map on each payload, so old nodes can forward envelopes from newer ones.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weft_core::config::MAX_ENVELOPE_BYTES;
use weft_core::redact::redact_value;
use weft_core::types::{ChannelTag, ChatId, CorrelationId, EndpointId, TaskId, UserId};
use weft_core::{Result, WeftError};

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Stable topic names.
pub mod topics {
    pub const INCOMING: &str = "assistant:incoming";
    pub const OUTGOING_REPLY: &str = "assistant:outgoing_reply";
    pub const STREAM_TOKEN: &str = "assistant:stream_token";
    pub const TOOL_REQUEST: &str = "assistant:tool_request";
    pub const TOOL_RESULT: &str = "assistant:tool_result";
    pub const CONFIRMATION_REQUEST: &str = "assistant:confirmation_request";
    pub const CONFIRMATION_RESULT: &str = "assistant:confirmation_result";
    pub const FEEDBACK: &str = "assistant:feedback";
    pub const RESTART_REQUESTED: &str = "assistant:action:restart_requested";

    /// Per-tenant MCP event topic.
    pub fn mcp_events(endpoint_id: &str) -> String {
        format!("assistant:mcp:events:{endpoint_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version. Readers reject versions they do not understand.
    pub v: u32,
    /// Task this envelope belongs to. Empty for broadcasts (restart, MCP events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub channel: ChannelTag,
    /// Monotonic sequence number within a task. Consumers filtering by
    /// task_id must observe strictly increasing values.
    pub seq: u64,
    pub ts: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn new(task_id: Option<TaskId>, channel: ChannelTag, seq: u64, payload: Payload) -> Self {
        Self {
            v: SCHEMA_VERSION,
            task_id,
            channel,
            seq,
            ts: chrono::Utc::now().to_rfc3339(),
            payload,
        }
    }

    /// Broadcast envelope with no task affinity.
    pub fn broadcast(channel: ChannelTag, payload: Payload) -> Self {
        Self::new(None, channel, 0, payload)
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Serialize for the wire, enforcing the size cap and applying secret
    /// redaction to payload kinds that carry free-form arguments.
    pub fn encode(&self) -> Result<String> {
        let redacted = self.redacted();
        let json = serde_json::to_string(&redacted)?;
        if json.len() > MAX_ENVELOPE_BYTES {
            return Err(WeftError::EnvelopeTooLarge {
                size: json.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        Ok(json)
    }

    pub fn decode(json: &str) -> Result<Self> {
        let env: Envelope = serde_json::from_str(json)?;
        if env.v > SCHEMA_VERSION {
            return Err(WeftError::Internal(format!(
                "unsupported envelope schema v{}",
                env.v
            )));
        }
        Ok(env)
    }

    /// Copy with secrets masked in the free-form payload fields.
    /// Redaction happens here, at serialization, not only at log sinks.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        match &mut out.payload {
            Payload::ToolRequest(p) => {
                p.arguments = redact_value(&p.arguments);
            }
            Payload::ToolResult(p) => {
                p.result = redact_value(&p.result);
            }
            _ => {}
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    IncomingMessage(IncomingMessage),
    OutgoingReply(OutgoingReply),
    StreamToken(StreamToken),
    ToolRequest(ToolRequest),
    ToolResult(ToolResult),
    ConfirmationRequest(ConfirmationRequest),
    ConfirmationResult(ConfirmationResult),
    FeedbackMessage(FeedbackMessage),
    RestartRequested(RestartRequested),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::IncomingMessage(_) => "incoming_message",
            Payload::OutgoingReply(_) => "outgoing_reply",
            Payload::StreamToken(_) => "stream_token",
            Payload::ToolRequest(_) => "tool_request",
            Payload::ToolResult(_) => "tool_result",
            Payload::ConfirmationRequest(_) => "confirmation_request",
            Payload::ConfirmationResult(_) => "confirmation_result",
            Payload::FeedbackMessage(_) => "feedback_message",
            Payload::RestartRequested(_) => "restart_requested",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_requested: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub text: String,
    pub done: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One delta chunk in a per-task stream. Carries a single UTF-8 token chunk,
/// never a full buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToken {
    pub chat_id: ChatId,
    pub token: String,
    pub done: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    pub arguments: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub ok: bool,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub endpoint_id: EndpointId,
    pub correlation_id: CorrelationId,
    pub chat_id: ChatId,
    pub message: String,
    pub deadline_ts: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub endpoint_id: EndpointId,
    pub correlation_id: CorrelationId,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub endpoint_id: EndpointId,
    pub chat_id: ChatId,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRequested {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_token_wire_shape() {
        let env = Envelope::new(
            Some(TaskId::from("t1")),
            ChannelTag::telegram(),
            3,
            Payload::StreamToken(StreamToken {
                chat_id: ChatId::from("42"),
                token: "he".to_string(),
                done: false,
                extra: Map::new(),
            }),
        );
        let json = env.encode().unwrap();
        assert!(json.contains(r#""kind":"stream_token""#));
        assert!(json.contains(r#""seq":3"#));
        assert!(json.contains(r#""token":"he""#));
        assert!(json.contains(r#""done":false"#));
    }

    #[test]
    fn broadcast_has_no_task_id_field() {
        let env = Envelope::broadcast(
            ChannelTag::from("core"),
            Payload::RestartRequested(RestartRequested {
                reason: None,
                extra: Map::new(),
            }),
        );
        let json = env.encode().unwrap();
        assert!(!json.contains("task_id"));
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let env = Envelope::new(
            Some(TaskId::from("t1")),
            ChannelTag::telegram(),
            1,
            Payload::OutgoingReply(OutgoingReply {
                chat_id: ChatId::from("1"),
                message_id: None,
                text: "x".repeat(MAX_ENVELOPE_BYTES + 1),
                done: true,
                extra: Map::new(),
            }),
        );
        let err = env.encode().unwrap_err();
        assert_eq!(err.code(), "ENVELOPE_TOO_LARGE");
    }

    #[test]
    fn tool_request_arguments_are_redacted_on_encode() {
        let env = Envelope::new(
            Some(TaskId::from("t1")),
            ChannelTag::telegram(),
            1,
            Payload::ToolRequest(ToolRequest {
                name: "http_fetch".to_string(),
                arguments: serde_json::json!({"url": "https://x", "api_key": "sk-abcdefghijklmnopqrstuvwx"}),
                extra: Map::new(),
            }),
        );
        let json = env.encode().unwrap();
        assert!(!json.contains("sk-abcdefghijklmnopqrstuvwx"));
        assert!(json.contains("[redacted]"));
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let json = r#"{"v":99,"channel":"telegram","seq":0,"ts":"2026-01-01T00:00:00Z","kind":"restart_requested"}"#;
        assert!(Envelope::decode(json).is_err());
    }
}
