// Envelope wire-format guarantees: field names are stable, unknown fields
// survive forwarding, and the documented payload shapes parse.

use weft_bus::envelope::{topics, Envelope, Payload};

#[test]
fn incoming_message_parses_documented_shape() {
    let json = r#"{
        "v": 1,
        "task_id": "0192b-task",
        "channel": "telegram",
        "seq": 0,
        "ts": "2026-08-01T10:00:00Z",
        "kind": "incoming_message",
        "message_id": "55",
        "user_id": "1",
        "chat_id": "1",
        "text": "hello",
        "reasoning_requested": true
    }"#;
    let env = Envelope::decode(json).unwrap();
    match env.payload {
        Payload::IncomingMessage(m) => {
            assert_eq!(m.text, "hello");
            assert_eq!(m.reasoning_requested, Some(true));
            assert!(m.reply_to.is_none());
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

#[test]
fn unknown_fields_survive_forwarding() {
    // A newer node added "priority" to ToolResult. An older node must carry
    // it through deserialize → serialize untouched.
    let json = r#"{
        "v": 1,
        "task_id": "t1",
        "channel": "telegram",
        "seq": 4,
        "ts": "2026-08-01T10:00:00Z",
        "kind": "tool_result",
        "name": "fs_read",
        "ok": true,
        "result": "X",
        "priority": "high"
    }"#;
    let env = Envelope::decode(json).unwrap();
    let forwarded = serde_json::to_string(&env).unwrap();
    let reparsed = Envelope::decode(&forwarded).unwrap();

    match reparsed.payload {
        Payload::ToolResult(r) => {
            assert_eq!(r.extra.get("priority").and_then(|v| v.as_str()), Some("high"));
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

#[test]
fn confirmation_result_round_trip() {
    let json = r#"{
        "v": 1,
        "channel": "mcp",
        "seq": 0,
        "ts": "2026-08-01T10:00:00Z",
        "kind": "confirmation_result",
        "endpoint_id": "ep1",
        "correlation_id": "c1",
        "outcome": "replied",
        "reply": "ship it"
    }"#;
    let env = Envelope::decode(json).unwrap();
    match &env.payload {
        Payload::ConfirmationResult(r) => {
            assert_eq!(r.outcome, "replied");
            assert_eq!(r.reply.as_deref(), Some("ship it"));
        }
        other => panic!("wrong payload: {other:?}"),
    }
    // Absent optional fields stay absent on the wire.
    let encoded = env.encode().unwrap();
    assert!(!encoded.contains("task_id"));
}

#[test]
fn mcp_event_topic_helper() {
    assert_eq!(
        topics::mcp_events("ep-9"),
        "assistant:mcp:events:ep-9"
    );
}

#[test]
fn kind_discriminator_matches_accessor() {
    let json = r#"{
        "v": 1,
        "task_id": "t1",
        "channel": "telegram",
        "seq": 1,
        "ts": "2026-08-01T10:00:00Z",
        "kind": "stream_token",
        "chat_id": "1",
        "token": "he",
        "done": false
    }"#;
    let env = Envelope::decode(json).unwrap();
    assert_eq!(env.kind(), "stream_token");
}
