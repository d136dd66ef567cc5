//! Secret redaction for audit entries and bus envelopes.
//!
//! Applied at serialization time, not only at log sinks: any JSON value that
//! crosses the bus inside a `ToolRequest`/`ToolResult`/audit payload goes
//! through [`redact_value`] first.
//!
//! Two independent checks, either one masks:
//!   1. Key name: a field whose name contains a sensitive word is masked
//!      regardless of its value.
//!   2. Value shape: a string that looks like a credential is masked
//!      regardless of the field it sits in.

use serde_json::Value;

pub const MASK: &str = "[redacted]";

/// Field-name fragments that mark a value as sensitive. Lowercased substring
/// match, so "api_key", "ApiKey" and "openai_api_key" all hit "key".
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

/// Returns true when a field name alone marks its value as sensitive.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Returns true when a string value has the shape of a known credential.
///
/// Shapes covered: `sk-…` API keys, `Bearer …` header values, Telegram bot
/// tokens (`digits:35-char-suffix`), and long hex blobs.
pub fn looks_like_secret(value: &str) -> bool {
    let v = value.trim();

    if v.starts_with("sk-") && v.len() >= 20 {
        return true;
    }
    if v.starts_with("Bearer ") || v.starts_with("bearer ") {
        return true;
    }
    if is_bot_token_shape(v) {
        return true;
    }
    // 40+ hex chars in one run is a credential, not prose.
    if v.len() >= 40 && v.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }

    false
}

/// Telegram bot tokens look like `1234567890:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K-pc`.
fn is_bot_token_shape(v: &str) -> bool {
    let Some((left, right)) = v.split_once(':') else {
        return false;
    };
    left.len() >= 6
        && left.chars().all(|c| c.is_ascii_digit())
        && right.len() >= 30
        && right
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Recursively mask sensitive fields and credential-shaped strings in a JSON
/// value. Idempotent: redacting twice yields the same result as once.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(MASK.to_string()));
                } else {
                    out.insert(k.clone(), redact_value(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) => {
            if looks_like_secret(s) {
                Value::String(MASK.to_string())
            } else {
                Value::String(s.clone())
            }
        }
        other => other.clone(),
    }
}

/// Mask credential-shaped substrings in free text (audit outcome lines,
/// error messages that may embed a URL with a key).
pub fn redact_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            if looks_like_secret(word) {
                MASK
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
