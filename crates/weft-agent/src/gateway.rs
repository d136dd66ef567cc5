//! Model gateway interface.
//!
//! Providers expose two faces: a non-streaming `complete` returning the
//! whole turn, and a pull-based `stream` yielding a lazy, finite,
//! non-restartable event sequence. The orchestrator owns the publishing
//! loop — providers never push tokens anywhere themselves.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use weft_core::types::Role;

/// A single message in the model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: String,
}

/// Tool definition sent to the model API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ModelMessage>,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// Normalized outcome of one model turn.
///
/// When a provider returns both free-form text and a tool call in the same
/// turn, the tool call wins and the text is discarded — providers enforce
/// this in their parse layer so callers never see the ambiguity.
#[derive(Debug, Clone)]
pub enum ModelTurn {
    Text {
        body: String,
        /// Model self-rating in [0,1], when the provider surfaces one.
        quality: Option<f32>,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
}

/// One event in a streamed turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A single UTF-8 token chunk.
    Token(String),
    /// The model decided to call a tool. Any streamed text for this turn is
    /// superseded.
    ToolCall { name: String, arguments: Value },
    /// End of the turn.
    Done { quality: Option<f32> },
}

pub type TurnStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, GatewayError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Stream disconnected: {0}")]
    Disconnected(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether a retry can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(_)
            | GatewayError::RateLimited { .. }
            | GatewayError::Unavailable(_)
            | GatewayError::Disconnected(_) => true,
            GatewayError::Api { status, .. } => *status >= 500,
            GatewayError::Parse(_) | GatewayError::Cancelled => false,
        }
    }
}

/// Common interface for model providers.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Provider name for logging and audit entries.
    fn name(&self) -> &str;

    /// Send a request and wait for the full turn.
    async fn complete(&self, req: &ModelRequest) -> Result<ModelTurn, GatewayError>;

    /// Open a streamed turn. The returned sequence is finite and
    /// non-restartable; dropping it abandons the turn.
    ///
    /// Default: falls back to `complete`, yielding the whole body as one
    /// token followed by `Done`.
    async fn stream(&self, req: &ModelRequest) -> Result<TurnStream, GatewayError> {
        let turn = self.complete(req).await?;
        let events: Vec<Result<TurnEvent, GatewayError>> = match turn {
            ModelTurn::Text { body, quality } => vec![
                Ok(TurnEvent::Token(body)),
                Ok(TurnEvent::Done { quality }),
            ],
            ModelTurn::ToolCall { name, arguments } => vec![
                Ok(TurnEvent::ToolCall { name, arguments }),
                Ok(TurnEvent::Done { quality: None }),
            ],
        };
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

/// Retry schedule for transient model errors: up to 3 retries after the
/// initial attempt, sleeping 500 ms, 2 s, 8 s between them.
const RETRY_BACKOFF_MS: [u64; 3] = [500, 2_000, 8_000];

/// Run `op` with the standard retry schedule. Non-transient errors abort
/// immediately.
pub async fn call_with_retry<T, F, Fut>(provider_name: &str, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= RETRY_BACKOFF_MS.len() {
                    return Err(e);
                }
                let backoff_ms = match &e {
                    GatewayError::RateLimited { retry_after_ms } => {
                        (*retry_after_ms).max(RETRY_BACKOFF_MS[attempt])
                    }
                    _ => RETRY_BACKOFF_MS[attempt],
                };
                warn!(
                    provider = provider_name,
                    attempt, backoff_ms, error = %e,
                    "transient model error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn transient_classification() {
        assert!(GatewayError::Unavailable("x".into()).is_transient());
        assert!(GatewayError::RateLimited { retry_after_ms: 1 }.is_transient());
        assert!(GatewayError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!GatewayError::Parse("x".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Unavailable("down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_schedule_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Unavailable("down".into())) }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_transient_error_aborts_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Parse("bad json".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
