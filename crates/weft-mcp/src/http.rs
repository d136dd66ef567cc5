//! The authenticated HTTP surface: per-tenant REST endpoints, a JSON-RPC
//! face over the same operations, SSE event streaming, and the
//! administrative endpoint-CRUD routes.
//!
//! Both faces share the underlying stores and nothing else — a confirmation
//! created over JSON-RPC resolves identically to one created over REST.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use weft_bus::bus::SubscribeError;
use weft_bus::envelope::{
    topics, ConfirmationRequest, Envelope, OutgoingReply, Payload,
};
use weft_bus::ratelimit::RateLimiter;
use weft_bus::Bus;
use weft_core::config::RateLimitConfig;
use weft_core::types::{ChatId, CorrelationId, EndpointId};
use weft_core::WeftError;
use weft_skills::{AuditEntry, AuditLog};

use crate::confirm::{drain_replies, ConfirmationRecord, ConfirmationStore, DEFAULT_TIMEOUT_SECS};
use crate::endpoints::{EndpointStore, McpEndpoint};

/// Failed auth attempts per endpoint id. Each failure adds delay before the
/// 401 to blunt brute force; a success clears the bucket.
type FailureMap = DashMap<String, u32>;

const AUTH_DELAY_STEP_MS: u64 = 250;
const AUTH_DELAY_CAP_MS: u64 = 2_500;

pub struct McpState {
    pub bus: Arc<Bus>,
    pub endpoints: Arc<EndpointStore>,
    pub confirmations: Arc<ConfirmationStore>,
    pub audit: Arc<AuditLog>,
    pub rate_limit: RateLimitConfig,
    pub admin_token: Option<String>,
    auth_failures: FailureMap,
}

impl McpState {
    pub fn new(
        bus: Arc<Bus>,
        endpoints: Arc<EndpointStore>,
        confirmations: Arc<ConfirmationStore>,
        audit: Arc<AuditLog>,
        rate_limit: RateLimitConfig,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            bus,
            endpoints,
            confirmations,
            audit,
            rate_limit,
            admin_token,
            auth_failures: DashMap::new(),
        }
    }
}

pub fn build_router(state: Arc<McpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp/v1/agent/{endpoint_id}", post(jsonrpc_handler))
        .route("/mcp/v1/agent/{endpoint_id}/notify", post(notify_handler))
        .route("/mcp/v1/agent/{endpoint_id}/question", post(question_handler))
        .route(
            "/mcp/v1/agent/{endpoint_id}/confirmation",
            post(confirmation_handler),
        )
        .route("/mcp/v1/agent/{endpoint_id}/replies", get(replies_handler))
        .route("/mcp/v1/agent/{endpoint_id}/events", get(events_handler))
        .route(
            "/admin/endpoints",
            get(admin_list_handler).post(admin_create_handler),
        )
        .route("/admin/endpoints/{id}", delete(admin_delete_handler))
        .route("/admin/endpoints/{id}/revoke", post(admin_revoke_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Error shape
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        // Deliberately hint-free: which half failed is not disclosed.
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<WeftError> for ApiError {
    fn from(e: WeftError) -> Self {
        let status = match &e {
            WeftError::Conflict(_) => StatusCode::CONFLICT,
            WeftError::BusUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WeftError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal detail goes to the logs, not the client.
        warn!(error = %e, "mcp request failed");
        ApiError::new(status, e.code().to_lowercase())
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Authenticate a tenant request. Unknown endpoint → 404; bad secret or
/// revoked tenant → delayed 401; the failure bucket grows the delay.
async fn authenticate(
    state: &McpState,
    endpoint_id: &EndpointId,
    headers: &HeaderMap,
) -> Result<McpEndpoint, ApiError> {
    if state.endpoints.get(endpoint_id).map_err(ApiError::from)?.is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "unknown endpoint"));
    }

    let token = bearer(headers);
    let verified = match token {
        Some(secret) => state
            .endpoints
            .verify(endpoint_id, secret)
            .map_err(ApiError::from)?,
        None => None,
    };

    match verified {
        Some(endpoint) => {
            state.auth_failures.remove(endpoint_id.as_str());
            Ok(endpoint)
        }
        None => {
            let failures = {
                let mut entry = state
                    .auth_failures
                    .entry(endpoint_id.to_string())
                    .or_insert(0);
                *entry += 1;
                *entry
            };
            let delay = (failures as u64 * AUTH_DELAY_STEP_MS).min(AUTH_DELAY_CAP_MS);
            debug!(endpoint_id = %endpoint_id, failures, delay_ms = delay, "auth failure");

            let entry = AuditEntry::new(
                endpoint_id.as_str(),
                "mcp.auth_failure",
                endpoint_id.as_str(),
                &json!({}),
            )
            .with_outcome("unauthorized", 0);
            let _ = state.audit.record(&entry);

            tokio::time::sleep(Duration::from_millis(delay)).await;
            Err(ApiError::unauthorized())
        }
    }
}

fn check_rate(state: &McpState, endpoint: &McpEndpoint) -> Result<(), ApiError> {
    let limiter = RateLimiter::new(state.bus.kv(), state.rate_limit.clone());
    let admitted = limiter
        .try_acquire(&format!("mcp:{}", endpoint.id))
        .map_err(ApiError::from)?;
    if admitted {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate limited"))
    }
}

// ---------------------------------------------------------------------------
// Shared operation bodies (used by both the REST and JSON-RPC faces)
// ---------------------------------------------------------------------------

fn do_deliver(
    state: &McpState,
    endpoint: &McpEndpoint,
    message: &str,
    action: &str,
) -> Result<(), ApiError> {
    state
        .bus
        .publish(
            topics::OUTGOING_REPLY,
            Envelope::broadcast(
                endpoint.channel.as_str().into(),
                Payload::OutgoingReply(OutgoingReply {
                    chat_id: endpoint.chat_id.clone(),
                    message_id: None,
                    text: message.to_string(),
                    done: true,
                    extra: Default::default(),
                }),
            ),
        )
        .map_err(ApiError::from)?;

    let entry = AuditEntry::new(
        endpoint.id.as_str(),
        action,
        endpoint.id.as_str(),
        &json!({ "length": message.len() }),
    )
    .with_outcome("accepted", 0);
    let _ = state.audit.record(&entry);
    Ok(())
}

fn do_confirmation(
    state: &McpState,
    endpoint: &McpEndpoint,
    message: &str,
    timeout_secs: u64,
    correlation_id: Option<CorrelationId>,
) -> Result<ConfirmationRecord, ApiError> {
    let record = state
        .confirmations
        .create(
            correlation_id,
            endpoint.id.clone(),
            endpoint.chat_id.clone(),
            message,
            timeout_secs,
        )
        .map_err(ApiError::from)?;

    state
        .bus
        .publish(
            topics::CONFIRMATION_REQUEST,
            Envelope::broadcast(
                endpoint.channel.as_str().into(),
                Payload::ConfirmationRequest(ConfirmationRequest {
                    endpoint_id: endpoint.id.clone(),
                    correlation_id: record.correlation_id.clone(),
                    chat_id: endpoint.chat_id.clone(),
                    message: message.to_string(),
                    deadline_ts: record.deadline_ts.clone(),
                    extra: Default::default(),
                }),
            ),
        )
        .map_err(ApiError::from)?;

    let entry = AuditEntry::new(
        endpoint.id.as_str(),
        "confirm.request",
        record.correlation_id.as_str(),
        &json!({ "timeout_secs": timeout_secs }),
    )
    .with_outcome("pending", 0);
    let _ = state.audit.record(&entry);

    Ok(record)
}

fn do_replies(state: &McpState, endpoint: &McpEndpoint) -> Result<Vec<Value>, ApiError> {
    drain_replies(state.bus.kv(), &endpoint.id).map_err(ApiError::from)
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct MessageBody {
    message: String,
}

async fn notify_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;
    check_rate(&state, &endpoint)?;
    do_deliver(&state, &endpoint, &body.message, "mcp.notify")?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

async fn question_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;
    check_rate(&state, &endpoint)?;
    do_deliver(&state, &endpoint, &body.message, "mcp.question")?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

#[derive(Deserialize)]
struct ConfirmationBody {
    message: String,
    timeout_sec: Option<u64>,
    correlation_id: Option<String>,
}

async fn confirmation_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConfirmationBody>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;
    check_rate(&state, &endpoint)?;

    let record = do_confirmation(
        &state,
        &endpoint,
        &body.message,
        body.timeout_sec.unwrap_or(DEFAULT_TIMEOUT_SECS),
        body.correlation_id.map(CorrelationId::from),
    )?;

    Ok(Json(json!({
        "correlation_id": record.correlation_id,
        "deadline_ts": record.deadline_ts,
    })))
}

async fn replies_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;
    let replies = do_replies(&state, &endpoint)?;
    Ok(Json(json!({ "replies": replies })))
}

/// Long-lived SSE stream of `confirmation` and `feedback` events, with
/// `: keepalive` comments every 15 s. Late joiners do not replay past
/// events — that is what `/replies` is for.
async fn events_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;
    let mut sub = state.bus.subscribe(&topics::mcp_events(endpoint.id.as_str()));

    let stream = async_stream::stream! {
        loop {
            match sub.recv().await {
                Ok(env) => {
                    let (name, data) = match env.payload {
                        Payload::ConfirmationResult(r) => (
                            "confirmation",
                            json!({
                                "correlation_id": r.correlation_id,
                                "outcome": r.outcome,
                                "confirmed": r.outcome == "confirmed",
                                "reply": r.reply,
                            }),
                        ),
                        Payload::FeedbackMessage(f) => (
                            "feedback",
                            json!({ "chat_id": f.chat_id, "text": f.text }),
                        ),
                        _ => continue,
                    };
                    match Event::default().event(name).json_data(&data) {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!(error = %e, "sse serialization failed"),
                    }
                }
                // No replay on overrun either; clients recover via /replies.
                Err(SubscribeError::Gap { .. }) => continue,
                Err(SubscribeError::Closed { .. }) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

// ---------------------------------------------------------------------------
// JSON-RPC face
// ---------------------------------------------------------------------------

fn rpc_ok(id: Value, result: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn rpc_err(id: Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    }))
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "notify",
            "description": "Deliver a notification to the tenant's chat",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }
        },
        {
            "name": "question",
            "description": "Deliver an advisory question (no correlation)",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }
        },
        {
            "name": "confirmation",
            "description": "Post a confirm/reject prompt; the outcome arrives via events or replies",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "timeout_sec": { "type": "integer" }
                },
                "required": ["message"]
            }
        },
        {
            "name": "get_replies",
            "description": "Drain the tenant's queued resolutions and feedback",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

async fn jsonrpc_handler(
    State(state): State<Arc<McpState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let endpoint = authenticate(&state, &endpoint_id.as_str().into(), &headers).await?;

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");

    match method {
        "tools/list" => Ok(rpc_ok(id, json!({ "tools": tool_definitions() }))),
        "tools/call" => {
            check_rate(&state, &endpoint)?;
            let params = request.get("params").cloned().unwrap_or(json!({}));
            let tool = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
            let args = params.get("arguments").cloned().unwrap_or(json!({}));
            let message = args.get("message").and_then(|m| m.as_str()).unwrap_or("");

            let result = match tool {
                "notify" => {
                    do_deliver(&state, &endpoint, message, "mcp.notify")?;
                    json!({ "status": "accepted" })
                }
                "question" => {
                    do_deliver(&state, &endpoint, message, "mcp.question")?;
                    json!({ "status": "accepted" })
                }
                "confirmation" => {
                    let timeout = args
                        .get("timeout_sec")
                        .and_then(|t| t.as_u64())
                        .unwrap_or(DEFAULT_TIMEOUT_SECS);
                    let record = do_confirmation(&state, &endpoint, message, timeout, None)?;
                    json!({
                        "correlation_id": record.correlation_id,
                        "deadline_ts": record.deadline_ts,
                    })
                }
                "get_replies" => json!({ "replies": do_replies(&state, &endpoint)? }),
                other => {
                    return Ok(rpc_err(id, -32602, &format!("unknown tool: {other}")));
                }
            };

            Ok(rpc_ok(
                id,
                json!({
                    "content": [{ "type": "text", "text": result.to_string() }]
                }),
            ))
        }
        other => Ok(rpc_err(id, -32601, &format!("method not found: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Administrative surface
// ---------------------------------------------------------------------------

fn authenticate_admin(state: &McpState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::unauthorized());
    };
    let Some(token) = bearer(headers) else {
        return Err(ApiError::unauthorized());
    };
    let matches: bool = expected.as_bytes().ct_eq(token.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

#[derive(Deserialize)]
struct CreateEndpointBody {
    name: String,
    chat_id: String,
    #[serde(default = "default_channel")]
    channel: String,
}

fn default_channel() -> String {
    "telegram".to_string()
}

async fn admin_create_handler(
    State(state): State<Arc<McpState>>,
    headers: HeaderMap,
    Json(body): Json<CreateEndpointBody>,
) -> Result<Json<Value>, ApiError> {
    authenticate_admin(&state, &headers)?;
    let endpoint = state
        .endpoints
        .create(&body.name, ChatId::from(body.chat_id), &body.channel)
        .map_err(ApiError::from)?;
    // The secret appears exactly once, in this response.
    Ok(Json(serde_json::to_value(&endpoint).unwrap_or_default()))
}

async fn admin_list_handler(
    State(state): State<Arc<McpState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate_admin(&state, &headers)?;
    let endpoints: Vec<Value> = state
        .endpoints
        .list()
        .map_err(ApiError::from)?
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "name": e.name,
                "chat_id": e.chat_id,
                "channel": e.channel,
                "created_at": e.created_at,
                "revoked": e.revoked,
            })
        })
        .collect();
    Ok(Json(json!({ "endpoints": endpoints })))
}

async fn admin_revoke_handler(
    State(state): State<Arc<McpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate_admin(&state, &headers)?;
    let revoked = state
        .endpoints
        .revoke(&id.as_str().into())
        .await
        .map_err(ApiError::from)?;
    if revoked {
        Ok(Json(json!({ "status": "revoked" })))
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "unknown endpoint"))
    }
}

async fn admin_delete_handler(
    State(state): State<Arc<McpState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authenticate_admin(&state, &headers)?;
    let deleted = state
        .endpoints
        .delete(&id.as_str().into())
        .await
        .map_err(ApiError::from)?;
    if deleted {
        Ok(Json(json!({ "status": "deleted" })))
    } else {
        Err(ApiError::new(StatusCode::NOT_FOUND, "unknown endpoint"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use weft_bus::Kv;

    struct Fixture {
        router: Router,
        bus: Arc<Bus>,
        endpoints: Arc<EndpointStore>,
        confirmations: Arc<ConfirmationStore>,
    }

    fn fixture() -> Fixture {
        let kv = Arc::new(Kv::open_in_memory().unwrap());
        let bus = Arc::new(Bus::new(Arc::clone(&kv)));
        let endpoints = Arc::new(EndpointStore::new(Arc::clone(&kv)));
        let confirmations = Arc::new(ConfirmationStore::new(Arc::clone(&kv)));
        let audit = Arc::new(AuditLog::open_in_memory().unwrap());

        let state = Arc::new(McpState::new(
            Arc::clone(&bus),
            Arc::clone(&endpoints),
            Arc::clone(&confirmations),
            audit,
            RateLimitConfig {
                capacity: 100,
                refill_per_sec: 100.0,
            },
            Some("admin-secret".to_string()),
        ));

        Fixture {
            router: build_router(state),
            bus,
            endpoints,
            confirmations,
        }
    }

    fn post_json(path: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {t}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn missing_auth_is_401_unknown_endpoint_is_404() {
        let f = fixture();
        let ep = f.endpoints.create("t", "1".into(), "telegram").unwrap();

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                &format!("/mcp/v1/agent/{}/notify", ep.id),
                None,
                json!({"message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                "/mcp/v1/agent/ghost/notify",
                Some("whatever"),
                json!({"message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_secret_is_401() {
        let f = fixture();
        let ep = f.endpoints.create("t", "1".into(), "telegram").unwrap();

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                &format!("/mcp/v1/agent/{}/notify", ep.id),
                Some("not-the-secret"),
                json!({"message": "hi"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn notify_publishes_outgoing_reply_and_returns_202() {
        let f = fixture();
        let ep = f.endpoints.create("t", "42".into(), "telegram").unwrap();
        let mut replies = f.bus.subscribe(topics::OUTGOING_REPLY);

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                &format!("/mcp/v1/agent/{}/notify", ep.id),
                Some(&ep.secret),
                json!({"message": "build finished"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let env = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        let Payload::OutgoingReply(reply) = env.payload else {
            panic!("expected reply");
        };
        assert_eq!(reply.text, "build finished");
        assert_eq!(reply.chat_id.as_str(), "42");
    }

    #[tokio::test]
    async fn confirmation_creates_record_and_publishes_request() {
        let f = fixture();
        let ep = f.endpoints.create("t", "1".into(), "telegram").unwrap();
        let mut requests = f.bus.subscribe(topics::CONFIRMATION_REQUEST);

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                &format!("/mcp/v1/agent/{}/confirmation", ep.id),
                Some(&ep.secret),
                json!({"message": "deploy?", "timeout_sec": 60}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let env = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .unwrap()
            .unwrap();
        let Payload::ConfirmationRequest(req) = env.payload else {
            panic!("expected confirmation request");
        };
        assert_eq!(req.message, "deploy?");

        let record = f.confirmations.get(&req.correlation_id).unwrap().unwrap();
        assert_eq!(record.prompt, "deploy?");
    }

    #[tokio::test]
    async fn duplicate_correlation_is_409() {
        let f = fixture();
        let ep = f.endpoints.create("t", "1".into(), "telegram").unwrap();

        let make = || {
            post_json(
                &format!("/mcp/v1/agent/{}/confirmation", ep.id),
                Some(&ep.secret),
                json!({"message": "x", "correlation_id": "fixed"}),
            )
        };
        let first = f.router.clone().oneshot(make()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = f.router.clone().oneshot(make()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn jsonrpc_tools_list_answers_200() {
        let f = fixture();
        let ep = f.endpoints.create("t", "1".into(), "telegram").unwrap();

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                &format!("/mcp/v1/agent/{}", ep.id),
                Some(&ep.secret),
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_create_requires_token() {
        let f = fixture();

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                "/admin/endpoints",
                None,
                json!({"name": "x", "chat_id": "1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = f
            .router
            .clone()
            .oneshot(post_json(
                "/admin/endpoints",
                Some("admin-secret"),
                json!({"name": "x", "chat_id": "1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(f.endpoints.list().unwrap().len(), 1);
    }
}
