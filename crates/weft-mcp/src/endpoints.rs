//! Multi-tenant endpoint registry.
//!
//! One `McpEndpoint` per tenant, stored at `mcp:endpoint:<id>`. The secret
//! is generated once at creation and compared in constant time; a revoked
//! endpoint authenticates exactly like an unknown one.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;
use uuid::Uuid;

use weft_bus::Kv;
use weft_core::types::{ChatId, EndpointId};
use weft_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpEndpoint {
    pub id: EndpointId,
    pub name: String,
    /// Delivery target: the chat this tenant's messages land in.
    pub chat_id: ChatId,
    /// Channel tag of the delivery chat.
    pub channel: String,
    pub secret: String,
    pub created_at: String,
    pub revoked: bool,
}

pub struct EndpointStore {
    kv: Arc<Kv>,
    /// Per-endpoint locks held across administrative read-modify-write
    /// sequences. Plain reads (auth) never take them.
    admin_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl EndpointStore {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self {
            kv,
            admin_locks: DashMap::new(),
        }
    }

    fn key(id: &EndpointId) -> String {
        format!("mcp:endpoint:{id}")
    }

    fn lock_for(&self, id: &EndpointId) -> Arc<tokio::sync::Mutex<()>> {
        self.admin_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Create a tenant with a fresh random secret. The secret is returned
    /// exactly once, in the created record.
    pub fn create(&self, name: &str, chat_id: ChatId, channel: &str) -> Result<McpEndpoint> {
        let endpoint = McpEndpoint {
            id: EndpointId::new(),
            name: name.to_string(),
            chat_id,
            channel: channel.to_string(),
            secret: generate_secret(),
            created_at: chrono::Utc::now().to_rfc3339(),
            revoked: false,
        };
        self.kv.set_json(&Self::key(&endpoint.id), &endpoint)?;
        info!(endpoint_id = %endpoint.id, name, "mcp endpoint created");
        Ok(endpoint)
    }

    pub fn get(&self, id: &EndpointId) -> Result<Option<McpEndpoint>> {
        self.kv.get_json(&Self::key(id))
    }

    /// All endpoints, sorted by creation time (ids are random, so sort on
    /// the timestamp).
    pub fn list(&self) -> Result<Vec<McpEndpoint>> {
        let mut endpoints: Vec<McpEndpoint> = self
            .kv
            .list("mcp:endpoint:")?
            .into_iter()
            .filter_map(|(_, raw)| serde_json::from_str(&raw).ok())
            .collect();
        endpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(endpoints)
    }

    /// The oldest live endpoint delivering to `chat_id`, used to infer the
    /// tenant for `/dev` feedback.
    pub fn oldest_for_chat(&self, chat_id: &ChatId) -> Result<Option<McpEndpoint>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|e| !e.revoked && &e.chat_id == chat_id))
    }

    /// Authenticate a bearer secret against a tenant. Constant-time
    /// comparison; `None` for unknown ids, revoked tenants, and bad secrets
    /// alike — callers answer 401 without distinguishing.
    pub fn verify(&self, id: &EndpointId, bearer: &str) -> Result<Option<McpEndpoint>> {
        let Some(endpoint) = self.get(id)? else {
            return Ok(None);
        };
        if endpoint.revoked {
            return Ok(None);
        }
        let matches: bool = endpoint
            .secret
            .as_bytes()
            .ct_eq(bearer.as_bytes())
            .into();
        Ok(matches.then_some(endpoint))
    }

    /// Revoke a tenant. Holds the per-endpoint admin lock across the
    /// read-modify-write.
    pub async fn revoke(&self, id: &EndpointId) -> Result<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut endpoint) = self.get(id)? else {
            return Ok(false);
        };
        endpoint.revoked = true;
        self.kv.set_json(&Self::key(id), &endpoint)?;
        info!(endpoint_id = %id, "mcp endpoint revoked");
        Ok(true)
    }

    pub async fn delete(&self, id: &EndpointId) -> Result<bool> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        let existed = self.kv.del(&Self::key(id))?;
        if existed {
            info!(endpoint_id = %id, "mcp endpoint deleted");
        }
        Ok(existed)
    }
}

/// 64 hex chars of randomness. Long enough that the redaction layer's
/// hex-blob rule also masks it if it ever strays into a log argument.
fn generate_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}
