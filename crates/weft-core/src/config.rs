use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Hard cap on a serialized bus envelope.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024; // 64 KiB
/// Claim TTL on task ownership. Owners refresh every loop iteration.
pub const CLAIM_TTL_SECS: u64 = 60;
/// Terminal tasks are purged this long after their last update.
pub const TASK_TTL_SECS: u64 = 2 * 60 * 60; // 2 h

/// Top-level config (weft.toml + WEFT_* env overrides + KV overlay).
///
/// Resolution priority is KV store → environment → file: the file is merged
/// first, env second, and `overlay_kv` applies `config:<dotted.key>` rows on
/// top of the extracted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enables the autonomous tool loop. When false, tool requests are
    /// serialized into the reply as a diagnostic instead of executed.
    #[serde(default = "bool_true")]
    pub autonomous_mode: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Early-exit score in [0,1] compared against the model's self-rating.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    /// Task-wide deadline. Expiry marks the task failed and cancels any
    /// in-flight skill subprocess.
    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            autonomous_mode: true,
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            task_deadline_secs: default_task_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total budget for a streamed response, not per token.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// Stream tokens to the channel as they arrive. Off means one final
    /// reply per turn.
    #[serde(default)]
    pub streaming_enabled: bool,
    #[serde(default)]
    pub cloud_fallback_enabled: bool,
    /// Second provider tried only when `cloud_fallback_enabled` and the
    /// primary exhausted its retries.
    pub fallback: Option<FallbackModelConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            name: String::new(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            streaming_enabled: false,
            cloud_fallback_enabled: false,
            fallback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackModelConfig {
    pub base_url: String,
    pub name: String,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// N in the short-term window truncation.
    #[serde(default = "default_short_term_window")]
    pub short_term_window: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_window: default_short_term_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Default network policy for skills that do not override it.
    #[serde(default)]
    pub network_enabled: bool,
    /// Filesystem confinement root for skills declaring a fs scope.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default = "default_skill_timeout_secs")]
    pub timeout_secs: u64,
    /// Allowlisted shell commands get a tighter default.
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_enabled: false,
            workspace_root: default_workspace_root(),
            timeout_secs: default_skill_timeout_secs(),
            shell_timeout_secs: default_shell_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Numeric Telegram user ids permitted to talk to the bot.
    /// Deny-by-default: empty means no one (unless pairing_mode admits them).
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
    /// Admits new users via a /start handshake instead of the static list.
    #[serde(default)]
    pub pairing_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_capacity")]
    pub capacity: u32,
    #[serde(default = "default_rl_refill")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rl_capacity(),
            refill_per_sec: default_rl_refill(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the administrative endpoint-CRUD surface.
    pub admin_token: Option<String>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_max_iterations() -> u32 {
    8
}
fn default_quality_threshold() -> f32 {
    0.9
}
fn default_task_deadline_secs() -> u64 {
    600
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_stream_timeout_secs() -> u64 {
    300
}
fn default_short_term_window() -> usize {
    20
}
fn default_workspace_root() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.weft/workspace", home)
}
fn default_skill_timeout_secs() -> u64 {
    60
}
fn default_shell_timeout_secs() -> u64 {
    30
}
fn default_rl_capacity() -> u32 {
    5
}
fn default_rl_refill() -> f64 {
    0.5
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    18990
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.weft/weft.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.weft/weft.toml", home)
}

impl WeftConfig {
    /// Load config from a TOML file with WEFT_* env var overrides.
    ///
    /// Checks in order: explicit path argument, then ~/.weft/weft.toml.
    /// KV-store rows are overlaid separately via [`WeftConfig::overlay_kv`]
    /// once the store is open.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: WeftConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("WEFT_").split("_"))
            .extract()
            .map_err(|e| crate::error::WeftError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Apply `config:<dotted.key>` rows from the KV store on top of the
    /// snapshot. The store has the highest resolution priority.
    ///
    /// Unknown keys are logged and skipped; a bad value for a known key is a
    /// config error (it would silently change behavior otherwise).
    pub fn overlay_kv(&mut self, entries: &[(String, String)]) -> crate::error::Result<()> {
        for (key, value) in entries {
            self.apply_dotted(key, value)?;
        }
        Ok(())
    }

    fn apply_dotted(&mut self, key: &str, value: &str) -> crate::error::Result<()> {
        let bad = |k: &str, v: &str| {
            crate::error::WeftError::Config(format!("bad value for {}: {:?}", k, v))
        };
        match key {
            "orchestrator.autonomous_mode" => {
                self.orchestrator.autonomous_mode = value.parse().map_err(|_| bad(key, value))?;
            }
            "orchestrator.max_iterations" => {
                self.orchestrator.max_iterations = value.parse().map_err(|_| bad(key, value))?;
            }
            "orchestrator.quality_threshold" => {
                self.orchestrator.quality_threshold = value.parse().map_err(|_| bad(key, value))?;
            }
            "model.base_url" => self.model.base_url = value.to_string(),
            "model.name" => self.model.name = value.to_string(),
            "model.api_key" => self.model.api_key = value.to_string(),
            "cloud_fallback_enabled" => {
                self.model.cloud_fallback_enabled = value.parse().map_err(|_| bad(key, value))?;
            }
            "memory.short_term_window" => {
                self.memory.short_term_window = value.parse().map_err(|_| bad(key, value))?;
            }
            "sandbox.network_enabled" => {
                self.sandbox.network_enabled = value.parse().map_err(|_| bad(key, value))?;
            }
            "telegram.allowed_user_ids" => {
                let ids: std::result::Result<Vec<u64>, _> = value
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().parse())
                    .collect();
                if let Some(tg) = self.telegram.as_mut() {
                    tg.allowed_user_ids = ids.map_err(|_| bad(key, value))?;
                }
            }
            "telegram.pairing_mode" => {
                if let Some(tg) = self.telegram.as_mut() {
                    tg.pairing_mode = value.parse().map_err(|_| bad(key, value))?;
                }
            }
            "rate_limit.capacity" => {
                self.rate_limit.capacity = value.parse().map_err(|_| bad(key, value))?;
            }
            "rate_limit.refill_per_sec" => {
                self.rate_limit.refill_per_sec = value.parse().map_err(|_| bad(key, value))?;
            }
            other => {
                tracing::warn!(key = other, "ignoring unknown config key from KV store");
            }
        }
        Ok(())
    }

    /// Startup validation. Missing required coordinates are fatal.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.model.base_url.is_empty() {
            return Err(crate::error::WeftError::ConfigMissing(
                "model.base_url".to_string(),
            ));
        }
        if self.model.name.is_empty() {
            return Err(crate::error::WeftError::ConfigMissing(
                "model.name".to_string(),
            ));
        }
        if let Some(tg) = &self.telegram {
            if tg.bot_token.is_empty() {
                return Err(crate::error::WeftError::ConfigMissing(
                    "telegram.bot_token".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Extract the hot-reloadable subset.
    pub fn hot(&self) -> HotConfig {
        HotConfig {
            allowed_user_ids: self
                .telegram
                .as_ref()
                .map(|t| t.allowed_user_ids.clone())
                .unwrap_or_default(),
            max_iterations: self.orchestrator.max_iterations,
            quality_threshold: self.orchestrator.quality_threshold,
        }
    }
}

/// The whitelisted subset that may change at runtime without a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct HotConfig {
    pub allowed_user_ids: Vec<u64>,
    pub max_iterations: u32,
    pub quality_threshold: f32,
}

/// Immutable startup snapshot plus a watch handle for the hot subset.
///
/// Core workers read the snapshot; only the administrative surface publishes
/// updates through [`ConfigHandle::publish_hot`].
#[derive(Clone)]
pub struct ConfigHandle {
    snapshot: Arc<WeftConfig>,
    hot_tx: watch::Sender<HotConfig>,
}

impl ConfigHandle {
    pub fn new(config: WeftConfig) -> Self {
        let (hot_tx, _) = watch::channel(config.hot());
        Self {
            snapshot: Arc::new(config),
            hot_tx,
        }
    }

    pub fn snapshot(&self) -> &WeftConfig {
        &self.snapshot
    }

    /// Current hot values (falls back to the startup snapshot's view).
    pub fn hot(&self) -> HotConfig {
        self.hot_tx.borrow().clone()
    }

    /// Subscribe to hot-config updates.
    pub fn watch_hot(&self) -> watch::Receiver<HotConfig> {
        self.hot_tx.subscribe()
    }

    /// Publish a new hot subset. Administrative surface only.
    pub fn publish_hot(&self, hot: HotConfig) {
        // send_replace never fails even with zero receivers.
        self.hot_tx.send_replace(hot);
    }
}
