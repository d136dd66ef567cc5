//! Process entry point: load config, open the store, and start every
//! concurrency domain — orchestrator, skill dispatcher, MCP gateway +
//! engine + sweeper, Telegram adapter, and the KV expiry sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_agent::openai::OpenAiGateway;
use weft_agent::{AssistantAgent, ToolAgent};
use weft_bus::envelope::topics;
use weft_bus::{Bus, Kv};
use weft_core::config::{ConfigHandle, WeftConfig};
use weft_mcp::{build_router, ConfirmationStore, EndpointStore, McpEngine, McpState};
use weft_orchestrator::{Orchestrator, SkillDispatcher};
use weft_skills::skills::default_registry;
use weft_skills::{AuditLog, SandboxRunner};
use weft_tasks::TaskStore;
use weft_telegram::TelegramAdapter;

#[derive(Parser)]
#[command(name = "weft-server", about = "Event-driven assistant orchestration fabric")]
struct Cli {
    /// Config file path (default: ~/.weft/weft.toml, WEFT_* env overrides).
    #[arg(long)]
    config: Option<String>,

    /// Stable worker identity for task claims. Random per process when
    /// unset.
    #[arg(long)]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft=info,weft_server=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // File + env first; the KV overlay needs the store open, so it follows.
    let mut config = match WeftConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(code = e.code(), error = %e, "configuration unreadable");
            std::process::exit(1);
        }
    };

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(std::path::Path::new(&config.sandbox.workspace_root).join("files"))?;

    let kv = Arc::new(Kv::new(rusqlite::Connection::open(&config.database.path)?)?);

    // KV rows have the highest resolution priority.
    let overlay: Vec<(String, String)> = kv
        .list("config:")?
        .into_iter()
        .map(|(k, v)| (k.trim_start_matches("config:").to_string(), v))
        .collect();
    if let Err(e) = config.overlay_kv(&overlay) {
        error!(code = e.code(), error = %e, "bad config override in KV store");
        std::process::exit(1);
    }

    // Missing model or channel coordinates are fatal at startup.
    if let Err(e) = config.validate() {
        error!(code = e.code(), error = %e, "configuration incomplete");
        std::process::exit(1);
    }

    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));
    info!(worker_id, "starting weft");

    let bus = Arc::new(Bus::new(Arc::clone(&kv)));
    let tasks = Arc::new(TaskStore::new(Arc::clone(&kv)));
    let audit = Arc::new(AuditLog::new(rusqlite::Connection::open(
        &config.database.path,
    )?)?);

    let registry = Arc::new(default_registry(&config.sandbox, Arc::clone(&tasks)));
    info!(skills = registry.len(), "skill registry populated");

    let gateway: Arc<dyn weft_agent::ModelGateway> = Arc::new(OpenAiGateway::new(&config.model));
    let fallback: Option<Arc<dyn weft_agent::ModelGateway>> =
        OpenAiGateway::fallback(&config.model).map(|g| Arc::new(g) as _);
    let assistant = Arc::new(AssistantAgent::new(gateway, fallback, config.model.clone()));
    let tool_agent = Arc::new(ToolAgent::new(
        Arc::clone(&registry),
        SandboxRunner::new(config.sandbox.clone(), Arc::clone(&audit)),
    ));

    let mcp_bind = config.mcp.bind.clone();
    let mcp_port = config.mcp.port;
    let telegram_config = config.telegram.clone();
    let rate_limit = config.rate_limit.clone();
    let admin_token = config.mcp.admin_token.clone();

    let handle = ConfigHandle::new(config);
    let cancel = CancellationToken::new();

    // Orchestrator + skill dispatcher.
    let orchestrator = Arc::new(Orchestrator::new(
        worker_id.clone(),
        Arc::clone(&bus),
        Arc::clone(&tasks),
        assistant,
        Arc::clone(&registry),
        Arc::clone(&audit),
        handle.clone(),
    ));
    let _ = orchestrator.start(cancel.child_token());

    let dispatcher = Arc::new(SkillDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&tasks),
        tool_agent,
    ));
    let _ = dispatcher.start(cancel.child_token());

    // MCP gateway: HTTP surface, bus engine, and the confirmation sweeper.
    let endpoints = Arc::new(EndpointStore::new(Arc::clone(&kv)));
    let confirmations = Arc::new(ConfirmationStore::new(Arc::clone(&kv)));

    let engine = Arc::new(McpEngine::new(
        Arc::clone(&bus),
        Arc::clone(&endpoints),
        Arc::clone(&confirmations),
    ));
    let _ = engine.start(cancel.child_token());
    tokio::spawn(weft_mcp::confirm::run_sweeper(
        Arc::clone(&confirmations),
        Arc::clone(&bus),
        cancel.child_token(),
    ));

    let mcp_state = Arc::new(McpState::new(
        Arc::clone(&bus),
        endpoints,
        confirmations,
        Arc::clone(&audit),
        rate_limit,
        admin_token,
    ));
    let router = build_router(mcp_state);
    let addr: SocketAddr = format!("{mcp_bind}:{mcp_port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "mcp gateway listening");
    let http_cancel = cancel.child_token();
    tokio::spawn(async move {
        let shutdown = async move { http_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %e, "mcp gateway exited");
        }
    });

    // Telegram adapter, when configured.
    if let Some(tg) = telegram_config {
        let adapter = TelegramAdapter::new(&tg.bot_token, Arc::clone(&bus), handle.clone());
        tokio::spawn(adapter.run(cancel.child_token()));
    } else {
        warn!("telegram channel not configured; only MCP traffic will flow");
    }

    // KV expiry sweep: terminal tasks, lapsed claims, resolved confirmations.
    {
        let kv = Arc::clone(&kv);
        let sweep_cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                }
                if let Err(e) = kv.purge_expired() {
                    warn!(error = %e, "kv expiry sweep failed");
                }
            }
        });
    }

    // Restart requests ride the bus; ctrl-c works locally.
    let mut restart_sub = bus.subscribe(topics::RESTART_REQUESTED);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        msg = restart_sub.recv() => {
            if msg.is_ok() {
                info!("restart requested over the bus, shutting down");
            }
        }
    }

    cancel.cancel();
    // Give in-flight handlers a moment to observe the cancellation.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    info!("weft stopped");
    Ok(())
}
