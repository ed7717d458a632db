use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use chasqui_agent::{AgentRuntime, AnthropicProvider};
use chasqui_core::config::ChasquiConfig;
use chasqui_core::secrets::SecretStore;
use chasqui_engine::runtime::AgentWiring;
use chasqui_engine::{CloudSender, FlowRuntime};
use chasqui_flows::FlowCatalog;
use chasqui_queue::{Dispatcher, QueueEngine};
use chasqui_scheduler::SchedulerEngine;
use chasqui_sessions::SessionStore;
use chasqui_store::Store;
use chasqui_wire::crm::BitrixClient;
use chasqui_wire::CloudApiClient;
use clap::Parser;
use tracing::{error, info, warn};

mod app;
mod auth;
mod http;
mod ws;

/// Chasqui gateway: WhatsApp webhook ingress, flow engine, queue
/// dispatcher, schedulers and the operator realtime bus in one process.
#[derive(Debug, Parser)]
#[command(name = "chasqui-gateway", version)]
struct Args {
    /// Path to chasqui.toml (default: ~/.chasqui/chasqui.toml).
    #[arg(long)]
    config: Option<String>,
}

// Exit codes: 0 ok, 1 config/env failure, 2 irrecoverable runtime error.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chasqui=info,chasqui_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("CHASQUI_CONFIG").ok());

    let config = match ChasquiConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::from(1);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config: ChasquiConfig) -> anyhow::Result<()> {
    let secrets = SecretStore::new(config.security.process_secret.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let db_path = config.database.path.clone();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Separate connections per subsystem, same file, so each manager's
    // lock stays independent.
    let store = Arc::new(Store::open(&db_path).map_err(|e| anyhow::anyhow!("{e}"))?);
    let sessions = Arc::new(
        SessionStore::new(rusqlite::Connection::open(&db_path)?)
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let catalog = Arc::new(
        FlowCatalog::new(rusqlite::Connection::open(&db_path)?)
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );

    // One-time reconciliation: rewrite alias channel ids and merge the
    // duplicate conversations that uncovers.
    let aliases = store.connection_alias_map().map_err(|e| anyhow::anyhow!("{e}"))?;
    if !aliases.is_empty() {
        let merged = store
            .merge_alias_duplicates(&aliases)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        info!(aliases = aliases.len(), merged, "alias migration pass done");
    }
    store
        .ensure_default_status()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let wire = Arc::new(CloudApiClient::new(&config.provider).map_err(|e| anyhow::anyhow!("{e}"))?);
    let sender: Arc<dyn chasqui_engine::OutboundSender> = Arc::new(CloudSender::new(
        store.clone(),
        wire.clone(),
        secrets.clone(),
    ));

    let crm: Option<Arc<dyn chasqui_wire::crm::CrmAdapter>> = match &config.crm {
        Some(crm_config) => Some(Arc::new(
            BitrixClient::new(crm_config).map_err(|e| anyhow::anyhow!("{e}"))?,
        )),
        None => None,
    };

    let agent = config.agent.as_ref().map(|agent_config| AgentWiring {
        runtime: Arc::new(AgentRuntime::new(
            Arc::new(AnthropicProvider::new(
                agent_config.api_key.clone(),
                agent_config.base_url.clone(),
            )),
            agent_config.model.clone(),
        )),
        // Embedding index and OCR are external collaborators wired in by
        // deployment; without them the tools answer "not configured".
        ocr: None,
        knowledge: None,
        catalog_base_url: agent_config
            .catalog_base_url
            .clone()
            .unwrap_or_default(),
    });
    if agent.is_none() {
        warn!("no [agent] config: agent nodes will route to their error handle");
    }

    let (dispatcher, queue_handle) = Dispatcher::new(store.clone());
    let queue = Arc::new(QueueEngine::new(store.clone(), queue_handle));

    let engine = Arc::new(FlowRuntime::new(
        store.clone(),
        sessions.clone(),
        catalog.clone(),
        sender.clone(),
        queue.clone(),
        crm,
        agent,
        config.locale.utc_offset_minutes,
    ));

    let (scheduler, mut wake_rx) = SchedulerEngine::new(
        store.clone(),
        sessions.clone(),
        catalog.clone(),
        queue.clone(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Durable delay wake-ups flow from the scheduler into the engine.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(key) = wake_rx.recv().await {
                if let Err(e) = engine.resume_wakeup(&key).await {
                    warn!(key = %key, error = %e, "durable wake resume failed");
                }
            }
        });
    }

    let bind = config.server.bind.clone();
    let port = config.server.port;
    let state = Arc::new(app::AppState::new(
        config, secrets, store, sessions, catalog, engine, queue, wire, sender,
    ));
    tokio::spawn(ws::run_hub(state.clone()));

    let router = app::build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("chasqui gateway listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
