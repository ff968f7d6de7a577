//! # switchboard
//!
//! Switchboard node binary: loads settings, wires the hub to a coordination
//! store when clustering is enabled, and serves WebSocket paths until
//! interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use switchboard_core::HandlerError;
use switchboard_server::{
    HandlerContext, Hub, HubConfig, MessageDispatcher, PathHandler, Session, SwitchboardServer,
};
use switchboard_store::{CoordinationStore, RedisStore};
use tracing::{info, warn};

/// Clustered WebSocket session and broadcast server.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Clustered WebSocket session and broadcast server")]
struct Cli {
    /// Settings file (defaults to `$SWITCHBOARD_CONFIG` or `./switchboard.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Join the cluster through the configured store (overrides settings).
    #[arg(long)]
    cluster: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// `/chat`: every message goes to every session on the path, cluster-wide.
struct ChatRoom;

#[async_trait]
impl PathHandler for ChatRoom {
    async fn on_message(
        &self,
        cx: &HandlerContext,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), HandlerError> {
        let _ = cx.broadcaster.broadcast(session.path(), text).await;
        Ok(())
    }
}

/// `/echo`: replies to the sender only.
struct Echo;

#[async_trait]
impl PathHandler for Echo {
    async fn on_message(
        &self,
        _cx: &HandlerContext,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), HandlerError> {
        session
            .send(text)
            .map_err(|e| HandlerError::failed(e.to_string()))
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = switchboard_settings::load_settings(cli.config.as_deref())
        .context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if cli.cluster {
        settings.cluster.enabled = true;
    }
    settings.validate().context("invalid settings")?;

    if cli.json_logs || settings.logging.json {
        switchboard_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        switchboard_core::logging::init_subscriber(&settings.logging.level);
    }

    let metrics = switchboard_server::metrics::install_recorder()
        .context("failed to install metrics recorder")?;

    let store: Option<Arc<dyn CoordinationStore>> = if settings.cluster.enabled {
        let redis = RedisStore::connect(&settings.cluster.store_url)
            .await
            .context("cluster enabled but the coordination store is unreachable")?;
        Some(Arc::new(redis))
    } else {
        None
    };

    let dispatcher = MessageDispatcher::new()
        .route("/chat", ChatRoom)
        .route("/echo", Echo);
    let hub = Hub::new(HubConfig::from_settings(&settings), dispatcher, store);
    info!(
        node_id = %hub.node_id(),
        clustered = settings.cluster.enabled,
        "starting switchboard node"
    );

    let bind_addr = settings.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    SwitchboardServer::new(hub)
        .with_metrics(metrics)
        .serve(listener, shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
