use std::{net::SocketAddr, sync::Arc, time::Duration};

use clap::Parser;
use tracing::{info, warn};
use wing_relay::{
    config::{AppConfig, NodeRole},
    gossip::{spawn_edge_loops, spawn_login_loops},
    registry::WingRegistry,
    routes::build_router,
    state::{AppState, Node},
    store::build_store,
    telemetry::init_tracing,
};

#[derive(Debug, Parser)]
#[command(name = "wing-relay", about = "Wing relay node (login or edge)")]
struct Cli {
    /// Overrides BIND_ADDR.
    #[arg(long)]
    bind: Option<String>,
    /// Overrides NODE_ROLE.
    #[arg(long, value_parser = ["login", "edge"])]
    role: Option<String>,
    /// Overrides LOGIN_URL.
    #[arg(long)]
    login_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut cfg = AppConfig::from_env();
    if let Some(bind) = cli.bind {
        cfg.bind_addr = bind;
    }
    match cli.role.as_deref() {
        Some("edge") => cfg.node_role = NodeRole::Edge,
        Some("login") => cfg.node_role = NodeRole::Login,
        _ => {}
    }
    if let Some(url) = cli.login_url {
        cfg.login_url = Some(url.trim_end_matches('/').to_string());
    }
    init_tracing(cfg.log_filter.as_deref());

    let store = build_store(&cfg).await;
    let state = AppState::build(cfg, store)?;
    let config = Arc::clone(&state.config);

    let loops = match &state.node {
        Node::Edge(edge) => spawn_edge_loops(
            Arc::clone(edge),
            config.sync_interval(),
            config.wing_sync_interval(),
        ),
        Node::Login(login) => vec![spawn_login_loops(
            Arc::clone(login),
            config.wing_sync_interval(),
        )],
    };

    let registry = state.registry.clone();
    let app = build_router(state);
    let addr: SocketAddr = config.bind_addr.parse()?;
    info!(role = config.node_role.as_str(), machine_id = %config.machine_id, "wing relay listening on {addr}");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry, config.write_timeout()))
    .await?;

    for handle in loops {
        handle.abort();
    }
    Ok(())
}

/// Resolves on ctrl-c after every wing connection has been asked to close.
async fn shutdown_signal(registry: WingRegistry, deadline: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(wings = registry.len(), "shutting down; closing wing connections");
    registry.close_all("relay shutting down", deadline).await;
}
