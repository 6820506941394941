// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level hub runner, shared by `main` and integration tests.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roost_core::tmux::TmuxControl;

use crate::bridge::Bridges;
use crate::config::HubConfig;
use crate::manager::SessionManager;
use crate::registry::ExecutorRegistry;
use crate::store::SessionStore;
use crate::transport::{build_router, AppState};

/// Initialize the global tracing subscriber from config.
pub fn init_tracing(config: &HubConfig) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / ROOST_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("ROOST_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Wire the store, manager, and registry together into shared state.
///
/// Split from [`run`] so integration tests can build a router against an
/// in-memory store without binding a socket.
pub fn build_state(config: HubConfig, store: Arc<SessionStore>) -> Arc<AppState> {
    let tmux = TmuxControl::with_socket(config.tmux_socket.clone());
    let bridges = Arc::new(Bridges::new(tmux.clone(), config.linger()));
    let manager = SessionManager::new(
        Arc::clone(&store),
        tmux,
        bridges,
        config.data_dir.clone(),
        config.ai_command.clone(),
    );
    let registry = ExecutorRegistry::new(
        store,
        config.executor_token.clone(),
        config.heartbeat_interval(),
        config.rpc_timeout(),
    );
    manager.set_registry(Arc::clone(&registry));
    // The registry reconciles inventories through the manager.
    registry.set_adoption_sink(Arc::clone(&manager) as Arc<dyn crate::registry::AdoptionSink>);

    Arc::new(AppState {
        config,
        manager,
        registry,
        shutdown: CancellationToken::new(),
    })
}

/// Run the hub until shutdown.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    init_tracing(&config);

    // Fail fast when the terminal multiplexer is unusable.
    let tmux = TmuxControl::with_socket(config.tmux_socket.clone());
    let version = tmux.preflight()?;
    info!(%version, "terminal multiplexer ready");

    let store = Arc::new(SessionStore::open(&config.data_dir)?);
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config, store);

    let shutdown = state.shutdown.clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        }
    });

    info!("roost listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
