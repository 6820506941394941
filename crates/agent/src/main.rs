// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::Ordering;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use roost_agent::config::AgentConfig;
use roost_agent::control::{self, Outcome};
use roost_agent::handlers::AgentContext;
use roost_agent::{upgrade, IS_UPGRADING, UPGRADE_EXIT_CODE};

fn init_tracing(config: &AgentConfig) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() {
    let config = AgentConfig::parse();
    init_tracing(&config);

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    // TLS provider for artifact fetches over https.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ctx = AgentContext::new(config.clone());
    match ctx.tmux.preflight() {
        Ok(version) => info!(%version, "terminal multiplexer ready"),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    // SIGINT/SIGTERM: preserve the upgrade exit code mid-upgrade so the
    // supervisor still restarts us cleanly.
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            if IS_UPGRADING.load(Ordering::Acquire) {
                std::process::exit(UPGRADE_EXIT_CODE);
            }
            shutdown.cancel();
        }
    });

    match control::run(ctx, shutdown).await {
        Outcome::Shutdown => {
            info!("agent shutting down");
        }
        Outcome::Upgrade => {
            if let Err(e) = upgrade::perform(&config).await {
                error!("upgrade failed: {e:#}");
            }
            // Exit 42 either way; the supervisor restarts us onto
            // whichever binary is in place.
            std::process::exit(UPGRADE_EXIT_CODE);
        }
    }
}
