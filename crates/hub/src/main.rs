// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use roost::config::HubConfig;

#[tokio::main]
async fn main() {
    let config = HubConfig::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    if let Err(e) = roost::run::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
