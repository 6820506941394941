// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Self-upgrade: fetch a new agent build from the hub and stage it over
//! the current executable. The caller exits with code 42 afterwards and
//! the supervisor restarts into the new binary.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::Ordering;

use anyhow::Context;

use crate::config::AgentConfig;
use crate::IS_UPGRADING;

/// Download and stage the new binary. Failures leave the current binary
/// untouched; the restart then comes back up on the old build.
pub async fn perform(config: &AgentConfig) -> anyhow::Result<()> {
    IS_UPGRADING.store(true, Ordering::Release);

    let base = config.url.clone().unwrap_or_default();
    let artifact_url = format!("{}/artifacts/roost-agent", base.trim_end_matches('/'));
    tracing::info!(%artifact_url, "fetching upgrade artifact");

    let response = reqwest::get(&artifact_url)
        .await
        .context("artifact fetch failed")?
        .error_for_status()
        .context("artifact fetch rejected")?;
    let bytes = response.bytes().await.context("artifact download failed")?;
    anyhow::ensure!(!bytes.is_empty(), "artifact is empty");

    let exe = std::env::current_exe().context("cannot locate current executable")?;
    let staged = exe.with_extension("new");

    let mut file = std::fs::File::create(&staged).context("cannot stage new binary")?;
    file.write_all(&bytes)?;
    file.flush()?;
    drop(file);

    let mut perms = std::fs::metadata(&staged)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&staged, perms)?;

    // Atomic on the same filesystem; the running process keeps its old
    // image until the supervisor restarts it.
    std::fs::rename(&staged, &exe).context("cannot replace executable")?;

    tracing::info!("upgrade staged, exiting for restart");
    Ok(())
}
