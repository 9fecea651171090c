// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod certificate;
pub mod secrets;
pub mod server;
pub mod snapshot;
pub mod token;

pub use agent::AgentArgs;
pub use certificate::CertificateCommand;
pub use secrets::SecretsEncryptArgs;
pub use server::ServerArgs;
pub use snapshot::SnapshotArgs;
pub use token::TokenArgs;

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Cancellation token wired to SIGINT/SIGTERM.
pub(crate) fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

/// Resolve the admin token: the flag/env value, or the stamped
/// `server/token` file when running on the server host.
pub(crate) fn admin_token(flag: Option<String>, data_dir: &Path) -> Result<String> {
    if let Some(token) = flag {
        return Ok(token);
    }
    let path = data_dir.join("server").join("token");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("no token given and {} is unreadable", path.display()))?;
    Ok(raw.trim().to_string())
}

/// HTTP client for the supervisor API on this host. The serving certificate
/// is cluster-issued, so verification is skipped for loopback admin calls;
/// the bearer token authenticates both directions of trust.
pub(crate) fn admin_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?)
}
