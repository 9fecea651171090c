// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Container-runtime wrapper for the agent role.
//!
//! The runtime daemon itself is an external collaborator; the agent only
//! supervises it: wait for the socket to answer, report the version, and
//! keep a handle for liveness probes.

use bollard::Docker;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),
}

pub struct ContainerRuntime {
    docker: Docker,
}

impl ContainerRuntime {
    /// Connect to the runtime socket (auto-detected unless overridden).
    pub fn connect(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::Unreachable(format!("{path}: {e}")))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::Unreachable(e.to_string()))?,
        };
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    /// Block until the runtime answers, with capped retry. Returns the
    /// reported version string.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<String, RuntimeError> {
        let mut delay = std::time::Duration::from_millis(500);
        let mut last_error = String::new();
        for _ in 0..12 {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Unreachable("cancelled".to_string()));
            }
            match self.docker.version().await {
                Ok(version) => {
                    let reported = version.version.unwrap_or_else(|| "unknown".to_string());
                    info!(version = %reported, "container runtime ready");
                    return Ok(reported);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(error = %last_error, "container runtime not ready; retrying");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(std::time::Duration::from_secs(5));
        }
        Err(RuntimeError::Unreachable(last_error))
    }
}
