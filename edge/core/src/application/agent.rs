// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent-role supervisor.
//!
//! Order: endpoint load balancer -> node registration -> credential
//! install -> container runtime wrapper + tunnel clients. The local kubelet
//! shim is an external collaborator; it is pointed at the loopback load
//! balancer and uses the installed node credential.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_edge_tunnel::client::{loopback_authorizer, run_client, ClientOptions};
use aegis_edge_tunnel::lb::{self, LoadBalancer};

use crate::domain::config::AgentConfig;
use crate::domain::node::{JoinRequest, JoinResponse, NodeRole};
use crate::infrastructure::cred::ensure_node_password;
use crate::infrastructure::runtime::ContainerRuntime;
use crate::infrastructure::token;

const JOIN_ATTEMPTS: u32 = 10;
const ENDPOINT_REFRESH: Duration = Duration::from_secs(30);

/// Run the agent role until cancelled.
pub async fn run_agent(config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    let node_name = crate::application::supervisor::local_node_name(config.node_name.as_deref());
    let password = ensure_node_password(&config.data_dir).context("node password")?;
    token::persist(&config.data_dir.join("agent").join("token"), &config.token)?;

    let join = join_control_plane(&config, &node_name, &password).await?;
    install_node_credentials(&config.data_dir, &join)?;
    info!(node = %join.node_name, "joined cluster");

    // Endpoint load balancer: the one API address local components use.
    let initial_endpoint = authority_of(&config.server_url)?;
    let balancer = LoadBalancer::new(vec![initial_endpoint]);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.lb_port))
        .await
        .with_context(|| format!("binding loopback load balancer on port {}", config.lb_port))?;
    {
        let balancer = balancer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = lb::serve(balancer, listener, cancel).await {
                warn!(error = %e, "load balancer terminated");
            }
        });
    }

    // Container runtime wrapper: wait for the daemon, keep going if it is
    // managed out-of-band and shows up later.
    match ContainerRuntime::connect(config.runtime_socket.as_deref()) {
        Ok(runtime) => {
            if let Err(e) = runtime.wait_ready(&cancel).await {
                warn!(error = %e, "container runtime not ready; continuing without it");
            }
        }
        Err(e) => warn!(error = %e, "container runtime unavailable"),
    }

    let tls = tls_config_for(&join.server_ca_pem)?;
    let fleet = TunnelFleet::new(tls.clone(), join.access_token.clone(), cancel.clone());
    fleet.sync(vec![config.server_url.clone()]);

    // Refresh the endpoint set from the server-role node list so the fleet
    // can change without an agent restart.
    let refresh_client = pinned_http_client(&join.server_ca_pem)?;
    let refresh_cancel = cancel.clone();
    let refresh_token = join.access_token.clone();
    let refresh_seed = config.server_url.clone();
    let refresh_balancer = balancer.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => return,
                _ = tokio::time::sleep(ENDPOINT_REFRESH) => {}
            }
            let urls = {
                let mut discovered = Vec::new();
                for base in std::iter::once(refresh_seed.clone()).chain(fleet.urls()) {
                    match fetch_endpoints(&refresh_client, &base, &refresh_token).await {
                        Ok(urls) if !urls.is_empty() => {
                            discovered = urls;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(endpoint = %base, error = %e, "endpoint refresh failed"),
                    }
                }
                discovered
            };
            if urls.is_empty() {
                continue;
            }
            let authorities: Vec<String> = urls
                .iter()
                .filter_map(|u| authority_of(u).ok())
                .collect();
            refresh_balancer.update(authorities);
            fleet.sync(urls);
        }
    });

    info!(lb_port = config.lb_port, "agent ready");
    cancel.cancelled().await;
    info!("agent shut down");
    Ok(())
}

/// POST the join request, retrying transient failures with backoff.
///
/// A name conflict means someone else's password is bound to our desired
/// name (the registrar accepts a matching password silently), so the agent
/// retries under a suffixed name a few times before giving up. An
/// authentication rejection is terminal.
async fn join_control_plane(
    config: &AgentConfig,
    node_name: &str,
    password: &str,
) -> Result<JoinResponse> {
    // The server certificate cannot be verified before the CA arrives with
    // the join response; the cluster token authenticates the exchange.
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let url = format!(
        "{}/v1-edge/node/register",
        config.server_url.trim_end_matches('/')
    );
    let mut request = JoinRequest {
        name: node_name.to_string(),
        password: password.to_string(),
        role: NodeRole::Agent,
        capabilities: Vec::new(),
        advertised_address: None,
    };

    let mut delay = Duration::from_secs(1);
    let mut name_attempts = 0;
    for attempt in 1..=JOIN_ATTEMPTS {
        let response = client
            .post(&url)
            .bearer_auth(&config.token)
            .json(&request)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                return Ok(response.json::<JoinResponse>().await?);
            }
            Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("join rejected: {body}");
            }
            Ok(response) if response.status() == reqwest::StatusCode::CONFLICT => {
                name_attempts += 1;
                if name_attempts > 3 {
                    anyhow::bail!(
                        "node name {} and its suffixed variants are taken",
                        node_name
                    );
                }
                let suffix: u16 = rand::random();
                request.name = format!("{node_name}-{suffix:04x}");
                warn!(name = %request.name, "node name taken; retrying with suffix");
                continue;
            }
            Ok(response) => {
                warn!(status = %response.status(), attempt, "join attempt failed");
            }
            Err(e) => warn!(error = %e, attempt, "join attempt failed"),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(15));
    }
    anyhow::bail!("could not join {} after {JOIN_ATTEMPTS} attempts", config.server_url)
}

fn install_node_credentials(data_dir: &Path, join: &JoinResponse) -> Result<()> {
    let tls_dir = data_dir.join("agent").join("tls");
    fs::create_dir_all(&tls_dir)?;
    fs::write(tls_dir.join("client-node.crt"), &join.client_cert_pem)?;
    let key_path = tls_dir.join("client-node.key");
    fs::write(&key_path, &join.client_key_pem)?;
    fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
    fs::write(tls_dir.join("server-ca.crt"), &join.server_ca_pem)?;

    let config_path = data_dir.join("agent").join("node-config.yaml");
    fs::write(config_path, serde_yaml::to_string(&join.config)?)?;
    Ok(())
}

fn authority_of(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("url has no host: {url}"))?;
    let port = parsed.port().unwrap_or(6443);
    Ok(format!("{host}:{port}"))
}

pub(crate) fn tls_config_for(ca_pem: &str) -> Result<Arc<rustls::ClientConfig>> {
    use rustls_pki_types::pem::PemObject;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pki_types::CertificateDer::pem_slice_iter(ca_pem.as_bytes()) {
        roots
            .add(cert.context("parsing server ca certificate")?)
            .context("adding server ca to trust store")?;
    }
    Ok(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

fn pinned_http_client(ca_pem: &str) -> Result<reqwest::Client> {
    // Server certificates carry the advertised addresses in their SANs
    // (`--tls-san`), so normal hostname verification applies.
    Ok(reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes())?)
        .build()?)
}

async fn fetch_endpoints(
    client: &reqwest::Client,
    base: &str,
    bearer: &str,
) -> Result<Vec<String>> {
    let url = format!("{}/v1-edge/endpoints", base.trim_end_matches('/'));
    let response = client.get(&url).bearer_auth(bearer).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("endpoint list answered {}", response.status());
    }
    Ok(response.json::<Vec<String>>().await?)
}

/// One tunnel client per control-plane endpoint, reconciled against the
/// refreshed endpoint set.
struct TunnelFleet {
    entries: Mutex<std::collections::HashMap<String, CancellationToken>>,
    tls: Arc<rustls::ClientConfig>,
    bearer: String,
    parent_cancel: CancellationToken,
}

impl TunnelFleet {
    fn new(tls: Arc<rustls::ClientConfig>, bearer: String, parent_cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(std::collections::HashMap::new()),
            tls,
            bearer,
            parent_cancel,
        })
    }

    fn urls(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Reconcile the set of endpoint tunnels. An empty set is ignored for
    /// the same reason the load balancer ignores one.
    fn sync(self: &Arc<Self>, urls: Vec<String>) {
        if urls.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        entries.retain(|url, cancel| {
            if urls.contains(url) {
                true
            } else {
                info!(endpoint = %url, "dropping tunnel endpoint");
                cancel.cancel();
                false
            }
        });
        for url in urls {
            if entries.contains_key(&url) {
                continue;
            }
            let ws_url = format!(
                "{}/v1-edge/connect",
                url.replacen("https://", "wss://", 1).trim_end_matches('/')
            );
            let cancel = self.parent_cancel.child_token();
            entries.insert(url.clone(), cancel.clone());
            info!(endpoint = %url, "adding tunnel endpoint");
            let options = ClientOptions {
                url: ws_url,
                bearer_token: self.bearer.clone(),
                tls: self.tls.clone(),
                authorizer: loopback_authorizer(),
            };
            tokio::spawn(run_client(options, cancel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_extraction() {
        assert_eq!(
            authority_of("https://10.0.0.1:6443").unwrap(),
            "10.0.0.1:6443"
        );
        assert_eq!(authority_of("https://cp.example").unwrap(), "cp.example:6443");
        assert!(authority_of("not a url").is_err());
    }
}
