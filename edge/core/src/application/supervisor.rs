// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server-role supervisor: brings the control-plane components up in
//! dependency order and tears them down on cancellation.
//!
//! Order: PKI & secrets -> storage driver -> bootstrap finalize -> KV
//! bridge -> registrar + tunnel -> supervisor HTTPS listener. The
//! in-process control plane (API server, scheduler, controllers) is an
//! external collaborator that consumes the KV bridge's loopback listener;
//! everything it needs is serving before this function reports ready.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_edge_tunnel::server::TunnelServer;

use crate::application::bootstrap::BootstrapCoordinator;
use crate::application::encryption::SecretsEncryptionService;
use crate::application::registrar::NodeRegistrar;
use crate::domain::config::ServerConfig;
use crate::domain::datastore::Datastore;
use crate::domain::node::{JoinRequest, NodeConfigBlob, NodeRole};
use crate::infrastructure::cred::{ensure_node_password, NodePasswdFile};
use crate::infrastructure::datastore::{self, DriverOptions, RaftOptions};
use crate::infrastructure::pki::{LeafKind, SecretsManager};
use crate::infrastructure::token::ClusterToken;
use crate::presentation::{api, grpc};

/// Shared state behind the supervisor API and admin surface.
pub struct ServerContext {
    pub config: ServerConfig,
    pub secrets: Arc<SecretsManager>,
    pub datastore: Arc<dyn Datastore>,
    pub registrar: Arc<NodeRegistrar>,
    pub encryption: Arc<SecretsEncryptionService>,
    pub tunnel: Arc<TunnelServer>,
    pub token: Arc<RwLock<ClusterToken>>,
    pub coordinator: BootstrapCoordinator,
    pub node_name: String,
    pub advertised_address: String,
}

pub fn local_node_name(configured: Option<&str>) -> String {
    match configured {
        Some(name) => name.to_string(),
        None => hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "aegis-edge-node".to_string())
            .to_lowercase(),
    }
}

/// Run the server role until cancelled.
pub async fn run_server(config: ServerConfig, cancel: CancellationToken) -> Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    let node_name = local_node_name(config.node_name.as_deref());

    let coordinator = BootstrapCoordinator::new(&config.data_dir);
    let bootstrap = coordinator
        .prepare(&config)
        .await
        .context("cluster bootstrap failed")?;

    // Trips when the datastore stays unreachable past the driver's retry
    // window; distinct from `cancel` so the exit code reflects the failure.
    let fault = CancellationToken::new();

    let raft = if config.datastore_endpoint.starts_with("raft://") {
        // The raft planes are guarded by a secret derived from the cluster
        // token so a foreign node cannot join the replication group.
        let derived = hex::encode(Sha256::digest(
            format!("raft:{}", bootstrap.token.secret).as_bytes(),
        ));
        Some(RaftOptions::parse(&config.datastore_endpoint, derived)?)
    } else {
        None
    };
    let datastore = datastore::open(
        &config.datastore_endpoint,
        &config.data_dir,
        DriverOptions {
            compact_interval: std::time::Duration::from_secs(config.compact_interval_secs),
            compact_retention: config.compact_retention,
            shutdown: Some(fault.clone()),
        },
        raft,
    )
    .await
    .context("opening datastore")?;

    coordinator.finalize(&bootstrap, &datastore).await?;

    let encryption = Arc::new(SecretsEncryptionService::load_or_init(
        &config.data_dir,
        config.secrets_encryption,
    )?);
    if encryption.enabled() {
        info!(stage = %encryption.status().stage, "secrets encryption enabled");
    }
    if config.disable_network_policy {
        info!("network-policy controller hand-off disabled");
    }

    let token = Arc::new(RwLock::new(bootstrap.token.clone()));
    let advertised_address = advertised_address(&config, &node_name);
    let registrar = Arc::new(NodeRegistrar::new(
        bootstrap.secrets.clone(),
        NodePasswdFile::new(&config.data_dir),
        datastore.clone(),
        token.clone(),
        NodeConfigBlob {
            cluster_dns: config.cluster_dns.clone(),
            cluster_domain: config.cluster_domain.clone(),
            pod_cidr: config.cluster_cidr.clone(),
        },
    ));

    let tunnel = TunnelServer::new();
    // Listener contract: only enqueue under the table lock; a task drains.
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<(String, bool)>();
    tunnel.add_listener(Box::new(move |client, added| {
        let _ = events_tx.send((client.to_string(), added));
    }));
    tokio::spawn(async move {
        while let Some((client, added)) = events_rx.recv().await {
            if added {
                info!(node = %client, "tunnel up");
            } else {
                info!(node = %client, "tunnel down");
            }
        }
    });

    // The server registers itself so agents discover every control-plane
    // endpoint through the registration records; its own credential drives
    // the peer links below.
    let own_password =
        ensure_node_password(&config.data_dir).context("server node password")?;
    let raw_token = token.read().secret.clone();
    let self_join = registrar
        .register(
            &raw_token,
            JoinRequest {
                name: node_name.clone(),
                password: own_password,
                role: NodeRole::Server,
                capabilities: vec!["control-plane".to_string()],
                advertised_address: Some(advertised_address.clone()),
            },
        )
        .await
        .context("registering local server node")?;

    // KV bridge on loopback for the in-process control plane.
    let kv_addr: SocketAddr = config
        .kv_listen
        .parse()
        .with_context(|| format!("invalid kv listen address {}", config.kv_listen))?;
    {
        let datastore = datastore.clone();
        let options = grpc::KvBridgeOptions {
            compact_passthrough: config.kv_compact_passthrough,
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = grpc::serve(kv_addr, datastore, options, cancel).await {
                warn!(error = %e, "kv bridge terminated");
            }
        });
    }

    let context = Arc::new(ServerContext {
        config: config.clone(),
        secrets: bootstrap.secrets.clone(),
        datastore: datastore.clone(),
        registrar,
        encryption,
        tunnel: tunnel.clone(),
        token,
        coordinator,
        node_name,
        advertised_address,
    });

    let (cert, key) = bootstrap.secrets.leaf_pem(LeafKind::ServingSupervisor)?;
    let tls = RustlsConfig::from_pem(cert.into_bytes(), key.into_bytes())
        .await
        .context("loading supervisor tls material")?;
    let listen = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });
    }
    spawn_peer_links(context.clone(), &self_join.access_token, cancel.clone())?;

    let router = api::router(context);
    info!(listen = %listen, "supervisor api listening");
    let server = tokio::spawn(
        axum_server::bind_rustls(listen, tls)
            .handle(handle)
            .serve(router.into_make_service()),
    );

    info!("control plane ready");
    let faulted = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = fault.cancelled() => true,
    };

    cancel.cancel();
    tunnel.close_all();
    datastore.close().await;
    let _ = server.await;
    if faulted {
        anyhow::bail!("datastore became unreachable; exiting for supervisor restart");
    }
    info!("server shut down");
    Ok(())
}

fn advertised_address(config: &ServerConfig, node_name: &str) -> String {
    let host = config
        .tls_sans
        .first()
        .map(String::as_str)
        .unwrap_or(node_name);
    format!("https://{}:{}", host, config.listen_port)
}

/// Keep an outbound peer link to every other control-plane server so dials
/// for agents connected elsewhere can be forwarded. The endpoint set is
/// re-read from the registration records on an interval; each link carries
/// this server's own node credential and reconnects with backoff.
fn spawn_peer_links(
    context: Arc<ServerContext>,
    bearer: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let ca_pem = context.secrets.ca_cert_pem(crate::infrastructure::pki::CaKind::Server)?;
    let tls = crate::application::agent::tls_config_for(&ca_pem)?;
    let bearer = bearer.to_string();

    tokio::spawn(async move {
        let mut links: std::collections::HashMap<String, CancellationToken> =
            std::collections::HashMap::new();
        loop {
            let endpoints = context
                .registrar
                .server_endpoints()
                .await
                .unwrap_or_default();
            links.retain(|endpoint, link_cancel| {
                if endpoints.contains(endpoint) {
                    true
                } else {
                    link_cancel.cancel();
                    false
                }
            });
            for endpoint in endpoints {
                if endpoint == context.advertised_address || links.contains_key(&endpoint) {
                    continue;
                }
                info!(peer = %endpoint, "establishing control-plane peer link");
                let link_cancel = cancel.child_token();
                links.insert(endpoint.clone(), link_cancel.clone());
                let tunnel = context.tunnel.clone();
                let tls = tls.clone();
                let bearer = bearer.clone();
                tokio::spawn(async move {
                    let ws_url = format!(
                        "{}/v1-edge/connect",
                        endpoint.replacen("https://", "wss://", 1).trim_end_matches('/')
                    );
                    let peer_key =
                        format!("{}{endpoint}", aegis_edge_tunnel::server::PEER_KEY_PREFIX);
                    let mut delay = std::time::Duration::from_secs(1);
                    loop {
                        if link_cancel.is_cancelled() {
                            return;
                        }
                        match aegis_edge_tunnel::client::connect_socket(&ws_url, &bearer, tls.clone())
                            .await
                        {
                            Ok(socket) => {
                                delay = std::time::Duration::from_secs(1);
                                if let Err(e) = tunnel.serve_peer_outbound(&peer_key, socket).await {
                                    warn!(peer = %endpoint, error = %e, "peer link ended");
                                }
                            }
                            Err(e) => {
                                warn!(peer = %endpoint, error = %e, "peer link connect failed");
                            }
                        }
                        tokio::select! {
                            _ = link_cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(std::time::Duration::from_secs(30));
                    }
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {}
            }
        }
    });
    Ok(())
}
