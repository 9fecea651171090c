// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `aegis-edge server` - run a control-plane node.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use aegis_edge_core::ServerConfig;

#[derive(Args)]
pub struct ServerArgs {
    /// Path to a YAML configuration file; flags override its values
    #[arg(short, long, value_name = "FILE", env = "AEGIS_EDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Initialize a new cluster (HA datastores only need this on the first server)
    #[arg(long)]
    cluster_init: bool,

    /// URL of an existing server to join as an additional control-plane node
    #[arg(long, value_name = "URL")]
    join: Option<String>,

    /// Cluster token (generated on first boot when omitted)
    #[arg(long, env = "AEGIS_EDGE_TOKEN")]
    token: Option<String>,

    /// Datastore endpoint: empty = embedded, postgres://..., raft://...
    #[arg(long, value_name = "ENDPOINT")]
    datastore_endpoint: Option<String>,

    /// Additional subject-alternative names for serving certificates
    #[arg(long = "tls-san", value_name = "NAME")]
    tls_san: Vec<String>,

    /// Node name (defaults to the hostname)
    #[arg(long)]
    node_name: Option<String>,

    /// Supervisor/API listen port
    #[arg(long, value_name = "PORT")]
    listen_port: Option<u16>,

    /// Loopback address for the KV bridge
    #[arg(long, value_name = "ADDR")]
    kv_listen: Option<String>,

    /// Cluster DNS address handed to joining nodes
    #[arg(long)]
    cluster_dns: Option<String>,

    /// Cluster domain handed to joining nodes
    #[arg(long)]
    cluster_domain: Option<String>,

    /// Pod CIDR range handed to joining nodes
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// Enable envelope encryption of confidential objects at rest
    #[arg(long)]
    secrets_encryption: bool,

    /// Skip the network-policy controller hand-off
    #[arg(long)]
    disable_network_policy: bool,

    /// Forward client-issued compaction requests to the datastore driver
    #[arg(long)]
    kv_compact_passthrough: bool,
}

impl ServerArgs {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str::<ServerConfig>(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => ServerConfig::default(),
        };

        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if self.cluster_init {
            config.cluster_init = true;
        }
        if self.join.is_some() {
            config.join_url = self.join;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        if let Some(endpoint) = self.datastore_endpoint {
            config.datastore_endpoint = endpoint;
        }
        if !self.tls_san.is_empty() {
            config.tls_sans = self.tls_san;
        }
        if self.node_name.is_some() {
            config.node_name = self.node_name;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(kv_listen) = self.kv_listen {
            config.kv_listen = kv_listen;
        }
        if let Some(dns) = self.cluster_dns {
            config.cluster_dns = dns;
        }
        if let Some(domain) = self.cluster_domain {
            config.cluster_domain = domain;
        }
        if let Some(cidr) = self.cluster_cidr {
            config.cluster_cidr = cidr;
        }
        if self.secrets_encryption {
            config.secrets_encryption = true;
        }
        if self.disable_network_policy {
            config.disable_network_policy = true;
        }
        if self.kv_compact_passthrough {
            config.kv_compact_passthrough = true;
        }
        Ok(config)
    }
}

pub async fn run(args: ServerArgs) -> Result<()> {
    let config = args.into_config()?;
    let cancel = super::shutdown_token();
    aegis_edge_core::run_server(config, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ServerArgs,
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "listen_port: 7443\ncluster_dns: 10.50.0.10\n").unwrap();

        let harness = Harness::parse_from([
            "aegis-edge",
            "--config",
            path.to_str().unwrap(),
            "--listen-port",
            "8443",
            "--cluster-init",
        ]);
        let config = harness.args.into_config().unwrap();
        // Flag wins over file; untouched file values survive.
        assert_eq!(config.listen_port, 8443);
        assert_eq!(config.cluster_dns, "10.50.0.10");
        assert!(config.cluster_init);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let harness = Harness::parse_from(["aegis-edge"]);
        let config = harness.args.into_config().unwrap();
        assert_eq!(config.listen_port, 6443);
        assert_eq!(config.kv_listen, "127.0.0.1:2379");
    }
}
