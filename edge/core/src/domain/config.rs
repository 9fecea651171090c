// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Role Configuration Types
//
// Defines the configuration schema for the server and agent roles. Values
// layer flag > environment > YAML file > default; the CLI performs the
// layering and hands a resolved struct to the supervisor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/aegis-edge")
}

fn default_listen_port() -> u16 {
    6443
}

fn default_kv_listen() -> String {
    "127.0.0.1:2379".to_string()
}

fn default_cluster_dns() -> String {
    "10.43.0.10".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_cluster_cidr() -> String {
    "10.42.0.0/16".to_string()
}

fn default_lb_port() -> u16 {
    6444
}

fn default_compact_interval() -> u64 {
    60
}

fn default_compact_retention() -> i64 {
    1000
}

/// Server-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Supervisor/API listen port (TLS).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Loopback address the KV bridge serves the control plane on.
    #[serde(default = "default_kv_listen")]
    pub kv_listen: String,

    /// Datastore endpoint. Empty selects the embedded SQLite store;
    /// `postgres://` selects the shared relational store; `raft://` the
    /// embedded Raft-replicated store.
    #[serde(default)]
    pub datastore_endpoint: String,

    /// Initialize a new cluster instead of joining one.
    #[serde(default)]
    pub cluster_init: bool,

    /// URL of an existing server to join as an additional control-plane node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_url: Option<String>,

    /// Cluster token. Generated and persisted on first boot when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Extra subject-alternative names for the serving certificates.
    #[serde(default)]
    pub tls_sans: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default = "default_cluster_dns")]
    pub cluster_dns: String,

    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    #[serde(default = "default_cluster_cidr")]
    pub cluster_cidr: String,

    /// Enable envelope encryption of confidential objects at rest.
    #[serde(default)]
    pub secrets_encryption: bool,

    #[serde(default)]
    pub disable_network_policy: bool,

    /// Forward client-issued Compact requests to the driver instead of
    /// answering them as a no-op. The driver's own schedule always runs.
    #[serde(default)]
    pub kv_compact_passthrough: bool,

    /// Seconds between compaction passes.
    #[serde(default = "default_compact_interval")]
    pub compact_interval_secs: u64,

    /// Number of historic revisions retained by the compactor.
    #[serde(default = "default_compact_retention")]
    pub compact_retention: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_port: default_listen_port(),
            kv_listen: default_kv_listen(),
            datastore_endpoint: String::new(),
            cluster_init: false,
            join_url: None,
            token: None,
            tls_sans: Vec::new(),
            node_name: None,
            cluster_dns: default_cluster_dns(),
            cluster_domain: default_cluster_domain(),
            cluster_cidr: default_cluster_cidr(),
            secrets_encryption: false,
            disable_network_policy: false,
            kv_compact_passthrough: false,
            compact_interval_secs: default_compact_interval(),
            compact_retention: default_compact_retention(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_init && self.join_url.is_some() {
            return Err("--cluster-init and --join are mutually exclusive".to_string());
        }
        if self.join_url.is_some() && self.token.is_none() {
            return Err("joining an existing server requires a token".to_string());
        }
        if self.compact_retention < 0 {
            return Err("compaction retention must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Agent-role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// URL of any control-plane server, e.g. `https://10.0.0.1:6443`.
    pub server_url: String,

    pub token: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Loopback port of the endpoint load balancer the local components use
    /// as their API server address.
    #[serde(default = "default_lb_port")]
    pub lb_port: u16,

    /// Container runtime socket override; auto-detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_socket: Option<String>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("agent requires --server".to_string());
        }
        if !self.server_url.starts_with("https://") {
            return Err("--server must be an https:// URL".to_string());
        }
        if self.token.is_empty() {
            return Err("agent requires a join token".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_port, 6443);
        assert!(!config.kv_compact_passthrough);
    }

    #[test]
    fn test_cluster_init_excludes_join() {
        let config = ServerConfig {
            cluster_init: true,
            join_url: Some("https://10.0.0.1:6443".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_config_requires_https_server() {
        let config = AgentConfig {
            server_url: "http://10.0.0.1:6443".to_string(),
            token: "secret".to_string(),
            data_dir: default_data_dir(),
            node_name: None,
            lb_port: default_lb_port(),
            runtime_socket: None,
        };
        assert!(config.validate().is_err());
    }
}
