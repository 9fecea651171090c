// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node identity, the join protocol payloads, and registration records.
//!
//! A node binds its name to a per-node password on first join. Later joins
//! must present the same password; a different one is rejected as a name
//! squat rather than silently re-issuing credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Server,
    Agent,
}

/// Persisted registration record for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    /// Hex SHA-256 of the node password presented on first join.
    pub password_hash: String,
    pub role: NodeRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Advertised supervisor address for server-role nodes, used by agents
    /// to refresh their endpoint set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_address: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Body of the join POST an agent (or second server) sends to the registrar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    /// The node's generated password, or the one reused from a prior run.
    pub password: String,
    pub role: NodeRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_address: Option<String>,
}

/// Cluster-level settings handed to a node on successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigBlob {
    pub cluster_dns: String,
    pub cluster_domain: String,
    /// CIDR block the node may allocate pod addresses from.
    pub pod_cidr: String,
}

/// Successful join response: node-scoped credentials plus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub node_name: String,
    /// Client certificate issued under the client CA, scoped to this node.
    pub client_cert_pem: String,
    pub client_key_pem: String,
    /// Trust anchors for the server CA (all active generations).
    pub server_ca_pem: String,
    /// Bearer credential presented on the tunnel websocket upgrade.
    pub access_token: String,
    pub config: NodeConfigBlob,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("join token rejected")]
    InvalidToken,

    #[error("node name {0} is already bound to a different password")]
    NameConflict(String),

    #[error("invalid node name: {0}")]
    InvalidName(String),

    #[error("credential issuance failed: {0}")]
    Issuance(String),

    #[error("registration store error: {0}")]
    Store(String),
}

/// Node names become DNS labels and path components; restrict accordingly.
pub fn validate_node_name(name: &str) -> Result<(), RegistrarError> {
    if name.is_empty() || name.len() > 253 {
        return Err(RegistrarError::InvalidName(name.to_string()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    if !ok || name.starts_with('-') || name.ends_with('-') {
        return Err(RegistrarError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_node_name_accepts_dns_labels() {
        assert!(validate_node_name("edge-node-01").is_ok());
        assert!(validate_node_name("n0.rack2.example").is_ok());
    }

    #[test]
    fn test_validate_node_name_rejects_bad_input() {
        assert!(validate_node_name("").is_err());
        assert!(validate_node_name("UpperCase").is_err());
        assert!(validate_node_name("-leading").is_err());
        assert!(validate_node_name("trailing-").is_err());
        assert!(validate_node_name("sp ace").is_err());
    }
}
