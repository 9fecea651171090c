// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server side of the node-join protocol.
//!
//! Validates the presented cluster token, binds the node name to its
//! password on first use, issues the node-scoped credential (client
//! certificate plus a bearer token for the tunnel), and persists a
//! registration record in the datastore.

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::datastore::{Datastore, DatastoreError};
use crate::domain::node::{
    validate_node_name, JoinRequest, JoinResponse, NodeConfigBlob, NodeRegistration, NodeRole,
    RegistrarError,
};
use crate::infrastructure::cred::NodePasswdFile;
use crate::infrastructure::pki::{CaKind, SecretsManager};
use crate::infrastructure::token::ClusterToken;

/// Internal keyspace for registration records.
const REGISTRATION_PREFIX: &str = "/aegis/registrations/";

/// Node bearer tokens are reissued on every join; a year bounds the damage
/// of a leaked one.
const NODE_TOKEN_VALIDITY_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Serialize, Deserialize)]
struct NodeClaims {
    sub: String,
    iss: String,
    iat: i64,
    exp: i64,
}

pub struct NodeRegistrar {
    secrets: Arc<SecretsManager>,
    passwd: NodePasswdFile,
    datastore: Arc<dyn Datastore>,
    /// Shared with the supervisor so an administrative token rotation takes
    /// effect for joins immediately.
    token: Arc<parking_lot::RwLock<ClusterToken>>,
    config_blob: NodeConfigBlob,
}

impl NodeRegistrar {
    pub fn new(
        secrets: Arc<SecretsManager>,
        passwd: NodePasswdFile,
        datastore: Arc<dyn Datastore>,
        token: Arc<parking_lot::RwLock<ClusterToken>>,
        config_blob: NodeConfigBlob,
    ) -> Self {
        Self {
            secrets,
            passwd,
            datastore,
            token,
            config_blob,
        }
    }

    /// Constant-time check of a presented raw token against the current
    /// cluster token.
    pub fn verify_cluster_token(&self, presented: &str) -> bool {
        match ClusterToken::parse(presented) {
            Ok(parsed) => self.token.read().matches_secret(&parsed.secret),
            Err(_) => false,
        }
    }

    /// Handle one join request. The caller has already stripped transport
    /// concerns; `presented_token` is the raw token string from the request.
    pub async fn register(
        &self,
        presented_token: &str,
        request: JoinRequest,
    ) -> Result<JoinResponse, RegistrarError> {
        if !self.verify_cluster_token(presented_token) {
            return Err(RegistrarError::InvalidToken);
        }
        validate_node_name(&request.name)?;
        self.passwd.verify_or_record(&request.name, &request.password)?;

        let (client_cert_pem, client_key_pem) = self
            .secrets
            .issue(
                CaKind::Client,
                &format!("system:node:{}", request.name),
                "system:nodes",
                &[],
                false,
            )
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;
        let access_token = self.issue_node_token(&request.name)?;
        let server_ca_pem = self
            .secrets
            .ca_cert_pem(CaKind::Server)
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;

        self.persist_registration(&request).await?;
        info!(node = %request.name, role = ?request.role, "node registered");
        metrics::counter!("aegis_edge_registrar_joins_total").increment(1);

        Ok(JoinResponse {
            node_name: request.name,
            client_cert_pem,
            client_key_pem,
            server_ca_pem,
            access_token,
            config: self.config_blob.clone(),
        })
    }

    async fn persist_registration(&self, request: &JoinRequest) -> Result<(), RegistrarError> {
        let key = format!("{}{}", REGISTRATION_PREFIX, request.name);
        let record = NodeRegistration {
            name: request.name.clone(),
            password_hash: crate::infrastructure::cred::hash_password(&request.password),
            role: request.role,
            capabilities: request.capabilities.clone(),
            advertised_address: request.advertised_address.clone(),
            registered_at: Utc::now(),
        };
        let body = serde_json::to_vec(&record).map_err(|e| RegistrarError::Store(e.to_string()))?;

        // Create-or-replace with CAS retry; re-joins refresh the record.
        loop {
            match self.datastore.get(&key, 0).await {
                Ok((_, None)) => match self.datastore.create(&key, &body, 0).await {
                    Ok(_) => return Ok(()),
                    Err(DatastoreError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(RegistrarError::Store(e.to_string())),
                },
                Ok((_, Some(existing))) => {
                    let (_, _, ok) = self
                        .datastore
                        .update(&key, &body, existing.mod_revision, 0)
                        .await
                        .map_err(|e| RegistrarError::Store(e.to_string()))?;
                    if ok {
                        return Ok(());
                    }
                }
                Err(e) => return Err(RegistrarError::Store(e.to_string())),
            }
        }
    }

    /// Addresses of every registered server-role node, for agents
    /// refreshing their endpoint set.
    pub async fn server_endpoints(&self) -> Result<Vec<String>, RegistrarError> {
        let (_, records) = self
            .datastore
            .list(REGISTRATION_PREFIX, "", 0, 0)
            .await
            .map_err(|e| RegistrarError::Store(e.to_string()))?;
        let mut endpoints = Vec::new();
        for kv in records {
            let Ok(record) = serde_json::from_slice::<NodeRegistration>(&kv.value) else {
                continue;
            };
            if record.role == NodeRole::Server {
                if let Some(addr) = record.advertised_address {
                    endpoints.push(addr);
                }
            }
        }
        endpoints.sort();
        endpoints.dedup();
        Ok(endpoints)
    }

    /// Bearer token a node presents on the tunnel upgrade, signed with the
    /// cluster's service-account key.
    fn issue_node_token(&self, node_name: &str) -> Result<String, RegistrarError> {
        let key_pem = self
            .secrets
            .service_account_key_pem()
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;
        let key = EncodingKey::from_ed_pem(key_pem.as_bytes())
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;
        let now = Utc::now().timestamp();
        let claims = NodeClaims {
            sub: node_name.to_string(),
            iss: "aegis-edge".to_string(),
            iat: now,
            exp: now + NODE_TOKEN_VALIDITY_SECS,
        };
        encode(&Header::new(Algorithm::EdDSA), &claims, &key)
            .map_err(|e| RegistrarError::Issuance(e.to_string()))
    }

    /// Verify a node bearer token; returns the node name it is scoped to.
    pub fn verify_node_token(&self, token: &str) -> Result<String, RegistrarError> {
        let public_pem = self
            .secrets
            .service_account_public_pem()
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;
        let key = DecodingKey::from_ed_pem(public_pem.as_bytes())
            .map_err(|e| RegistrarError::Issuance(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&["aegis-edge"]);
        let data = decode::<NodeClaims>(token, &key, &validation)
            .map_err(|_| RegistrarError::InvalidToken)?;
        Ok(data.claims.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::datastore::sqlite::SqliteBackend;
    use crate::infrastructure::datastore::{DriverOptions, SqlDriver};

    async fn registrar(dir: &tempfile::TempDir) -> (NodeRegistrar, Arc<dyn Datastore>) {
        let secrets = Arc::new(SecretsManager::open(dir.path()).unwrap());
        secrets.ensure_all(&[]).unwrap();
        let backend = SqliteBackend::open(&dir.path().join("state.db")).await.unwrap();
        let datastore: Arc<dyn Datastore> =
            SqlDriver::open(backend, DriverOptions::default()).await.unwrap();
        let registrar = NodeRegistrar::new(
            secrets,
            NodePasswdFile::new(dir.path()),
            datastore.clone(),
            Arc::new(parking_lot::RwLock::new(
                ClusterToken::parse("testsecret").unwrap(),
            )),
            NodeConfigBlob {
                cluster_dns: "10.43.0.10".to_string(),
                cluster_domain: "cluster.local".to_string(),
                pod_cidr: "10.42.0.0/24".to_string(),
            },
        );
        (registrar, datastore)
    }

    fn join(name: &str, password: &str) -> JoinRequest {
        JoinRequest {
            name: name.to_string(),
            password: password.to_string(),
            role: NodeRole::Agent,
            capabilities: vec![],
            advertised_address: None,
        }
    }

    #[tokio::test]
    async fn test_join_issues_credentials_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let (registrar, datastore) = registrar(&dir).await;

        let response = registrar
            .register("testsecret", join("edge-01", "pw"))
            .await
            .unwrap();
        assert_eq!(response.node_name, "edge-01");
        assert!(response.client_cert_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(response.config.cluster_domain, "cluster.local");

        let name = registrar.verify_node_token(&response.access_token).unwrap();
        assert_eq!(name, "edge-01");
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (registrar, datastore) = registrar(&dir).await;
        let err = registrar
            .register("wrong", join("edge-01", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrarError::InvalidToken));
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_name_squat_is_rejected_and_owner_can_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let (registrar, datastore) = registrar(&dir).await;

        registrar
            .register("testsecret", join("edge-01", "pw-a"))
            .await
            .unwrap();
        let err = registrar
            .register("testsecret", join("edge-01", "pw-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrarError::NameConflict(_)));
        // The original holder re-joins fine.
        registrar
            .register("testsecret", join("edge-01", "pw-a"))
            .await
            .unwrap();
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_server_endpoints_lists_server_roles() {
        let dir = tempfile::tempdir().unwrap();
        let (registrar, datastore) = registrar(&dir).await;

        registrar
            .register("testsecret", join("agent-01", "pw"))
            .await
            .unwrap();
        let mut server_join = join("server-02", "pw2");
        server_join.role = NodeRole::Server;
        server_join.advertised_address = Some("https://10.0.0.2:6443".to_string());
        registrar.register("testsecret", server_join).await.unwrap();

        let endpoints = registrar.server_endpoints().await.unwrap();
        assert_eq!(endpoints, vec!["https://10.0.0.2:6443".to_string()]);
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_old_token_fails_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = Arc::new(SecretsManager::open(dir.path()).unwrap());
        secrets.ensure_all(&[]).unwrap();
        let backend = SqliteBackend::open(&dir.path().join("state.db")).await.unwrap();
        let datastore: Arc<dyn Datastore> =
            SqlDriver::open(backend, DriverOptions::default()).await.unwrap();
        let shared = Arc::new(parking_lot::RwLock::new(
            ClusterToken::parse("old-secret").unwrap(),
        ));
        let registrar = NodeRegistrar::new(
            secrets,
            NodePasswdFile::new(dir.path()),
            datastore.clone(),
            shared.clone(),
            NodeConfigBlob {
                cluster_dns: "10.43.0.10".to_string(),
                cluster_domain: "cluster.local".to_string(),
                pod_cidr: "10.42.0.0/24".to_string(),
            },
        );

        registrar
            .register("old-secret", join("edge-01", "pw"))
            .await
            .unwrap();
        *shared.write() = ClusterToken::parse("new-secret").unwrap();

        let err = registrar
            .register("old-secret", join("edge-02", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrarError::InvalidToken));
        registrar
            .register("new-secret", join("edge-02", "pw"))
            .await
            .unwrap();
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_forged_bearer_token_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (registrar, datastore) = registrar(&dir).await;
        assert!(registrar.verify_node_token("not-a-jwt").is_err());
        datastore.close().await;
    }
}
