// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Bootstrap coordinator
//!
//! First boot: materialize the PKI, stamp the cluster token, seed the
//! datastore and mirror the shared PKI into it under a well-known key,
//! sealed with a key derived from the cluster token.
//!
//! Subsequent boots: load everything from disk, then reconcile the local
//! files against the datastore copy; the datastore wins any divergence.
//!
//! Joining servers: fetch the shared PKI from an existing server over TLS,
//! authenticating with the cluster token and pinning the cluster CA hash
//! when the token carries one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::domain::config::ServerConfig;
use crate::domain::datastore::{Datastore, DatastoreError};
use crate::infrastructure::pki::{BootstrapBlob, PkiError, SecretsManager};
use crate::infrastructure::token::{self, ClusterToken, TokenError};

/// Datastore key the sealed shared-PKI mirror lives under.
const BOOTSTRAP_KEY: &str = "/aegis/bootstrap/v1";

/// Seeded on first boot so a fresh cluster ranges a default namespace even
/// before the control plane writes anything.
const DEFAULT_NAMESPACE_KEY: &str = "/registry/namespaces/default";
const DEFAULT_NAMESPACE_BODY: &[u8] =
    br#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"default"}}"#;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("datastore error during bootstrap: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("join failed: {0}")]
    Join(String),

    #[error("join token rejected by {0}")]
    JoinUnauthorized(String),

    #[error("cluster CA does not match the hash pinned in the token")]
    CaPinMismatch,

    #[error("bootstrap data sealed with a different token")]
    SealMismatch,
}

/// What the coordinator hands back to the supervisor.
pub struct Bootstrap {
    pub secrets: Arc<SecretsManager>,
    pub token: ClusterToken,
    pub first_boot: bool,
}

pub struct BootstrapCoordinator {
    data_dir: PathBuf,
}

impl BootstrapCoordinator {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn token_path(&self) -> PathBuf {
        self.data_dir.join("server").join("token")
    }

    /// Phase one, before the datastore opens: PKI on disk plus the token.
    pub async fn prepare(&self, config: &ServerConfig) -> Result<Bootstrap, BootstrapError> {
        let first_boot = !self
            .data_dir
            .join("server")
            .join("tls")
            .join("cluster-ca.crt")
            .exists();

        let configured_token = match &config.token {
            Some(raw) => Some(ClusterToken::parse(raw)?),
            None => None,
        };

        if first_boot {
            if let Some(join_url) = &config.join_url {
                let presented = configured_token
                    .clone()
                    .ok_or_else(|| BootstrapError::Join("joining requires a token".to_string()))?;
                let blob = fetch_remote_blob(join_url, &presented).await?;
                let secrets = Arc::new(SecretsManager::open(&self.data_dir)?);
                secrets.install_blob(&blob)?;
                if let Some(pinned) = &presented.ca_hash {
                    if secrets.cluster_ca_hash()? != *pinned {
                        return Err(BootstrapError::CaPinMismatch);
                    }
                }
                // Leaves for this node are generated locally under the
                // shared CAs.
                secrets.ensure_all(&config.tls_sans)?;
                let rendered = presented.format_full(&secrets.cluster_ca_hash()?);
                token::persist(&self.token_path(), &rendered)?;
                info!(peer = %join_url, "joined existing control plane");
                return Ok(Bootstrap {
                    secrets,
                    token: presented,
                    first_boot: true,
                });
            }

            let secrets = Arc::new(SecretsManager::open(&self.data_dir)?);
            secrets.ensure_all(&config.tls_sans)?;
            let token = configured_token.unwrap_or_else(ClusterToken::generate);
            let rendered = token.format_full(&secrets.cluster_ca_hash()?);
            token::persist(&self.token_path(), &rendered)?;
            info!("first boot: pki generated, cluster token stamped");
            return Ok(Bootstrap {
                secrets,
                token,
                first_boot: true,
            });
        }

        // Subsequent boot: disk is the starting point.
        let secrets = Arc::new(SecretsManager::open(&self.data_dir)?);
        secrets.ensure_all(&config.tls_sans)?;
        secrets.warn_expiring();
        let token = match token::load(&self.token_path())? {
            Some(stored) => {
                if let Some(supplied) = configured_token {
                    if !stored.matches_secret(&supplied.secret) {
                        return Err(BootstrapError::Join(
                            "supplied token does not match the persisted cluster token".to_string(),
                        ));
                    }
                }
                stored
            }
            None => {
                return Err(BootstrapError::Join(
                    "data directory has pki but no cluster token".to_string(),
                ))
            }
        };
        Ok(Bootstrap {
            secrets,
            token,
            first_boot: false,
        })
    }

    /// Phase two, once the datastore is open: mirror or reconcile the
    /// shared PKI and seed well-known keys.
    pub async fn finalize(
        &self,
        bootstrap: &Bootstrap,
        datastore: &Arc<dyn Datastore>,
    ) -> Result<(), BootstrapError> {
        let (_, stored) = datastore.get(BOOTSTRAP_KEY, 0).await?;
        match stored {
            None => {
                let blob = bootstrap.secrets.bootstrap_blob()?;
                let sealed = seal_with_token(&bootstrap.token, &blob)?;
                match datastore.create(BOOTSTRAP_KEY, &sealed, 0).await {
                    Ok(_) => info!("shared pki mirrored into the datastore"),
                    // A peer server won the race; reconcile below next boot.
                    Err(DatastoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Some(kv) => {
                let blob = open_with_token(&bootstrap.token, &kv.value)?;
                let diverging = bootstrap.secrets.diverging_files(&blob)?;
                if !diverging.is_empty() {
                    warn!(
                        files = ?diverging,
                        "local pki diverges from the datastore copy; datastore wins"
                    );
                    bootstrap.secrets.install_blob(&blob)?;
                }
            }
        }

        if datastore.get(DEFAULT_NAMESPACE_KEY, 0).await?.1.is_none() {
            match datastore
                .create(DEFAULT_NAMESPACE_KEY, DEFAULT_NAMESPACE_BODY, 0)
                .await
            {
                Ok(_) | Err(DatastoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Rotate the cluster token: the old token is invalid immediately.
    /// The bootstrap mirror is resealed under the new token.
    pub async fn rotate_token(
        &self,
        secrets: &SecretsManager,
        datastore: &Arc<dyn Datastore>,
        new_secret: &str,
    ) -> Result<ClusterToken, BootstrapError> {
        let new_token = ClusterToken::parse(new_secret)?;
        let rendered = new_token.format_full(&secrets.cluster_ca_hash()?);
        token::persist(&self.token_path(), &rendered)?;

        let blob = secrets.bootstrap_blob()?;
        let sealed = seal_with_token(&new_token, &blob)?;
        loop {
            match datastore.get(BOOTSTRAP_KEY, 0).await? {
                (_, Some(kv)) => {
                    let (_, _, ok) = datastore
                        .update(BOOTSTRAP_KEY, &sealed, kv.mod_revision, 0)
                        .await?;
                    if ok {
                        break;
                    }
                }
                (_, None) => {
                    match datastore.create(BOOTSTRAP_KEY, &sealed, 0).await {
                        Ok(_) => break,
                        Err(DatastoreError::AlreadyExists(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        info!("cluster token rotated");
        Ok(new_token)
    }
}

/// Fetch the shared PKI from an existing server. The TLS certificate cannot
/// be verified yet (no CA on disk); trust is anchored by the CA hash pinned
/// in a full-format token, checked by the caller after installation.
async fn fetch_remote_blob(
    join_url: &str,
    token: &ClusterToken,
) -> Result<BootstrapBlob, BootstrapError> {
    let url = format!("{}/v1-edge/server-bootstrap", join_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| BootstrapError::Join(e.to_string()))?;
    let response = client
        .get(&url)
        .bearer_auth(&token.secret)
        .send()
        .await
        .map_err(|e| BootstrapError::Join(e.to_string()))?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(BootstrapError::JoinUnauthorized(join_url.to_string()));
    }
    if !response.status().is_success() {
        return Err(BootstrapError::Join(format!(
            "{} answered {}",
            join_url,
            response.status()
        )));
    }
    response
        .json::<BootstrapBlob>()
        .await
        .map_err(|e| BootstrapError::Join(e.to_string()))
}

#[derive(Serialize, Deserialize)]
struct SealedMirror {
    n: String,
    ct: String,
}

fn token_key(token: &ClusterToken) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(token.secret.as_bytes());
    *Key::<Aes256Gcm>::from_slice(&digest)
}

fn seal_with_token(token: &ClusterToken, blob: &BootstrapBlob) -> Result<Vec<u8>, BootstrapError> {
    use base64::Engine as _;
    let plaintext =
        serde_json::to_vec(blob).map_err(|e| BootstrapError::Join(e.to_string()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = Aes256Gcm::new(&token_key(token))
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| BootstrapError::SealMismatch)?;
    let sealed = SealedMirror {
        n: base64::engine::general_purpose::STANDARD.encode(nonce),
        ct: base64::engine::general_purpose::STANDARD.encode(ct),
    };
    serde_json::to_vec(&sealed).map_err(|e| BootstrapError::Join(e.to_string()))
}

fn open_with_token(token: &ClusterToken, sealed: &[u8]) -> Result<BootstrapBlob, BootstrapError> {
    use base64::Engine as _;
    let mirror: SealedMirror =
        serde_json::from_slice(sealed).map_err(|_| BootstrapError::SealMismatch)?;
    let decode = |s: &str| {
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|_| BootstrapError::SealMismatch)
    };
    let nonce = decode(&mirror.n)?;
    if nonce.len() != 12 {
        return Err(BootstrapError::SealMismatch);
    }
    let ct = decode(&mirror.ct)?;
    let plaintext = Aes256Gcm::new(&token_key(token))
        .decrypt(Nonce::from_slice(&nonce), ct.as_slice())
        .map_err(|_| BootstrapError::SealMismatch)?;
    serde_json::from_slice(&plaintext).map_err(|_| BootstrapError::SealMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::datastore::sqlite::SqliteBackend;
    use crate::infrastructure::datastore::{DriverOptions, SqlDriver};

    async fn datastore(dir: &tempfile::TempDir) -> Arc<dyn Datastore> {
        let backend = SqliteBackend::open(&dir.path().join("db").join("state.db"))
            .await
            .unwrap();
        SqlDriver::open(backend, DriverOptions::default()).await.unwrap()
    }

    fn config(token: Option<&str>) -> ServerConfig {
        ServerConfig {
            cluster_init: true,
            token: token.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_boot_populates_data_dir_and_seeds_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BootstrapCoordinator::new(dir.path());
        let bootstrap = coordinator.prepare(&config(Some("SECRET"))).await.unwrap();
        assert!(bootstrap.first_boot);
        assert!(bootstrap.token.matches_secret("SECRET"));

        // server/token persists the full format carrying the CA hash.
        let stored = token::load(&dir.path().join("server").join("token"))
            .unwrap()
            .unwrap();
        assert!(stored.matches_secret("SECRET"));
        assert!(stored.ca_hash.is_some());

        let store = datastore(&dir).await;
        coordinator.finalize(&bootstrap, &store).await.unwrap();
        let (_, namespaces) = store.list("/registry/namespaces/", "", 0, 0).await.unwrap();
        assert!(!namespaces.is_empty());
        let (_, mirror) = store.get(BOOTSTRAP_KEY, 0).await.unwrap();
        assert!(mirror.is_some());
        store.close().await;
    }

    #[tokio::test]
    async fn test_second_boot_reuses_material() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BootstrapCoordinator::new(dir.path());
        let first = coordinator.prepare(&config(Some("SECRET"))).await.unwrap();
        let ca = first.secrets.cluster_ca_hash().unwrap();
        drop(first);

        let second = coordinator.prepare(&config(None)).await.unwrap();
        assert!(!second.first_boot);
        assert_eq!(second.secrets.cluster_ca_hash().unwrap(), ca);
        assert!(second.token.matches_secret("SECRET"));
    }

    #[tokio::test]
    async fn test_second_boot_rejects_wrong_token() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BootstrapCoordinator::new(dir.path());
        drop(coordinator.prepare(&config(Some("SECRET"))).await.unwrap());
        let err = coordinator.prepare(&config(Some("OTHER"))).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Join(_)));
    }

    #[tokio::test]
    async fn test_mirror_reseals_on_token_rotation_and_rejects_old_token() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BootstrapCoordinator::new(dir.path());
        let bootstrap = coordinator.prepare(&config(Some("SECRET"))).await.unwrap();
        let store = datastore(&dir).await;
        coordinator.finalize(&bootstrap, &store).await.unwrap();

        let new_token = coordinator
            .rotate_token(&bootstrap.secrets, &store, "ROTATED")
            .await
            .unwrap();
        let (_, kv) = store.get(BOOTSTRAP_KEY, 0).await.unwrap();
        let sealed = kv.unwrap().value;
        assert!(open_with_token(&new_token, &sealed).is_ok());
        assert!(matches!(
            open_with_token(&bootstrap.token, &sealed),
            Err(BootstrapError::SealMismatch)
        ));
        store.close().await;
    }

    #[tokio::test]
    async fn test_finalize_reconciles_diverging_local_pki() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = BootstrapCoordinator::new(dir.path());
        let bootstrap = coordinator.prepare(&config(Some("SECRET"))).await.unwrap();
        let store = datastore(&dir).await;
        coordinator.finalize(&bootstrap, &store).await.unwrap();

        // Tamper with a local file; the next finalize restores the
        // datastore copy.
        let ca_path = dir
            .path()
            .join("server")
            .join("tls")
            .join("request-header-ca.crt");
        let original = std::fs::read_to_string(&ca_path).unwrap();
        std::fs::write(&ca_path, "-----BEGIN CERTIFICATE-----\ntampered\n-----END CERTIFICATE-----\n").unwrap();
        coordinator.finalize(&bootstrap, &store).await.unwrap();
        assert_eq!(std::fs::read_to_string(&ca_path).unwrap(), original);
        store.close().await;
    }
}
