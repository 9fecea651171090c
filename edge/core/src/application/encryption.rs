// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secrets-encryption service: owns the persisted key ring, serializes the
//! rotation state machine, and runs the re-encryption pass over confidential
//! objects in the datastore.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::datastore::Datastore;
use crate::domain::secrets::{EncryptionCommand, EncryptionStage, SecretsError};
use crate::infrastructure::pki::keyring::Keyring;

/// Prefix holding the confidential objects the re-encryption pass rewrites.
const CONFIDENTIAL_PREFIX: &str = "/registry/secrets/";

/// Page size of the re-encryption scan.
const REENCRYPT_PAGE: i64 = 200;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedConfig {
    enabled: bool,
    ring: Keyring,
}

/// Snapshot returned by `secrets-encrypt status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionStatus {
    pub enabled: bool,
    pub stage: EncryptionStage,
    pub key_count: usize,
    pub write_key: Option<String>,
}

pub struct SecretsEncryptionService {
    path: PathBuf,
    enabled: bool,
    ring: ArcSwap<Keyring>,
    /// Serializes administrative advances; the ring itself stays readable.
    advance_lock: tokio::sync::Mutex<()>,
}

impl SecretsEncryptionService {
    /// Load `server/cred/encryption-config.json`, creating a fresh ring when
    /// encryption is enabled for the first time.
    pub fn load_or_init(data_dir: &Path, enabled: bool) -> Result<Self, SecretsError> {
        let path = data_dir
            .join("server")
            .join("cred")
            .join("encryption-config.json");
        let config = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<PersistedConfig>(&bytes)
                .map_err(|e| SecretsError::Envelope(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedConfig {
                enabled,
                ring: Keyring::new(),
            },
            Err(e) => return Err(SecretsError::Envelope(e.to_string())),
        };
        // A previously-enabled ring stays live even if the flag is dropped;
        // sealed objects must remain readable.
        let effective = enabled || config.enabled;
        let service = Self {
            path,
            enabled: effective,
            ring: ArcSwap::from_pointee(config.ring),
            advance_lock: tokio::sync::Mutex::new(()),
        };
        if effective {
            service.persist()?;
        }
        Ok(service)
    }

    fn persist(&self) -> Result<(), SecretsError> {
        let config = PersistedConfig {
            enabled: self.enabled,
            ring: (**self.ring.load()).clone(),
        };
        let body = serde_json::to_vec_pretty(&config)
            .map_err(|e| SecretsError::Envelope(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SecretsError::Envelope(e.to_string()))?;
        }
        fs::write(&self.path, body).map_err(|e| SecretsError::Envelope(e.to_string()))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .map_err(|e| SecretsError::Envelope(e.to_string()))?;
        Ok(())
    }

    fn publish(&self, ring: Keyring) -> Result<(), SecretsError> {
        self.ring.store(Arc::new(ring));
        self.persist()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Copy-on-write snapshot of the ring for readers.
    pub fn ring(&self) -> Arc<Keyring> {
        self.ring.load_full()
    }

    pub fn status(&self) -> EncryptionStatus {
        let ring = self.ring.load();
        EncryptionStatus {
            enabled: self.enabled,
            stage: ring.stage,
            key_count: ring.keys.len(),
            write_key: ring.write_key().ok().map(|k| k.name.clone()),
        }
    }

    /// Apply one administrative command. Commands arriving concurrently are
    /// serialized; a command valid only from another stage fails with the
    /// stage-mismatch error.
    pub async fn advance(
        &self,
        command: EncryptionCommand,
        datastore: &Arc<dyn Datastore>,
    ) -> Result<EncryptionStatus, SecretsError> {
        if !self.enabled {
            return Err(SecretsError::NotEnabled);
        }
        let _guard = self.advance_lock.lock().await;
        let current = self.ring.load_full();
        let next_stage = current.stage.advance(command)?;

        match command {
            EncryptionCommand::Prepare => {
                let mut ring = current.with_appended_key();
                ring.stage = next_stage;
                self.publish(ring)?;
                info!("encryption rotation prepared: new key appended, writers unchanged");
            }
            EncryptionCommand::Rotate => {
                let mut ring = current.with_promoted_key();
                ring.stage = next_stage;
                self.publish(ring)?;
                info!("encryption rotation: writers switched to the new key");
            }
            EncryptionCommand::Reencrypt => {
                let mut ring = (*current).clone();
                ring.stage = next_stage;
                self.publish(ring)?;
                let rewritten = self.reencrypt_all(datastore).await?;
                info!(rewritten, "re-encryption pass complete");

                let current = self.ring.load_full();
                let mut ring = (*current).clone();
                ring.stage = current.stage.advance(EncryptionCommand::Finish)?;
                self.publish(ring)?;

                // `reencrypt_finished` collapses to `start` once the retired
                // key is dropped from the ring.
                let current = self.ring.load_full();
                let mut ring = current.with_retired_keys();
                ring.stage = EncryptionStage::Start;
                self.publish(ring)?;
            }
            EncryptionCommand::Finish => {
                // Only issued internally by the re-encryption pass above.
                return Err(SecretsError::StageMismatch {
                    from: current.stage,
                    command,
                });
            }
        }
        Ok(self.status())
    }

    /// Rewrite every confidential object so the current write key is its
    /// write key. Values not yet sealed are sealed for the first time.
    async fn reencrypt_all(&self, datastore: &Arc<dyn Datastore>) -> Result<u64, SecretsError> {
        let mut rewritten = 0u64;
        let mut start_key = String::new();
        loop {
            let (_, page) = datastore
                .list(CONFIDENTIAL_PREFIX, &start_key, REENCRYPT_PAGE, 0)
                .await
                .map_err(|e| SecretsError::Envelope(e.to_string()))?;
            if page.is_empty() {
                return Ok(rewritten);
            }
            for kv in &page {
                let ring = self.ring.load();
                let plaintext = if Keyring::is_sealed(&kv.value) {
                    ring.open(&kv.value)?
                } else {
                    kv.value.clone()
                };
                let resealed = ring.seal(&plaintext)?;
                let (_, _, ok) = datastore
                    .update(&kv.key, &resealed, kv.mod_revision, kv.lease)
                    .await
                    .map_err(|e| SecretsError::Envelope(e.to_string()))?;
                if ok {
                    rewritten += 1;
                } else {
                    // A writer got there first; its write used the current
                    // write key, so the object needs no second pass.
                    warn!(key = %kv.key, "skipping re-encrypt: object changed mid-pass");
                }
            }
            if (page.len() as i64) < REENCRYPT_PAGE {
                return Ok(rewritten);
            }
            // Resume after the last key of the page.
            start_key = format!("{}\0", page.last().expect("page not empty").key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::datastore::sqlite::SqliteBackend;
    use crate::infrastructure::datastore::{DriverOptions, SqlDriver};

    async fn fixtures(
        dir: &tempfile::TempDir,
    ) -> (SecretsEncryptionService, Arc<dyn Datastore>) {
        let backend = SqliteBackend::open(&dir.path().join("state.db")).await.unwrap();
        let datastore: Arc<dyn Datastore> =
            SqlDriver::open(backend, DriverOptions::default()).await.unwrap();
        let service = SecretsEncryptionService::load_or_init(dir.path(), true).unwrap();
        (service, datastore)
    }

    #[tokio::test]
    async fn test_full_cycle_reports_stages_and_reencrypts() {
        let dir = tempfile::tempdir().unwrap();
        let (service, datastore) = fixtures(&dir).await;

        let sealed = service.ring().seal(b"credentials").unwrap();
        let rev = datastore
            .create("/registry/secrets/default/db", &sealed, 0)
            .await
            .unwrap();
        let old_write_key = service.status().write_key.unwrap();

        let status = service
            .advance(EncryptionCommand::Prepare, &datastore)
            .await
            .unwrap();
        assert_eq!(status.stage, EncryptionStage::Prepare);
        assert_eq!(status.key_count, 2);
        // Writers unchanged during prepare.
        assert_eq!(status.write_key.unwrap(), old_write_key);

        let status = service
            .advance(EncryptionCommand::Rotate, &datastore)
            .await
            .unwrap();
        assert_eq!(status.stage, EncryptionStage::Rotate);
        assert_ne!(status.write_key.clone().unwrap(), old_write_key);
        let new_write_key = status.write_key.unwrap();

        let status = service
            .advance(EncryptionCommand::Reencrypt, &datastore)
            .await
            .unwrap();
        // Collapsed back to start with a single-key ring.
        assert_eq!(status.stage, EncryptionStage::Start);
        assert_eq!(status.key_count, 1);
        assert_eq!(status.write_key.unwrap(), new_write_key);

        // The object was rewritten at a newer revision and still decrypts.
        let (_, kv) = datastore
            .get("/registry/secrets/default/db", 0)
            .await
            .unwrap();
        let kv = kv.unwrap();
        assert!(kv.mod_revision > rev);
        assert_eq!(service.ring().open(&kv.value).unwrap(), b"credentials");
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_rotate_from_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (service, datastore) = fixtures(&dir).await;
        let err = service
            .advance(EncryptionCommand::Rotate, &datastore)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::StageMismatch { .. }));
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_disabled_service_rejects_advances() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("state.db")).await.unwrap();
        let datastore: Arc<dyn Datastore> =
            SqlDriver::open(backend, DriverOptions::default()).await.unwrap();
        let service = SecretsEncryptionService::load_or_init(dir.path(), false).unwrap();
        assert!(!service.status().enabled);
        let err = service
            .advance(EncryptionCommand::Prepare, &datastore)
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::NotEnabled));
        datastore.close().await;
    }

    #[tokio::test]
    async fn test_ring_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (service, datastore) = fixtures(&dir).await;
        let sealed = service.ring().seal(b"v").unwrap();
        drop(service);

        let reloaded = SecretsEncryptionService::load_or_init(dir.path(), true).unwrap();
        assert_eq!(reloaded.ring().open(&sealed).unwrap(), b"v");
        datastore.close().await;
    }
}
