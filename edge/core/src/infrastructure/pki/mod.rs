// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # PKI & secrets manager
//!
//! Owns every file under `<data-dir>/server/tls`. Callers never read the
//! certificate files directly; they go through [`SecretsManager`], which
//! holds an exclusive inter-process lock on the directory for as long as it
//! lives.
//!
//! Four certificate authorities anchor the cluster: the cluster CA (root of
//! trust for the token hash), the server CA (serving certs), the client CA
//! (component and node client certs) and the request-header CA (front-proxy
//! clients). Rotating a CA appends a new trust anchor; the old one keeps
//! being served until cutover so existing leaves stay verifiable.

pub mod keyring;

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{info, warn};

use crate::domain::secrets::SecretScope;

/// Leaf certificates are reissued yearly; CAs last ten years.
const LEAF_VALIDITY_DAYS: i64 = 365;
const CA_VALIDITY_DAYS: i64 = 3650;

/// Startup warns about certificates expiring within this window.
pub const EXPIRY_WARNING_DAYS: i64 = 90;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("pki i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pki directory is locked by another process")]
    Locked,

    #[error("missing pki material: {0} (data directory from a previous version?)")]
    Missing(String),
}

impl From<rcgen::Error> for PkiError {
    fn from(err: rcgen::Error) -> Self {
        PkiError::Generation(err.to_string())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PkiError + '_ {
    move |source| PkiError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaKind {
    Cluster,
    Server,
    Client,
    RequestHeader,
}

impl CaKind {
    pub const ALL: [CaKind; 4] = [
        CaKind::Cluster,
        CaKind::Server,
        CaKind::Client,
        CaKind::RequestHeader,
    ];

    fn stem(self) -> &'static str {
        match self {
            CaKind::Cluster => "cluster-ca",
            CaKind::Server => "server-ca",
            CaKind::Client => "client-ca",
            CaKind::RequestHeader => "request-header-ca",
        }
    }

    fn common_name(self) -> &'static str {
        match self {
            CaKind::Cluster => "aegis-edge-cluster-ca",
            CaKind::Server => "aegis-edge-server-ca",
            CaKind::Client => "aegis-edge-client-ca",
            CaKind::RequestHeader => "aegis-edge-request-header-ca",
        }
    }
}

/// Leaf certificates the server materializes for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    /// Serves the etcd-compatible KV listener.
    ServingKv,
    /// Serves the supervisor/join HTTPS listener.
    ServingSupervisor,
    /// Client identity the supervisor uses towards its peers.
    ClientSupervisor,
}

impl LeafKind {
    pub const ALL: [LeafKind; 3] = [
        LeafKind::ServingKv,
        LeafKind::ServingSupervisor,
        LeafKind::ClientSupervisor,
    ];

    fn stem(self) -> &'static str {
        match self {
            LeafKind::ServingKv => "serving-kv",
            LeafKind::ServingSupervisor => "serving-supervisor",
            LeafKind::ClientSupervisor => "client-supervisor",
        }
    }

    fn issuer(self) -> CaKind {
        match self {
            LeafKind::ServingKv | LeafKind::ServingSupervisor => CaKind::Server,
            LeafKind::ClientSupervisor => CaKind::Client,
        }
    }

    fn server_auth(self) -> bool {
        !matches!(self, LeafKind::ClientSupervisor)
    }
}

/// One file of the shared PKI, as mirrored into the datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapFile {
    pub name: String,
    pub scope: SecretScope,
    pub content: String,
}

/// The shared PKI material a joining server fetches with the cluster token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapBlob {
    pub files: Vec<BootstrapFile>,
}

/// Exclusive advisory lock on the tls directory, held for the manager's
/// lifetime. Updates to the PKI files only ever happen under this lock.
struct DirLock {
    _file: fs::File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, PkiError> {
        let path = dir.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(PkiError::Locked);
        }
        Ok(Self { _file: file })
    }
}

pub struct SecretsManager {
    tls_dir: PathBuf,
    _lock: DirLock,
}

impl SecretsManager {
    /// Open the manager over `<data-dir>/server/tls`, taking the lock.
    pub fn open(data_dir: &Path) -> Result<Self, PkiError> {
        let tls_dir = data_dir.join("server").join("tls");
        fs::create_dir_all(&tls_dir).map_err(io_err(&tls_dir))?;
        let lock = DirLock::acquire(&tls_dir)?;
        Ok(Self {
            tls_dir,
            _lock: lock,
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.tls_dir.join(file)
    }

    fn cert_path(&self, stem: &str) -> PathBuf {
        self.path(&format!("{stem}.crt"))
    }

    fn key_path(&self, stem: &str) -> PathBuf {
        self.path(&format!("{stem}.key"))
    }

    fn write_private(&self, path: &Path, content: &str) -> Result<(), PkiError> {
        fs::write(path, content).map_err(io_err(path))?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err(path))?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<String, PkiError> {
        fs::read_to_string(path).map_err(io_err(path))
    }

    /// Generate every missing piece of material. Present files are left
    /// untouched, which makes this safe to run on every boot.
    pub fn ensure_all(&self, tls_sans: &[String]) -> Result<(), PkiError> {
        for kind in CaKind::ALL {
            if !self.cert_path(kind.stem()).exists() {
                self.generate_ca(kind)?;
            }
        }
        for kind in LeafKind::ALL {
            if !self.cert_path(kind.stem()).exists() {
                self.generate_leaf(kind, tls_sans)?;
            }
        }
        if !self.key_path("service-account").exists() {
            self.generate_service_account_key()?;
        }
        Ok(())
    }

    fn generate_ca(&self, kind: CaKind) -> Result<(), PkiError> {
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, kind.common_name());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(CA_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        fs::write(self.cert_path(kind.stem()), cert.pem())
            .map_err(io_err(&self.cert_path(kind.stem())))?;
        self.write_private(&self.key_path(kind.stem()), &key_pair.serialize_pem())?;
        info!(ca = kind.stem(), "generated certificate authority");
        Ok(())
    }

    /// Reconstruct a signing handle for a CA from its on-disk PEM pair.
    /// When the bundle carries several generations, the newest anchor (the
    /// first in the file) does the signing.
    fn load_ca(&self, kind: CaKind) -> Result<(Certificate, KeyPair), PkiError> {
        let cert_pem = self.read(&self.cert_path(kind.stem()))?;
        let key_pem = self.read(&self.key_path(kind.stem()))?;
        let first = first_pem_block(&cert_pem)
            .ok_or_else(|| PkiError::Missing(format!("{} certificate", kind.stem())))?;
        let key_pair = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&first)?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    fn generate_leaf(&self, kind: LeafKind, tls_sans: &[String]) -> Result<(), PkiError> {
        let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        sans.extend(tls_sans.iter().cloned());
        let (cert_pem, key_pem) = self.issue(
            kind.issuer(),
            &format!("aegis-edge-{}", kind.stem()),
            "aegis-edge",
            &sans,
            kind.server_auth(),
        )?;
        fs::write(self.cert_path(kind.stem()), cert_pem)
            .map_err(io_err(&self.cert_path(kind.stem())))?;
        self.write_private(&self.key_path(kind.stem()), &key_pem)?;
        info!(leaf = kind.stem(), "issued serving certificate");
        Ok(())
    }

    /// Issue a leaf under one of the CAs. Used both for the server's own
    /// material and for node-scoped client certificates at join time.
    pub fn issue(
        &self,
        issuer: CaKind,
        common_name: &str,
        organization: &str,
        sans: &[String],
        server_auth: bool,
    ) -> Result<(String, String), PkiError> {
        let (ca_cert, ca_key) = self.load_ca(issuer)?;
        let key_pair = KeyPair::generate()?;
        let mut params = CertificateParams::new(sans.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, organization);
        params.distinguished_name = dn;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![if server_auth {
            ExtendedKeyUsagePurpose::ServerAuth
        } else {
            ExtendedKeyUsagePurpose::ClientAuth
        }];
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(LEAF_VALIDITY_DAYS);

        let cert = params.signed_by(&key_pair, &ca_cert, &ca_key)?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Regenerate every leaf in place, keeping the CAs. `certificate rotate`.
    pub fn rotate_leaves(&self, tls_sans: &[String]) -> Result<(), PkiError> {
        for kind in LeafKind::ALL {
            self.generate_leaf(kind, tls_sans)?;
        }
        Ok(())
    }

    /// Rotate a CA: generate a new anchor and prepend it to the bundle so
    /// both generations are served during cutover. `certificate rotate-ca`.
    pub fn rotate_ca(&self, kind: CaKind) -> Result<(), PkiError> {
        let old_bundle = self.read(&self.cert_path(kind.stem()))?;
        self.generate_ca(kind)?;
        let new_cert = self.read(&self.cert_path(kind.stem()))?;
        let bundle = format!("{new_cert}{old_bundle}");
        fs::write(self.cert_path(kind.stem()), bundle)
            .map_err(io_err(&self.cert_path(kind.stem())))?;
        info!(ca = kind.stem(), "rotated certificate authority; old anchor retained for cutover");
        Ok(())
    }

    fn generate_service_account_key(&self) -> Result<(), PkiError> {
        use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        let signing = ed25519_dalek::SigningKey::generate(&mut rand_core::OsRng);
        let private = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| PkiError::Generation(e.to_string()))?;
        let public = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| PkiError::Generation(e.to_string()))?;
        self.write_private(&self.key_path("service-account"), private.as_str())?;
        fs::write(self.path("service-account.pub"), public)
            .map_err(io_err(&self.path("service-account.pub")))?;
        info!("generated service-account signing key");
        Ok(())
    }

    pub fn ca_cert_pem(&self, kind: CaKind) -> Result<String, PkiError> {
        self.read(&self.cert_path(kind.stem()))
    }

    pub fn leaf_pem(&self, kind: LeafKind) -> Result<(String, String), PkiError> {
        Ok((
            self.read(&self.cert_path(kind.stem()))?,
            self.read(&self.key_path(kind.stem()))?,
        ))
    }

    pub fn service_account_key_pem(&self) -> Result<String, PkiError> {
        self.read(&self.key_path("service-account"))
    }

    pub fn service_account_public_pem(&self) -> Result<String, PkiError> {
        self.read(&self.path("service-account.pub"))
    }

    /// Hex SHA-256 of the cluster CA bundle, embedded in full-format tokens
    /// so joining nodes can pin the cluster identity.
    pub fn cluster_ca_hash(&self) -> Result<String, PkiError> {
        let pem = self.ca_cert_pem(CaKind::Cluster)?;
        Ok(hex::encode(Sha256::digest(pem.as_bytes())))
    }

    /// Export the shared PKI for mirroring into the datastore and for
    /// handing to a joining server.
    pub fn bootstrap_blob(&self) -> Result<BootstrapBlob, PkiError> {
        let mut files = Vec::new();
        for kind in CaKind::ALL {
            files.push(BootstrapFile {
                name: format!("{}.crt", kind.stem()),
                scope: SecretScope::CertificateAuthority,
                content: self.read(&self.cert_path(kind.stem()))?,
            });
            files.push(BootstrapFile {
                name: format!("{}.key", kind.stem()),
                scope: SecretScope::CertificateAuthority,
                content: self.read(&self.key_path(kind.stem()))?,
            });
        }
        files.push(BootstrapFile {
            name: "service-account.key".to_string(),
            scope: SecretScope::ServiceAccount,
            content: self.service_account_key_pem()?,
        });
        files.push(BootstrapFile {
            name: "service-account.pub".to_string(),
            scope: SecretScope::ServiceAccount,
            content: self.service_account_public_pem()?,
        });
        Ok(BootstrapBlob { files })
    }

    /// Install shared PKI received from another server (join) or read back
    /// from the datastore (reconciliation). Existing files are overwritten:
    /// the datastore copy is authoritative.
    pub fn install_blob(&self, blob: &BootstrapBlob) -> Result<(), PkiError> {
        for file in &blob.files {
            let path = self.path(&file.name);
            if file.name.ends_with(".key") {
                self.write_private(&path, &file.content)?;
            } else {
                fs::write(&path, &file.content).map_err(io_err(&path))?;
            }
        }
        info!(files = blob.files.len(), "installed shared pki material");
        Ok(())
    }

    /// Compare local material against a datastore blob; lists names that
    /// differ so the boot path can reconcile (datastore wins).
    pub fn diverging_files(&self, blob: &BootstrapBlob) -> Result<Vec<String>, PkiError> {
        let mut diverging = Vec::new();
        for file in &blob.files {
            let path = self.path(&file.name);
            match fs::read_to_string(&path) {
                Ok(local) if local == file.content => {}
                Ok(_) | Err(_) => diverging.push(file.name.clone()),
            }
        }
        Ok(diverging)
    }

    /// Log a warning for any certificate inside the expiry window.
    pub fn warn_expiring(&self) {
        for kind in LeafKind::ALL {
            if let Ok(pem) = self.read(&self.cert_path(kind.stem())) {
                if let Some(days) = days_until_expiry(&pem) {
                    if days < EXPIRY_WARNING_DAYS {
                        warn!(
                            certificate = kind.stem(),
                            days_left = days,
                            "certificate expires soon; run `certificate rotate`"
                        );
                    }
                }
            }
        }
    }
}

/// Extract the first PEM block from a bundle.
fn first_pem_block(bundle: &str) -> Option<String> {
    let start = bundle.find("-----BEGIN")?;
    let end_marker = "-----END CERTIFICATE-----";
    let end = bundle.find(end_marker)? + end_marker.len();
    Some(bundle[start..end].to_string())
}

/// Best-effort days-to-expiry by parsing the cert with rcgen's loader.
fn days_until_expiry(pem: &str) -> Option<i64> {
    let first = first_pem_block(pem)?;
    let params = CertificateParams::from_ca_cert_pem(&first).ok()?;
    let remaining = params.not_after - OffsetDateTime::now_utc();
    Some(remaining.whole_days())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> SecretsManager {
        let manager = SecretsManager::open(dir.path()).unwrap();
        manager.ensure_all(&["edge.example".to_string()]).unwrap();
        manager
    }

    #[test]
    fn test_ensure_all_materializes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        for kind in CaKind::ALL {
            assert!(m.ca_cert_pem(kind).unwrap().contains("BEGIN CERTIFICATE"));
        }
        let (cert, key) = m.leaf_pem(LeafKind::ServingSupervisor).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
        assert!(m.service_account_key_pem().unwrap().contains("PRIVATE KEY"));
    }

    #[test]
    fn test_ensure_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let before = m.ca_cert_pem(CaKind::Cluster).unwrap();
        m.ensure_all(&[]).unwrap();
        assert_eq!(m.ca_cert_pem(CaKind::Cluster).unwrap(), before);
    }

    #[test]
    fn test_directory_lock_excludes_second_manager() {
        let dir = tempfile::tempdir().unwrap();
        let _m = manager(&dir);
        let err = SecretsManager::open(dir.path()).unwrap_err();
        assert!(matches!(err, PkiError::Locked));
    }

    #[test]
    fn test_issue_node_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let (cert, key) = m
            .issue(CaKind::Client, "system:node:edge-01", "system:nodes", &[], false)
            .unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_rotate_ca_appends_trust_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir);
        let before_hash = m.cluster_ca_hash().unwrap();
        m.rotate_ca(CaKind::Cluster).unwrap();
        let bundle = m.ca_cert_pem(CaKind::Cluster).unwrap();
        assert_eq!(bundle.matches("BEGIN CERTIFICATE").count(), 2);
        assert_ne!(m.cluster_ca_hash().unwrap(), before_hash);
    }

    #[test]
    fn test_bootstrap_blob_roundtrip() {
        let dir_a = tempfile::tempdir().unwrap();
        let m_a = manager(&dir_a);
        let blob = m_a.bootstrap_blob().unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let m_b = SecretsManager::open(dir_b.path()).unwrap();
        m_b.install_blob(&blob).unwrap();
        assert_eq!(
            m_b.ca_cert_pem(CaKind::Cluster).unwrap(),
            m_a.ca_cert_pem(CaKind::Cluster).unwrap()
        );
        assert!(m_b.diverging_files(&blob).unwrap().is_empty());
    }
}
