// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node password files.
//!
//! The server keeps `server/cred/node-passwd` (`name,hash` rows): the first
//! join of a name records the hash of the node's password; every later join
//! must present the same password. The agent keeps its generated password in
//! `agent/node-password` so re-joins after restart present the original.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::domain::node::RegistrarError;

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Server-side `name,hash` registry with an in-process lock around the
/// read-modify-write of the file.
pub struct NodePasswdFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl NodePasswdFile {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("server").join("cred").join("node-passwd"),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, RegistrarError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .filter_map(|line| {
                    let (name, hash) = line.split_once(',')?;
                    Some((name.to_string(), hash.to_string()))
                })
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(RegistrarError::Store(e.to_string())),
        }
    }

    fn store(&self, entries: &HashMap<String, String>) -> Result<(), RegistrarError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| RegistrarError::Store(e.to_string()))?;
        }
        let mut names: Vec<_> = entries.keys().collect();
        names.sort();
        let body: String = names
            .iter()
            .map(|name| format!("{},{}\n", name, entries[*name]))
            .collect();
        fs::write(&self.path, body).map_err(|e| RegistrarError::Store(e.to_string()))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
            .map_err(|e| RegistrarError::Store(e.to_string()))?;
        Ok(())
    }

    /// Bind `name` to `password` on first use; on later calls verify the
    /// presented password against the stored hash. A mismatch is a name
    /// squat and is rejected.
    pub fn verify_or_record(&self, name: &str, password: &str) -> Result<(), RegistrarError> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        let presented = hash_password(password);
        match entries.get(name) {
            Some(stored) => {
                let ok: bool = stored.as_bytes().ct_eq(presented.as_bytes()).into();
                if ok {
                    Ok(())
                } else {
                    Err(RegistrarError::NameConflict(name.to_string()))
                }
            }
            None => {
                entries.insert(name.to_string(), presented);
                self.store(&entries)
            }
        }
    }

    /// Drop a binding (administrative node deletion).
    pub fn remove(&self, name: &str) -> Result<(), RegistrarError> {
        let _guard = self.lock.lock();
        let mut entries = self.load()?;
        if entries.remove(name).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }
}

/// Load or create the agent's own node password (`agent/node-password`).
pub fn ensure_node_password(data_dir: &Path) -> std::io::Result<String> {
    let path = data_dir.join("agent").join("node-password");
    match fs::read_to_string(&path) {
        Ok(password) => Ok(password.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut bytes = [0u8; 16];
            rand::rng().fill_bytes(&mut bytes);
            let password = hex::encode(bytes);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, format!("{password}\n"))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
            Ok(password)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_records_then_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let file = NodePasswdFile::new(dir.path());

        file.verify_or_record("edge-01", "pw-one").unwrap();
        // Same name, same password: fine.
        file.verify_or_record("edge-01", "pw-one").unwrap();
        // Same name, different password: name squat.
        let err = file.verify_or_record("edge-01", "pw-two").unwrap_err();
        assert!(matches!(err, RegistrarError::NameConflict(_)));
        // Unrelated name is unaffected.
        file.verify_or_record("edge-02", "pw-two").unwrap();
    }

    #[test]
    fn test_remove_unbinds_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = NodePasswdFile::new(dir.path());
        file.verify_or_record("edge-01", "pw-one").unwrap();
        file.remove("edge-01").unwrap();
        file.verify_or_record("edge-01", "pw-two").unwrap();
    }

    #[test]
    fn test_agent_password_is_stable_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let first = ensure_node_password(dir.path()).unwrap();
        let second = ensure_node_password(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }
}
