// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster join token: format, parsing, persistence.
//!
//! Two accepted spellings:
//! - short: just the shared secret;
//! - full: `AE10<hex sha-256 of the cluster CA bundle>::<user>:<secret>`,
//!   which additionally pins the cluster identity so a joining node refuses
//!   to talk to an impostor control plane.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand::RngCore;
use subtle::ConstantTimeEq;

const TOKEN_PREFIX: &str = "AE10";
const DEFAULT_USER: &str = "node";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed cluster token")]
    Malformed,

    #[error("token i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterToken {
    /// Present only in full-format tokens.
    pub ca_hash: Option<String>,
    pub user: String,
    pub secret: String,
}

impl ClusterToken {
    /// Generate a fresh random token (short format, 32 hex chars).
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            ca_hash: None,
            user: DEFAULT_USER.to_string(),
            secret: hex::encode(bytes),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TokenError::Malformed);
        }
        if !raw.starts_with(TOKEN_PREFIX) {
            // Short format: the whole string is the secret.
            if raw.contains("::") {
                return Err(TokenError::Malformed);
            }
            return Ok(Self {
                ca_hash: None,
                user: DEFAULT_USER.to_string(),
                secret: raw.to_string(),
            });
        }
        let rest = &raw[TOKEN_PREFIX.len()..];
        let (ca_hash, cred) = rest.split_once("::").ok_or(TokenError::Malformed)?;
        let (user, secret) = cred.split_once(':').ok_or(TokenError::Malformed)?;
        if ca_hash.len() != 64 || user.is_empty() || secret.is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(Self {
            ca_hash: Some(ca_hash.to_string()),
            user: user.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Render the full format with the given CA hash.
    pub fn format_full(&self, ca_hash: &str) -> String {
        format!("{TOKEN_PREFIX}{ca_hash}::{}:{}", self.user, self.secret)
    }

    /// Constant-time secret comparison.
    pub fn matches_secret(&self, other: &str) -> bool {
        self.secret.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

/// Read a token file (`server/token` or `agent/token`).
pub fn load(path: &Path) -> Result<Option<ClusterToken>, TokenError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(ClusterToken::parse(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Persist a token file with owner-only permissions.
pub fn persist(path: &Path, rendered: &str) -> Result<(), TokenError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{rendered}\n"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_token_parses_as_secret() {
        let token = ClusterToken::parse("sup3rsecret").unwrap();
        assert_eq!(token.secret, "sup3rsecret");
        assert!(token.ca_hash.is_none());
    }

    #[test]
    fn test_full_token_roundtrip() {
        let ca_hash = "a".repeat(64);
        let token = ClusterToken::generate();
        let rendered = token.format_full(&ca_hash);
        let parsed = ClusterToken::parse(&rendered).unwrap();
        assert_eq!(parsed.ca_hash.as_deref(), Some(ca_hash.as_str()));
        assert_eq!(parsed.user, "node");
        assert!(parsed.matches_secret(&token.secret));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(ClusterToken::parse("").is_err());
        assert!(ClusterToken::parse("AE10deadbeef::node:x").is_err()); // short hash
        assert!(ClusterToken::parse("plain::with:separators").is_err());
    }

    #[test]
    fn test_persist_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server").join("token");
        persist(&path, "secret").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(load(&path).unwrap().unwrap().secret, "secret");
    }
}
