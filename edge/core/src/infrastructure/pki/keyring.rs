// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! AES-256-GCM key ring for envelope encryption of confidential objects.
//!
//! Each object is sealed with a fresh data key; the data key is sealed with
//! the ring's write key (the key-encryption key). Readers accept any key
//! still on the ring, which is what lets rotation proceed in stages.
//!
//! The ring is copy-on-write: mutation produces a new [`Keyring`] value that
//! the owning service publishes atomically; readers operate on a snapshot.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::domain::secrets::{EncryptionStage, SecretsError};

/// Marker prefixed to every sealed value so readers can tell envelopes from
/// plaintext written before encryption was enabled.
pub const ENVELOPE_PREFIX: &[u8] = b"aegis-enc:v1:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub name: String,
    #[serde(with = "b64_bytes")]
    pub secret: Vec<u8>,
}

impl EncryptionKey {
    /// Generate a fresh 256-bit key named after its creation time.
    pub fn generate(name: String) -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            name,
            secret: key.to_vec(),
        }
    }
}

/// The ring: `keys[0]` is the write key; every entry is accepted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyring {
    pub stage: EncryptionStage,
    pub keys: Vec<EncryptionKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    /// Name of the key-encryption key that sealed the data key.
    kek: String,
    /// Sealed data key and its nonce.
    edk: String,
    kn: String,
    /// Sealed payload and its nonce.
    ct: String,
    n: String,
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            stage: EncryptionStage::Start,
            keys: vec![EncryptionKey::generate(key_name())],
        }
    }

    pub fn write_key(&self) -> Result<&EncryptionKey, SecretsError> {
        self.keys.first().ok_or(SecretsError::NotEnabled)
    }

    fn key_by_name(&self, name: &str) -> Result<&EncryptionKey, SecretsError> {
        self.keys
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| SecretsError::UnknownKey(name.to_string()))
    }

    /// `prepare`: append a new key; writers keep using the old one.
    pub fn with_appended_key(&self) -> Self {
        let mut next = self.clone();
        next.keys.push(EncryptionKey::generate(key_name()));
        next
    }

    /// `rotate`: the most recently appended key becomes the write key.
    pub fn with_promoted_key(&self) -> Self {
        let mut next = self.clone();
        if let Some(newest) = next.keys.pop() {
            next.keys.insert(0, newest);
        }
        next
    }

    /// `reencrypt_finished`: drop every key except the write key.
    pub fn with_retired_keys(&self) -> Self {
        let mut next = self.clone();
        next.keys.truncate(1);
        next
    }

    /// Seal a confidential value under the write key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let kek = self.write_key()?;
        let dek = Aes256Gcm::generate_key(OsRng);

        let payload_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = Aes256Gcm::new(&dek)
            .encrypt(&payload_nonce, plaintext)
            .map_err(|e| SecretsError::Envelope(e.to_string()))?;

        let kek_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let edk = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek.secret))
            .encrypt(&kek_nonce, dek.as_slice())
            .map_err(|e| SecretsError::Envelope(e.to_string()))?;

        let envelope = Envelope {
            kek: kek.name.clone(),
            edk: BASE64.encode(edk),
            kn: BASE64.encode(kek_nonce),
            ct: BASE64.encode(ct),
            n: BASE64.encode(payload_nonce),
        };
        let body =
            serde_json::to_vec(&envelope).map_err(|e| SecretsError::Envelope(e.to_string()))?;
        let mut out = ENVELOPE_PREFIX.to_vec();
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open a sealed value with whichever ring key sealed its data key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let body = sealed
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| SecretsError::Envelope("missing envelope prefix".to_string()))?;
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| SecretsError::Envelope(e.to_string()))?;

        let kek = self.key_by_name(&envelope.kek)?;
        let decode = |s: &str| {
            BASE64
                .decode(s)
                .map_err(|e| SecretsError::Envelope(e.to_string()))
        };
        let nonce_checked = |bytes: Vec<u8>| {
            if bytes.len() == 12 {
                Ok(bytes)
            } else {
                Err(SecretsError::Envelope("nonce has wrong length".to_string()))
            }
        };
        let kek_nonce = nonce_checked(decode(&envelope.kn)?)?;
        let edk = decode(&envelope.edk)?;
        let dek = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek.secret))
            .decrypt(Nonce::from_slice(&kek_nonce), edk.as_slice())
            .map_err(|e| SecretsError::Envelope(e.to_string()))?;
        if dek.len() != 32 {
            return Err(SecretsError::Envelope("data key has wrong length".to_string()));
        }

        let payload_nonce = nonce_checked(decode(&envelope.n)?)?;
        let ct = decode(&envelope.ct)?;
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek))
            .decrypt(Nonce::from_slice(&payload_nonce), ct.as_slice())
            .map_err(|e| SecretsError::Envelope(e.to_string()))
    }

    /// Whether the bytes carry this module's envelope framing.
    pub fn is_sealed(value: &[u8]) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

fn key_name() -> String {
    format!("aesgcm-{}", chrono::Utc::now().format("%Y%m%d%H%M%S%f"))
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip_is_identity() {
        let ring = Keyring::new();
        let sealed = ring.seal(b"secret payload").unwrap();
        assert!(Keyring::is_sealed(&sealed));
        assert_eq!(ring.open(&sealed).unwrap(), b"secret payload");
    }

    #[test]
    fn test_open_accepts_old_key_after_promotion() {
        let ring = Keyring::new();
        let sealed_old = ring.seal(b"v").unwrap();

        let prepared = ring.with_appended_key();
        let rotated = prepared.with_promoted_key();
        // New write key, but the old key is still on the ring.
        assert_ne!(rotated.write_key().unwrap().name, ring.write_key().unwrap().name);
        assert_eq!(rotated.open(&sealed_old).unwrap(), b"v");
    }

    #[test]
    fn test_retired_key_no_longer_opens() {
        let ring = Keyring::new();
        let sealed_old = ring.seal(b"v").unwrap();

        let finished = ring.with_appended_key().with_promoted_key().with_retired_keys();
        assert_eq!(finished.keys.len(), 1);
        let err = finished.open(&sealed_old).unwrap_err();
        assert!(matches!(err, SecretsError::UnknownKey(_)));
    }

    #[test]
    fn test_plaintext_is_not_sealed() {
        assert!(!Keyring::is_sealed(b"{\"plain\":true}"));
        let ring = Keyring::new();
        assert!(ring.open(b"plaintext").is_err());
    }

    #[test]
    fn test_ring_serde_roundtrip() {
        let ring = Keyring::new().with_appended_key();
        let json = serde_json::to_string(&ring).unwrap();
        let restored: Keyring = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.keys.len(), 2);
        assert_eq!(restored.keys[0].secret, ring.keys[0].secret);
    }
}
