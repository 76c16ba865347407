//! AES-256-GCM PII envelope encryption (§2, §6)
//!
//! Flag maps are encrypted with either a per-request BYOK or the process-wide
//! default key. The envelope format `{version, iv, tag, data}` matches §6.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::collections::HashMap;

use crate::error::{CapsuleError, Result};
use crate::types::PiiEnvelope;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// A 32-byte AES-256 key, either BYOK-supplied or the process default
#[derive(Clone)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    /// Parse a key from raw 32 bytes, base64, or hex text (e.g. `CAPSULE_META_ENCRYPTION_KEY`)
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(raw.as_bytes());
            return Ok(Self(key));
        }
        if let Ok(bytes) = STANDARD.decode(raw) {
            if bytes.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                return Ok(Self(key));
            }
        }
        if let Ok(bytes) = hex::decode(raw) {
            if bytes.len() == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                return Ok(Self(key));
            }
        }
        Err(CapsuleError::Config(
            "encryption key must be 32 raw bytes, base64, or hex".to_string(),
        ))
    }

    /// Deterministic default key used when no BYOK or process key is configured.
    /// Never used for anything but local development; production deployments
    /// must set `CAPSULE_META_ENCRYPTION_KEY`.
    pub fn insecure_default() -> Self {
        Self(*b"capsule-memory-default-key-00000")
    }
}

/// Encrypt a PII flag map into an envelope (§4.1 step 9, §6)
pub fn encrypt_flags(flags: &HashMap<String, bool>, key: &EncryptionKey) -> Result<PiiEnvelope> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(flags)?;
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|e| CapsuleError::Encryption(e.to_string()))?;

    // AES-GCM in the `aes-gcm` crate appends the 16-byte tag to the ciphertext;
    // split it out so the envelope carries `{iv, tag, data}` separately per §6.
    let tag = ciphertext.split_off(ciphertext.len() - 16);

    Ok(PiiEnvelope {
        version: ENVELOPE_VERSION,
        iv: STANDARD.encode(nonce_bytes),
        tag: STANDARD.encode(tag),
        data: STANDARD.encode(ciphertext),
    })
}

/// Decrypt a PII envelope back into the original flag map (§6)
pub fn decrypt_flags(envelope: &PiiEnvelope, key: &EncryptionKey) -> Result<HashMap<String, bool>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));

    let nonce_bytes = STANDARD
        .decode(&envelope.iv)
        .map_err(|e| CapsuleError::Encryption(e.to_string()))?;
    let tag = STANDARD
        .decode(&envelope.tag)
        .map_err(|e| CapsuleError::Encryption(e.to_string()))?;
    let mut data = STANDARD
        .decode(&envelope.data)
        .map_err(|e| CapsuleError::Encryption(e.to_string()))?;
    data.extend_from_slice(&tag);

    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, data.as_slice())
        .map_err(|e| CapsuleError::Encryption(e.to_string()))?;

    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = EncryptionKey::insecure_default();
        let mut flags = HashMap::new();
        flags.insert("ssn".to_string(), true);
        flags.insert("address".to_string(), false);

        let envelope = encrypt_flags(&flags, &key).unwrap();
        let decrypted = decrypt_flags(&envelope, &key).unwrap();
        assert_eq!(flags, decrypted);
    }

    #[test]
    fn wrong_key_fails() {
        let key = EncryptionKey::insecure_default();
        let other = EncryptionKey::parse(&STANDARD.encode([7u8; 32])).unwrap();
        let mut flags = HashMap::new();
        flags.insert("ssn".to_string(), true);
        let envelope = encrypt_flags(&flags, &key).unwrap();
        assert!(decrypt_flags(&envelope, &other).is_err());
    }

    #[test]
    fn parse_base64_key() {
        let raw = [3u8; 32];
        let key = EncryptionKey::parse(&STANDARD.encode(raw)).unwrap();
        assert_eq!(key.0, raw);
    }
}
