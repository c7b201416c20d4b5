//! AES-256-GCM payload encryption.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use amp_codec::{CipherError, PayloadCipher, canonical_json};
use amp_primitives::{EncryptionAlgorithm, EncryptionHeader};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde_json::{Value, json};

use crate::{SecurityError, SecurityResult};

const NONCE_LEN: usize = 12;

/// Symmetric keys for `aes-256-gcm`, addressed by key id.
///
/// Sealed payloads have the shape `{"nonce": <b64>, "ciphertext": <b64>}`.
#[derive(Default)]
pub struct AesGcmCipher {
    keys: HashMap<String, Aes256Gcm>,
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("key_ids", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AesGcmCipher {
    /// Adds a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] when the key is not 32 bytes.
    pub fn insert_key(&mut self, key_id: impl Into<String>, key: &[u8]) -> SecurityResult<()> {
        if key.len() != 32 {
            return Err(SecurityError::config(format!(
                "aes-256-gcm keys must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        self.keys.insert(key_id.into(), cipher);
        Ok(())
    }

    /// Adds a key given as 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] for malformed hex or wrong length.
    pub fn insert_hex_key(&mut self, key_id: impl Into<String>, key_hex: &str) -> SecurityResult<()> {
        let key = hex::decode(key_hex.trim())
            .map_err(|err| SecurityError::config(format!("encryption key is not hex: {err}")))?;
        self.insert_key(key_id, &key)
    }

    /// Whether a key with `key_id` is loaded.
    #[must_use]
    pub fn has_key(&self, key_id: &str) -> bool {
        self.keys.contains_key(key_id)
    }

    fn key(&self, header: &EncryptionHeader) -> Result<&Aes256Gcm, CipherError> {
        match header.algorithm {
            EncryptionAlgorithm::Aes256Gcm => self
                .keys
                .get(&header.key_id)
                .ok_or_else(|| CipherError(format!("unknown encryption key `{}`", header.key_id))),
        }
    }
}

impl PayloadCipher for AesGcmCipher {
    fn open(&self, header: &EncryptionHeader, sealed: &Value) -> Result<Value, CipherError> {
        let cipher = self.key(header)?;
        let field = |name: &str| {
            sealed
                .get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| CipherError(format!("sealed payload missing `{name}`")))
                .and_then(|encoded| {
                    STANDARD
                        .decode(encoded)
                        .map_err(|err| CipherError(format!("`{name}` is not base64: {err}")))
                })
        };
        let nonce = field("nonce")?;
        let ciphertext = field("ciphertext")?;
        if nonce.len() != NONCE_LEN {
            return Err(CipherError(format!("nonce must be {NONCE_LEN} bytes")));
        }

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CipherError("payload authentication failed".into()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|err| CipherError(format!("decrypted payload is not json: {err}")))
    }

    fn seal(&self, header: &EncryptionHeader, plaintext: &Value) -> Result<Value, CipherError> {
        let cipher = self.key(header)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), canonical_json(plaintext).as_bytes())
            .map_err(|_| CipherError("payload encryption failed".into()))?;
        Ok(json!({
            "nonce": STANDARD.encode(nonce),
            "ciphertext": STANDARD.encode(ciphertext),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(key_id: &str) -> EncryptionHeader {
        EncryptionHeader {
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_id: key_id.into(),
        }
    }

    fn cipher() -> AesGcmCipher {
        let mut cipher = AesGcmCipher::default();
        cipher.insert_hex_key("k1", &"11".repeat(32)).unwrap();
        cipher
    }

    #[test]
    fn seal_then_open() {
        let cipher = cipher();
        let plaintext = json!({"capability": "echo", "parameters": {"text": "hi"}});
        let sealed = cipher.seal(&header("k1"), &plaintext).unwrap();
        assert!(sealed.get("ciphertext").is_some());
        assert_eq!(cipher.open(&header("k1"), &sealed).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = cipher();
        let mut sealed = cipher.seal(&header("k1"), &json!({"a": 1})).unwrap();
        let mut bytes = STANDARD
            .decode(sealed["ciphertext"].as_str().unwrap())
            .unwrap();
        bytes[0] ^= 0xff;
        sealed["ciphertext"] = json!(STANDARD.encode(bytes));
        assert!(cipher.open(&header("k1"), &sealed).is_err());
    }

    #[test]
    fn unknown_key_and_bad_length() {
        let cipher = cipher();
        assert!(cipher.seal(&header("k2"), &json!({})).is_err());
        let mut other = AesGcmCipher::default();
        assert!(other.insert_key("short", &[0u8; 16]).is_err());
    }
}
