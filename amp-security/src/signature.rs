//! Message signatures over the canonical signing string.

use std::collections::HashMap;
use std::fmt;

use amp_codec::signing_string;
use amp_primitives::{Message, SignatureAlgorithm, SignatureHeader};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{SecurityError, SecurityResult};

type HmacSha256 = Hmac<Sha256>;

/// Key material able to verify one algorithm.
#[derive(Clone)]
pub enum VerificationKey {
    /// Shared HMAC secret.
    Hmac(Vec<u8>),
    /// Ed25519 public key.
    Ed25519(VerifyingKey),
}

impl VerificationKey {
    /// Parses configured key material: secret text for `hmac-sha256`, a
    /// hex-encoded 32-byte public key for `ed25519`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] for unknown algorithms or
    /// malformed keys.
    pub fn from_encoded(algorithm: &str, key: &str) -> SecurityResult<Self> {
        match algorithm {
            "hmac-sha256" => Ok(Self::Hmac(key.as_bytes().to_vec())),
            "ed25519" => {
                let bytes = decode_key32(key)?;
                VerifyingKey::from_bytes(&bytes)
                    .map(Self::Ed25519)
                    .map_err(|err| SecurityError::config(format!("bad ed25519 public key: {err}")))
            }
            other => Err(SecurityError::config(format!("unknown signature algorithm `{other}`"))),
        }
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Self::Hmac(_) => SignatureAlgorithm::HmacSha256,
            Self::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hmac(_) => "Hmac(..)",
            Self::Ed25519(_) => "Ed25519(..)",
        })
    }
}

/// Checks `headers.signature` against registered keys.
///
/// The key is selected by `signature.key_id`, falling back to the source
/// agent id.
#[derive(Debug, Default)]
pub struct SignatureVerifier {
    keys: HashMap<String, VerificationKey>,
}

impl SignatureVerifier {
    /// Registers a verification key.
    pub fn insert(&mut self, key_id: impl Into<String>, key: VerificationKey) {
        self.keys.insert(key_id.into(), key);
    }

    /// Whether no keys are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verifies the signature on `message` and returns the id of the key that
    /// verified it.
    ///
    /// Returns `Ok(None)` when the message carries no signature.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::IntegrityViolation`] when the key is unknown,
    /// the algorithm does not match the key, or the signature is wrong.
    pub fn verify(&self, message: &Message) -> SecurityResult<Option<String>> {
        let Some(header) = &message.headers.signature else {
            return Ok(None);
        };

        let key_id = header
            .key_id
            .as_deref()
            .or_else(|| message.source.agent_id.as_ref().map(|id| id.as_str()))
            .ok_or_else(|| SecurityError::integrity("signature names no key"))?;
        let key = self
            .keys
            .get(key_id)
            .ok_or_else(|| SecurityError::integrity(format!("unknown signing key `{key_id}`")))?;
        if key.algorithm() != header.algorithm {
            return Err(SecurityError::integrity(format!(
                "key `{key_id}` cannot verify {:?}",
                header.algorithm
            )));
        }

        let presented = STANDARD
            .decode(&header.value)
            .map_err(|err| SecurityError::integrity(format!("signature not base64: {err}")))?;
        let signed = signing_string(message);

        match key {
            VerificationKey::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret)
                    .map_err(|err| SecurityError::config(err.to_string()))?;
                mac.update(signed.as_bytes());
                mac.verify_slice(&presented)
                    .map_err(|_| SecurityError::integrity("hmac signature mismatch"))?;
            }
            VerificationKey::Ed25519(public) => {
                let signature = Signature::from_slice(&presented)
                    .map_err(|err| SecurityError::integrity(format!("bad ed25519 signature: {err}")))?;
                public
                    .verify_strict(signed.as_bytes(), &signature)
                    .map_err(|_| SecurityError::integrity("ed25519 signature mismatch"))?;
            }
        }
        Ok(Some(key_id.to_owned()))
    }
}

/// Private key material used for outbound signatures.
#[derive(Clone)]
pub enum SigningSecret {
    /// Shared HMAC secret.
    Hmac(Vec<u8>),
    /// Ed25519 private key.
    Ed25519(SigningKey),
}

impl SigningSecret {
    /// Parses configured key material: secret text for `hmac-sha256`, a
    /// hex-encoded 32-byte seed for `ed25519`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] for unknown algorithms or
    /// malformed keys.
    pub fn from_encoded(algorithm: &str, key: &str) -> SecurityResult<Self> {
        match algorithm {
            "hmac-sha256" => Ok(Self::Hmac(key.as_bytes().to_vec())),
            "ed25519" => Ok(Self::Ed25519(SigningKey::from_bytes(&decode_key32(key)?))),
            other => Err(SecurityError::config(format!("unknown signature algorithm `{other}`"))),
        }
    }
}

fn decode_key32(key: &str) -> SecurityResult<[u8; 32]> {
    let bytes = hex::decode(key.trim())
        .map_err(|err| SecurityError::config(format!("key is not hex: {err}")))?;
    bytes
        .try_into()
        .map_err(|_| SecurityError::config("ed25519 keys are 32 bytes"))
}

/// Signs outbound messages.
#[derive(Clone)]
pub struct MessageSigner {
    key_id: String,
    secret: SigningSecret,
}

impl fmt::Debug for MessageSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl MessageSigner {
    /// Creates a signer advertising `key_id`.
    #[must_use]
    pub fn new(key_id: impl Into<String>, secret: SigningSecret) -> Self {
        Self {
            key_id: key_id.into(),
            secret,
        }
    }

    /// Computes the signature header for `message` without attaching it.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] if the HMAC secret is unusable.
    pub fn signature_for(&self, message: &Message) -> SecurityResult<SignatureHeader> {
        let signed = signing_string(message);
        let (algorithm, bytes) = match &self.secret {
            SigningSecret::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret)
                    .map_err(|err| SecurityError::config(err.to_string()))?;
                mac.update(signed.as_bytes());
                (
                    SignatureAlgorithm::HmacSha256,
                    mac.finalize().into_bytes().to_vec(),
                )
            }
            SigningSecret::Ed25519(key) => (
                SignatureAlgorithm::Ed25519,
                key.sign(signed.as_bytes()).to_bytes().to_vec(),
            ),
        };
        Ok(SignatureHeader {
            algorithm,
            value: STANDARD.encode(bytes),
            key_id: Some(self.key_id.clone()),
        })
    }

    /// Signs `message` in place.
    ///
    /// # Errors
    ///
    /// See [`MessageSigner::signature_for`].
    pub fn sign(&self, message: &mut Message) -> SecurityResult<()> {
        message.headers.signature = Some(self.signature_for(message)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::{AgentId, Endpoint, MessageType};
    use serde_json::json;

    fn message() -> Message {
        Message::new(
            MessageType::Event,
            Endpoint::agent(AgentId::new("agent-a").unwrap()),
            Endpoint::default(),
            json!({"b": 2, "a": 1}),
        )
    }

    #[test]
    fn hmac_sign_and_verify() {
        let signer = MessageSigner::new("k1", SigningSecret::Hmac(b"secret".to_vec()));
        let mut verifier = SignatureVerifier::default();
        verifier.insert("k1", VerificationKey::Hmac(b"secret".to_vec()));

        let mut message = message();
        signer.sign(&mut message).unwrap();
        assert_eq!(verifier.verify(&message).unwrap().as_deref(), Some("k1"));

        message.payload["a"] = json!(99);
        let err = verifier.verify(&message).unwrap_err();
        assert!(matches!(err, SecurityError::IntegrityViolation { .. }));
    }

    #[test]
    fn nonce_and_source_are_covered() {
        let signer = MessageSigner::new("k1", SigningSecret::Hmac(b"secret".to_vec()));
        let mut verifier = SignatureVerifier::default();
        verifier.insert("k1", VerificationKey::Hmac(b"secret".to_vec()));

        let mut original = message();
        signer.sign(&mut original).unwrap();

        let mut renonced = original.clone();
        renonced.headers.nonce = Some("fresh-nonce".into());
        assert!(verifier.verify(&renonced).is_err());

        let mut resourced = original;
        resourced.source = Endpoint::agent(AgentId::new("agent-x").unwrap());
        assert!(verifier.verify(&resourced).is_err());
    }

    #[test]
    fn ed25519_sign_and_verify() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut verifier = SignatureVerifier::default();
        verifier.insert("agent-a", VerificationKey::Ed25519(key.verifying_key()));

        let mut message = message();
        let mut header = MessageSigner::new("agent-a", SigningSecret::Ed25519(key))
            .signature_for(&message)
            .unwrap();
        header.key_id = None;
        message.headers.signature = Some(header);
        assert_eq!(verifier.verify(&message).unwrap().as_deref(), Some("agent-a"));

        message.id = "msg-other".into();
        assert!(verifier.verify(&message).is_err());
    }

    #[test]
    fn encoded_keys_parse() {
        let seed = hex::encode([9u8; 32]);
        let public = hex::encode(SigningKey::from_bytes(&[9u8; 32]).verifying_key().to_bytes());
        let mut verifier = SignatureVerifier::default();
        verifier.insert("k-ed", VerificationKey::from_encoded("ed25519", &public).unwrap());

        let mut message = message();
        MessageSigner::new("k-ed", SigningSecret::from_encoded("ed25519", &seed).unwrap())
            .sign(&mut message)
            .unwrap();
        assert!(verifier.verify(&message).unwrap().is_some());

        assert!(VerificationKey::from_encoded("ed25519", "abcd").is_err());
        assert!(SigningSecret::from_encoded("rsa", "k").is_err());
    }

    #[test]
    fn unsigned_message_reports_absence() {
        let verifier = SignatureVerifier::default();
        assert_eq!(verifier.verify(&message()).unwrap(), None);
    }

    #[test]
    fn algorithm_must_match_key() {
        let mut verifier = SignatureVerifier::default();
        verifier.insert("k1", VerificationKey::Hmac(b"secret".to_vec()));
        let mut message = message();
        let key = SigningKey::from_bytes(&[1u8; 32]);
        MessageSigner::new("k1", SigningSecret::Ed25519(key))
            .sign(&mut message)
            .unwrap();
        assert!(verifier.verify(&message).is_err());
    }
}
