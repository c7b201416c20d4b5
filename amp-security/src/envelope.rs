//! Composition of the inbound and outbound security checks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amp_codec::PayloadCipher;
use amp_primitives::{AgentId, AgentIdentity, CapabilityId, Message};
use chrono::{DateTime, Utc};
use tracing::trace;

use crate::auth::{Authenticator, bearer_credentials};
use crate::cipher::AesGcmCipher;
use crate::policy::{AccessDecision, AccessPolicy, AccessRequest, RuleBasedPolicy};
use crate::replay::ReplayCache;
use crate::signature::{MessageSigner, SignatureVerifier};
use crate::{SecurityError, SecurityResult};

const DEFAULT_REPLAY_CAPACITY: usize = 100_000;
const DEFAULT_REPLAY_WINDOW: Duration = Duration::from_secs(300);
const ANONYMOUS: &str = "anonymous";

/// Switches and bounds for the envelope.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Reject messages without credentials.
    pub require_authentication: bool,
    /// Reject messages without a signature.
    pub require_signature: bool,
    /// Maximum live replay-cache entries.
    pub replay_capacity: usize,
    /// How long a nonce is remembered; must be at least the codec clock skew.
    pub replay_window: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_authentication: false,
            require_signature: false,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            replay_window: DEFAULT_REPLAY_WINDOW,
        }
    }
}

impl SecurityConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] for a zero capacity or window.
    pub fn validate(&self) -> SecurityResult<()> {
        if self.replay_capacity == 0 {
            return Err(SecurityError::config("replay_capacity must be greater than zero"));
        }
        if self.replay_window.is_zero() {
            return Err(SecurityError::config("replay_window must be greater than zero"));
        }
        Ok(())
    }
}

/// Result of admitting an inbound message.
#[derive(Clone, Debug, Default)]
pub struct Admission {
    /// Identity resolved from credentials, if any were presented.
    pub identity: Option<AgentIdentity>,
    /// Whether a signature was present and verified.
    pub signed: bool,
    /// Id of the key that verified the signature.
    pub signer: Option<String>,
}

impl Admission {
    /// Replay-cache partition for the message: the authenticated identity,
    /// else the verified signing key, else the claimed source.
    fn replay_source(&self, message: &Message) -> String {
        if let Some(identity) = &self.identity {
            return identity.id().to_string();
        }
        if let Some(key_id) = &self.signer {
            return format!("key:{key_id}");
        }
        message
            .source
            .agent_id
            .as_ref()
            .map_or(ANONYMOUS, AgentId::as_str)
            .to_owned()
    }
}

/// Inbound checks (authenticate, verify, replay) and outbound sealing.
pub struct SecurityEnvelope {
    config: SecurityConfig,
    authenticator: Authenticator,
    verifier: SignatureVerifier,
    replay: ReplayCache,
    signer: Option<MessageSigner>,
    cipher: Option<Arc<AesGcmCipher>>,
    policy: Arc<dyn AccessPolicy>,
}

impl fmt::Debug for SecurityEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityEnvelope")
            .field("config", &self.config)
            .field("signer", &self.signer)
            .field("replay_entries", &self.replay.len())
            .finish_non_exhaustive()
    }
}

impl Default for SecurityEnvelope {
    fn default() -> Self {
        let config = SecurityConfig::default();
        Self {
            replay: ReplayCache::new(config.replay_capacity, config.replay_window),
            config,
            authenticator: Authenticator::default(),
            verifier: SignatureVerifier::default(),
            signer: None,
            cipher: None,
            policy: Arc::new(RuleBasedPolicy::allow_all()),
        }
    }
}

impl SecurityEnvelope {
    /// Starts building an envelope.
    #[must_use]
    pub fn builder(config: SecurityConfig) -> SecurityEnvelopeBuilder {
        SecurityEnvelopeBuilder {
            config,
            authenticator: Authenticator::default(),
            verifier: SignatureVerifier::default(),
            signer: None,
            cipher: None,
            policy: None,
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Authenticates, verifies the signature, and records the nonce.
    ///
    /// `bearer` is a transport-level token used when the message carries no
    /// `headers.auth`.
    ///
    /// # Errors
    ///
    /// Returns the first [`SecurityError`] raised by the three checks.
    pub fn admit(&self, message: &Message, bearer: Option<&str>) -> SecurityResult<Admission> {
        self.admit_at(message, bearer, Utc::now())
    }

    /// Same as [`SecurityEnvelope::admit`] with an explicit notion of "now".
    ///
    /// # Errors
    ///
    /// Returns the first [`SecurityError`] raised by the three checks.
    pub fn admit_at(
        &self,
        message: &Message,
        bearer: Option<&str>,
        now: DateTime<Utc>,
    ) -> SecurityResult<Admission> {
        let credentials = message
            .headers
            .auth
            .clone()
            .or_else(|| bearer.map(bearer_credentials));

        let identity = match credentials {
            Some(credentials) => Some(self.authenticator.authenticate(&credentials, message)?),
            None if self.config.require_authentication => {
                return Err(SecurityError::auth("no credentials presented"));
            }
            None => None,
        };

        if let (Some(identity), Some(source)) = (&identity, &message.source.agent_id) {
            if identity.id() != source {
                return Err(SecurityError::auth(format!(
                    "credentials for `{}` presented by source `{source}`",
                    identity.id()
                )));
            }
        }

        let signer = self.verifier.verify(message)?;
        if signer.is_none() && self.config.require_signature {
            return Err(SecurityError::integrity("signature required"));
        }

        let admission = Admission {
            identity,
            signed: signer.is_some(),
            signer,
        };
        self.replay.check_and_insert(
            &admission.replay_source(message),
            message.nonce(),
            message.timestamp,
            now,
        )?;

        trace!(
            message_id = %message.id,
            signed = admission.signed,
            authenticated = admission.identity.is_some(),
            "admitted"
        );
        Ok(admission)
    }

    /// Evaluates the access policy for invoking `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::AccessDenied`] when the policy refuses.
    pub async fn authorize(&self, caller: Option<&AgentId>, capability: &CapabilityId) -> SecurityResult<()> {
        let request = AccessRequest {
            agent: caller,
            capability,
        };
        match self.policy.evaluate(&request).await {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny { reason } => Err(SecurityError::AccessDenied {
                agent: caller.map_or_else(|| ANONYMOUS.to_owned(), ToString::to_string),
                capability: capability.to_string(),
                reason,
            }),
        }
    }

    /// Signs and, when `headers.encryption` is set, encrypts an outbound message.
    ///
    /// The signature covers the plaintext payload.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] when encryption is requested
    /// without a loaded key, or signing fails.
    pub fn seal(&self, message: &mut Message) -> SecurityResult<()> {
        if let Some(signer) = &self.signer {
            signer.sign(message)?;
        }
        if let Some(header) = message.headers.encryption.clone() {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| SecurityError::config("encryption requested but no cipher configured"))?;
            message.payload = cipher
                .seal(&header, &message.payload)
                .map_err(|err| SecurityError::config(err.to_string()))?;
        }
        Ok(())
    }

    /// Cipher to install on the codec so inbound payloads can be opened.
    #[must_use]
    pub fn payload_cipher(&self) -> Option<Arc<dyn PayloadCipher>> {
        self.cipher
            .as_ref()
            .map(|cipher| Arc::clone(cipher) as Arc<dyn PayloadCipher>)
    }

    /// Drops expired replay entries.
    pub fn purge_replay(&self, now: DateTime<Utc>) -> usize {
        self.replay.purge_expired(now)
    }

    /// Replay cache, for inspection.
    #[must_use]
    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay
    }
}

/// Builder for [`SecurityEnvelope`].
pub struct SecurityEnvelopeBuilder {
    config: SecurityConfig,
    authenticator: Authenticator,
    verifier: SignatureVerifier,
    signer: Option<MessageSigner>,
    cipher: Option<AesGcmCipher>,
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl SecurityEnvelopeBuilder {
    /// Sets the credential verifiers.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Sets the signature verification keys.
    #[must_use]
    pub fn signature_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Signs outbound messages with `signer`.
    #[must_use]
    pub fn signer(mut self, signer: MessageSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Enables payload encryption with the given keys.
    #[must_use]
    pub fn cipher(mut self, cipher: AesGcmCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Replaces the default allow-all access policy.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Finalises the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::InvalidConfig`] when the configuration is
    /// invalid or signatures are required without any verification key.
    pub fn build(self) -> SecurityResult<SecurityEnvelope> {
        self.config.validate()?;
        if self.config.require_signature && self.verifier.is_empty() {
            return Err(SecurityError::config(
                "require_signature is set but no verification keys are configured",
            ));
        }
        Ok(SecurityEnvelope {
            replay: ReplayCache::new(self.config.replay_capacity, self.config.replay_window),
            config: self.config,
            authenticator: self.authenticator,
            verifier: self.verifier,
            signer: self.signer,
            cipher: self.cipher.map(Arc::new),
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(RuleBasedPolicy::allow_all())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyVerifier;
    use crate::signature::{SigningSecret, VerificationKey};
    use amp_primitives::{Credentials, EncryptionAlgorithm, EncryptionHeader, Endpoint, ErrorCode, MessageType};
    use serde_json::json;

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    fn identity(id: &str) -> AgentIdentity {
        AgentIdentity::builder(agent(id))
            .name(id)
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .build()
            .unwrap()
    }

    fn message_from(id: &str) -> Message {
        Message::new(
            MessageType::Event,
            Endpoint::agent(agent(id)),
            Endpoint::default(),
            json!({"event": "ping"}),
        )
    }

    fn keyed_envelope(require_auth: bool) -> SecurityEnvelope {
        let mut keys = ApiKeyVerifier::default();
        keys.insert("key-a", identity("agent-a"));
        SecurityEnvelope::builder(SecurityConfig {
            require_authentication: require_auth,
            ..SecurityConfig::default()
        })
        .authenticator(Authenticator::default().with_api_keys(keys))
        .build()
        .unwrap()
    }

    #[test]
    fn bearer_token_used_without_auth_header() {
        let envelope = keyed_envelope(true);
        let admission = envelope.admit(&message_from("agent-a"), Some("key-a")).unwrap();
        assert_eq!(admission.identity.unwrap().id(), &agent("agent-a"));

        let err = envelope.admit(&message_from("agent-a"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn identity_must_match_source() {
        let envelope = keyed_envelope(true);
        let mut message = message_from("agent-b");
        message.headers.auth = Some(Credentials::ApiKey("key-a".into()));
        let err = envelope.admit(&message, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn replayed_message_rejected() {
        let envelope = keyed_envelope(false);
        let message = message_from("agent-a");
        envelope.admit(&message, None).unwrap();
        let err = envelope.admit(&message, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplayDetected);
    }

    #[test]
    fn signed_replay_with_new_nonce_or_source_rejected() {
        let mut verifier = SignatureVerifier::default();
        verifier.insert("k-b", VerificationKey::Hmac(b"s".to_vec()));
        let envelope = SecurityEnvelope::builder(SecurityConfig {
            require_signature: true,
            ..SecurityConfig::default()
        })
        .signature_verifier(verifier)
        .build()
        .unwrap();

        let mut original = message_from("agent-b");
        MessageSigner::new("k-b", SigningSecret::Hmac(b"s".to_vec()))
            .sign(&mut original)
            .unwrap();
        let admission = envelope.admit(&original, None).unwrap();
        assert_eq!(admission.signer.as_deref(), Some("k-b"));

        let mut renonced = original.clone();
        renonced.headers.nonce = Some("fresh".into());
        let err = envelope.admit(&renonced, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IntegrityViolation);

        let mut resourced = original.clone();
        resourced.source = Endpoint::agent(agent("agent-x"));
        let err = envelope.admit(&resourced, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IntegrityViolation);

        let err = envelope.admit(&original, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplayDetected);
        assert_eq!(envelope.replay_cache().len(), 1);
    }

    #[test]
    fn required_signature_enforced() {
        let mut verifier = SignatureVerifier::default();
        verifier.insert("agent-a", VerificationKey::Hmac(b"s".to_vec()));
        let envelope = SecurityEnvelope::builder(SecurityConfig {
            require_signature: true,
            ..SecurityConfig::default()
        })
        .signature_verifier(verifier)
        .build()
        .unwrap();

        let err = envelope.admit(&message_from("agent-a"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::IntegrityViolation);

        let mut signed = message_from("agent-a");
        MessageSigner::new("agent-a", SigningSecret::Hmac(b"s".to_vec()))
            .sign(&mut signed)
            .unwrap();
        assert!(envelope.admit(&signed, None).unwrap().signed);
    }

    #[test]
    fn seal_signs_plaintext_then_encrypts() {
        let mut cipher = AesGcmCipher::default();
        cipher.insert_key("k1", &[3u8; 32]).unwrap();
        let mut verifier = SignatureVerifier::default();
        verifier.insert("agent-a", VerificationKey::Hmac(b"s".to_vec()));
        let envelope = SecurityEnvelope::builder(SecurityConfig::default())
            .signer(MessageSigner::new("agent-a", SigningSecret::Hmac(b"s".to_vec())))
            .signature_verifier(verifier)
            .cipher(cipher)
            .build()
            .unwrap();

        let mut message = message_from("agent-a");
        let plaintext = message.payload.clone();
        message.headers.encryption = Some(EncryptionHeader {
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_id: "k1".into(),
        });
        envelope.seal(&mut message).unwrap();
        assert_ne!(message.payload, plaintext);

        let header = message.headers.encryption.clone().unwrap();
        message.payload = envelope
            .payload_cipher()
            .unwrap()
            .open(&header, &message.payload)
            .unwrap();
        assert!(envelope.admit(&message, None).unwrap().signed);
    }

    #[tokio::test]
    async fn authorization_denial_maps_to_authentication_failed() {
        let policy = RuleBasedPolicy::new(AccessDecision::deny("closed"));
        let envelope = SecurityEnvelope::builder(SecurityConfig::default())
            .policy(Arc::new(policy))
            .build()
            .unwrap();
        let cap = CapabilityId::new("echo").unwrap();
        let err = envelope.authorize(Some(&agent("agent-a")), &cap).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }
}
