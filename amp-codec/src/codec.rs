//! Envelope decoding and canonical encoding.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use amp_primitives::{EncryptionHeader, Endpoint, Message, PROTOCOL_MAJOR, PROTOCOL_VERSION};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::canonical::canonical_json;
use crate::validate::{check_payload, check_protocol, check_required, split_envelope};
use crate::{CodecError, CodecResult};

const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Failure reported by a [`PayloadCipher`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Symmetric payload encryption used for `headers.encryption`.
pub trait PayloadCipher: Send + Sync {
    /// Decrypts a sealed payload back into plaintext JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError`] when the key is unknown or authentication fails.
    fn open(&self, header: &EncryptionHeader, sealed: &Value) -> Result<Value, CipherError>;

    /// Encrypts plaintext JSON into the sealed payload shape.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError`] when the key is unknown or encryption fails.
    fn seal(&self, header: &EncryptionHeader, plaintext: &Value) -> Result<Value, CipherError>;
}

/// Limits applied while decoding.
#[derive(Clone, Debug)]
pub struct CodecConfig {
    /// Largest accepted raw message.
    pub max_message_bytes: usize,
    /// Largest accepted distance between message timestamp and local clock.
    pub clock_skew: Duration,
    /// Protocol major version accepted.
    pub supported_major: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            clock_skew: DEFAULT_CLOCK_SKEW,
            supported_major: PROTOCOL_MAJOR,
        }
    }
}

impl CodecConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidConfig`] for a zero size bound or an
    /// unsupported major version.
    pub fn validate(&self) -> CodecResult<()> {
        if self.max_message_bytes == 0 {
            return Err(CodecError::InvalidConfig {
                reason: "max_message_bytes must be greater than zero".into(),
            });
        }
        if self.supported_major != PROTOCOL_MAJOR {
            return Err(CodecError::InvalidConfig {
                reason: format!("only protocol major version {PROTOCOL_MAJOR} is implemented"),
            });
        }
        Ok(())
    }
}

/// Addressing information salvaged from a message that failed to decode.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Peeked {
    /// Message id, if one could be read.
    pub id: Option<String>,
    /// Source endpoint, if one could be read.
    pub source: Option<Endpoint>,
}

/// Decoder for inbound wire messages.
#[derive(Clone, Default)]
pub struct Codec {
    config: CodecConfig,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("config", &self.config)
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl Codec {
    /// Creates a codec with the supplied limits.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: CodecConfig) -> CodecResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cipher: None,
        })
    }

    /// Installs the cipher used to open encrypted payloads.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Returns the active limits.
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Decodes and validates a raw wire message against the local clock.
    ///
    /// Encrypted payloads are opened before payload validation; the returned
    /// message always carries a plaintext payload.
    ///
    /// # Errors
    ///
    /// Returns the [`CodecError`] describing the first check that failed.
    pub fn decode(&self, raw: &[u8]) -> CodecResult<Message> {
        self.decode_at(raw, Utc::now())
    }

    /// Same as [`Codec::decode`] with an explicit notion of "now".
    ///
    /// # Errors
    ///
    /// Returns the [`CodecError`] describing the first check that failed.
    pub fn decode_at(&self, raw: &[u8], now: DateTime<Utc>) -> CodecResult<Message> {
        if raw.len() > self.config.max_message_bytes {
            return Err(CodecError::MessageTooLarge {
                size: raw.len(),
                limit: self.config.max_message_bytes,
            });
        }

        let root: Value =
            serde_json::from_slice(raw).map_err(|source| CodecError::MalformedJson { source })?;

        let (marker, fields) = split_envelope(&root)?;
        check_protocol(marker, self.config.supported_major)?;
        check_required(fields)?;

        let mut message: Message = serde_json::from_value(Value::Object(fields.clone()))
            .map_err(|err| CodecError::schema("message", err.to_string()))?;

        self.check_skew(&message, now)?;
        message.protocol = (marker != PROTOCOL_VERSION).then(|| marker.to_owned());
        message.envelope_extensions = envelope_extensions(&root);

        if let Some(header) = message.headers.encryption.clone() {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| CodecError::IntegrityViolation {
                    reason: format!("no cipher configured for key `{}`", header.key_id),
                })?;
            message.payload = cipher.open(&header, &message.payload).map_err(|err| {
                CodecError::IntegrityViolation {
                    reason: err.to_string(),
                }
            })?;
        }

        check_payload(&message)?;
        trace!(message_id = %message.id, kind = message.kind.as_str(), "decoded message");
        Ok(message)
    }

    fn check_skew(&self, message: &Message, now: DateTime<Utc>) -> CodecResult<()> {
        let skew = (now - message.timestamp).abs();
        let within = skew
            .to_std()
            .map(|skew| skew <= self.config.clock_skew)
            .unwrap_or(false);
        if within {
            Ok(())
        } else {
            Err(CodecError::InvalidTimestamp {
                timestamp: message.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                skew_secs: self.config.clock_skew.as_secs(),
            })
        }
    }

    /// Best-effort extraction of the id and source of a message that failed
    /// to decode, used to address the error reply.
    #[must_use]
    pub fn peek(&self, raw: &[u8]) -> Peeked {
        if raw.len() > self.config.max_message_bytes {
            return Peeked::default();
        }
        let Ok(root) = serde_json::from_slice::<Value>(raw) else {
            return Peeked::default();
        };
        let Some(message) = root.get("message") else {
            return Peeked::default();
        };
        Peeked {
            id: message
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            source: message
                .get("source")
                .and_then(|source| serde_json::from_value(source.clone()).ok()),
        }
    }
}

fn envelope_extensions(root: &Value) -> Map<String, Value> {
    root.as_object()
        .into_iter()
        .flatten()
        .filter(|(key, _)| !matches!(key.as_str(), "protocol" | "message"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Serialises a message into its canonical envelope.
///
/// The payload is written as-is; sealing encrypted payloads happens before
/// encoding. The protocol marker and unknown fields a message was decoded
/// with are written back unchanged.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the message cannot be represented as JSON.
pub fn encode(message: &Message) -> CodecResult<Bytes> {
    let body = serde_json::to_value(message).map_err(|source| CodecError::Encode { source })?;
    let mut envelope = message.envelope_extensions.clone();
    envelope.insert("protocol".to_owned(), Value::String(message.protocol_marker().to_owned()));
    envelope.insert("message".to_owned(), body);
    Ok(Bytes::from(canonical_json(&Value::Object(envelope))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::{
        AgentId, CapabilityId, EncryptionAlgorithm, ErrorCode, MessageType, RequestPayload,
    };
    use serde_json::json;

    fn sample_request() -> Message {
        let mut message = Message::request(
            Endpoint::agent(AgentId::new("agent-a").unwrap()).with_session("s-1"),
            Endpoint::agent(AgentId::new("agent-b").unwrap()),
            &RequestPayload::new(
                CapabilityId::new("text-analysis").unwrap(),
                json!({"text": "hello", "language": "en"}),
            )
            .with_version(">=1.0.0 <2.0.0"),
        );
        message.headers.timeout_ms = Some(500);
        message
    }

    fn raw_with(message: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"protocol": "AMP/1.0", "message": message})).unwrap()
    }

    #[test]
    fn encode_then_decode_is_stable() {
        let codec = Codec::default();
        let message = sample_request();
        let first = encode(&message).unwrap();
        let decoded = codec.decode(&first).unwrap();
        assert_eq!(decoded, message);
        let second = encode(&decoded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn foreign_document_round_trips_semantically() {
        let raw = raw_with(json!({
            "id": "msg-42",
            "type": "event",
            "timestamp": "2024-05-01T12:00:00.250Z",
            "source": {"agent_id": "agent-a", "region": "eu"},
            "destination": {},
            "headers": {"priority": "high", "x-trace": "t-1"},
            "payload": {"event": "started", "data": {"n": 1}}
        }));
        let now = "2024-05-01T12:00:01Z".parse().unwrap();
        let codec = Codec::default();
        let decoded = codec.decode_at(&raw, now).unwrap();
        let encoded = encode(&decoded).unwrap();

        let original: Value = serde_json::from_slice(&raw).unwrap();
        let again: Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(original, again);
    }

    #[test]
    fn newer_minor_version_and_unknown_fields_survive_reencoding() {
        let raw = serde_json::to_vec(&json!({
            "protocol": "AMP/1.3",
            "trace": {"hops": 2},
            "message": {
                "id": "msg-43",
                "type": "event",
                "timestamp": "2024-05-01T12:00:00.250Z",
                "source": {"agent_id": "agent-a"},
                "destination": {"agent_id": "agent-c"},
                "headers": {},
                "payload": {"event": "started"},
                "x-route": ["agent-b"]
            }
        }))
        .unwrap();
        let now = "2024-05-01T12:00:01Z".parse().unwrap();
        let decoded = Codec::default().decode_at(&raw, now).unwrap();
        assert_eq!(decoded.protocol_marker(), "AMP/1.3");
        assert_eq!(decoded.extensions.get("x-route"), Some(&json!(["agent-b"])));

        let forwarded: Value = serde_json::from_slice(&encode(&decoded).unwrap()).unwrap();
        let original: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(forwarded, original);
    }

    #[test]
    fn missing_timestamp_is_schema_violation() {
        let raw = raw_with(json!({
            "id": "msg-1",
            "type": "request",
            "source": {"agent_id": "agent-a"},
            "payload": {"capability": "echo"}
        }));
        let err = Codec::default().decode(&raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
        assert!(matches!(err, CodecError::SchemaViolation { ref path, .. } if path == "message.timestamp"));
    }

    #[test]
    fn rejects_oversized_before_parsing() {
        let codec = Codec::new(CodecConfig {
            max_message_bytes: 16,
            ..CodecConfig::default()
        })
        .unwrap();
        let err = codec.decode(b"{ not even json, but far too long }").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLarge);
    }

    #[test]
    fn malformed_json() {
        let err = Codec::default().decode(b"{\"protocol\":").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedJson);
    }

    #[test]
    fn alternate_protocol_literal_rejected() {
        let mut root: Value = serde_json::from_slice(&encode(&sample_request()).unwrap()).unwrap();
        root["protocol"] = json!("AIP/1.0");
        let err = Codec::default()
            .decode(&serde_json::to_vec(&root).unwrap())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedProtocolVersion);
    }

    #[test]
    fn stale_timestamp_rejected() {
        let message = sample_request();
        let raw = encode(&message).unwrap();
        let later = message.timestamp + chrono::Duration::seconds(301);
        let err = Codec::default().decode_at(&raw, later).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTimestamp);
    }

    #[test]
    fn request_without_capability_rejected() {
        let mut message = sample_request();
        message.payload = json!({"parameters": {}});
        let err = Codec::default().decode(&encode(&message).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaViolation);
    }

    #[test]
    fn response_requires_correlation() {
        let mut message = sample_request();
        message.kind = MessageType::Response;
        message.payload = json!({"status": "success", "result": 1});
        let err = Codec::default().decode(&encode(&message).unwrap()).unwrap_err();
        assert!(
            matches!(err, CodecError::SchemaViolation { ref path, .. } if path.ends_with("correlation_id"))
        );
    }

    struct Reverse;

    impl PayloadCipher for Reverse {
        fn open(&self, header: &EncryptionHeader, sealed: &Value) -> Result<Value, CipherError> {
            if header.key_id != "k1" {
                return Err(CipherError("unknown key".into()));
            }
            sealed
                .get("wrapped")
                .cloned()
                .ok_or_else(|| CipherError("not sealed".into()))
        }

        fn seal(&self, _header: &EncryptionHeader, plaintext: &Value) -> Result<Value, CipherError> {
            Ok(json!({ "wrapped": plaintext }))
        }
    }

    #[test]
    fn opens_encrypted_payload_before_validation() {
        let mut message = sample_request();
        let header = EncryptionHeader {
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_id: "k1".into(),
        };
        let plaintext = message.payload.clone();
        message.payload = Reverse.seal(&header, &plaintext).unwrap();
        message.headers.encryption = Some(header);
        let raw = encode(&message).unwrap();

        let without = Codec::default().decode(&raw).unwrap_err();
        assert_eq!(without.code(), ErrorCode::IntegrityViolation);

        let decoded = Codec::default()
            .with_cipher(Arc::new(Reverse))
            .decode(&raw)
            .unwrap();
        assert_eq!(decoded.payload, plaintext);
    }

    #[test]
    fn peek_recovers_reply_address() {
        let raw = raw_with(json!({"id": "msg-9", "source": {"agent_id": "agent-z"}}));
        let peeked = Codec::default().peek(&raw);
        assert_eq!(peeked.id.as_deref(), Some("msg-9"));
        assert_eq!(
            peeked.source.and_then(|s| s.agent_id),
            Some(AgentId::new("agent-z").unwrap())
        );
    }
}
