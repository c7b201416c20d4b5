//! Wire message model.
//!
//! These types mirror the JSON carried inside the `message` field of an AMP
//! envelope. Unknown fields on endpoints and headers are preserved so that a
//! decoded message re-encodes to the same logical document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AgentId, CapabilityId, ErrorCode, new_message_id};

/// Protocol family literal placed in the envelope marker.
pub const PROTOCOL_NAME: &str = "AMP";
/// Major protocol version implemented by this runtime.
pub const PROTOCOL_MAJOR: u32 = 1;
/// Full marker emitted on outbound envelopes.
pub const PROTOCOL_VERSION: &str = "AMP/1.0";

/// Discriminates the payload shape of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Capability invocation.
    Request,
    /// Successful outcome of a request.
    Response,
    /// Fire-and-forget notification.
    Event,
    /// Failed outcome of a request.
    Error,
}

impl MessageType {
    /// Wire name of the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Error => "error",
        }
    }
}

/// Source or destination address of a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Addressed agent. Absent on a destination means "whoever receives it".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Session whose context the message operates in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unrecognised fields, kept for round-tripping.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Endpoint {
    /// Endpoint naming a single agent.
    #[must_use]
    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    /// Attaches a session id.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Delivery priority hint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Latency-sensitive work.
    High,
    /// Must not be delayed.
    Critical,
}

/// Authentication credentials, selected by the `type` discriminator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "credentials", rename_all = "snake_case")]
pub enum Credentials {
    /// Opaque shared API key.
    ApiKey(String),
    /// Compact-serialised JSON web token.
    Jwt(String),
    /// Client certificate chain, leaf first, each entry base64 DER, plus a
    /// proof that the sender holds the leaf's private key.
    Mtls {
        /// Leaf certificate followed by intermediates.
        certificate_chain: Vec<String>,
        /// Base64 signature over the message signing string made with the
        /// leaf certificate's key.
        proof: String,
    },
    /// HMAC over the canonical signing string with a shared secret.
    Hmac {
        /// Identifier of the shared secret.
        key_id: String,
        /// Base64 MAC value.
        signature: String,
    },
}

impl Credentials {
    /// Mechanism name as it appears in the `type` field.
    #[must_use]
    pub const fn mechanism(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::Jwt(_) => "jwt",
            Self::Mtls { .. } => "mtls",
            Self::Hmac { .. } => "hmac",
        }
    }
}

/// Message signature algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// HMAC-SHA256 with a shared secret.
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    /// Ed25519 with a per-key public key.
    #[serde(rename = "ed25519")]
    Ed25519,
}

/// Signature over the canonical signing string.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignatureHeader {
    /// Algorithm used to produce `value`.
    pub algorithm: SignatureAlgorithm,
    /// Base64 signature bytes.
    pub value: String,
    /// Key identifier; falls back to the source agent id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Payload encryption algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// AES-256 in Galois/Counter mode.
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

/// Declares that the payload is encrypted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EncryptionHeader {
    /// Cipher used for the payload.
    pub algorithm: EncryptionAlgorithm,
    /// Identifier of the symmetric key.
    pub key_id: String,
}

/// Message headers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    /// Id of the message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Delivery priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Caller deadline for the request, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Free-form hints for intermediaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_hints: Option<Value>,
    /// Replay nonce. The message id is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Sender credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    /// Integrity signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureHeader>,
    /// Payload encryption descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionHeader>,
    /// Unrecognised headers, kept for round-tripping.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// A decoded AMP message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// Payload discriminator.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Creation time at the sender.
    pub timestamp: DateTime<Utc>,
    /// Sender address.
    #[serde(default)]
    pub source: Endpoint,
    /// Recipient address.
    #[serde(default)]
    pub destination: Endpoint,
    /// Protocol headers.
    #[serde(default)]
    pub headers: Headers,
    /// Type-dependent body.
    #[serde(default)]
    pub payload: Value,
    /// Unrecognised message fields, kept for round-tripping.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
    /// Envelope marker the message arrived with when it differs from
    /// [`PROTOCOL_VERSION`]; `None` is sent as [`PROTOCOL_VERSION`].
    #[serde(skip)]
    pub protocol: Option<String>,
    /// Unrecognised envelope fields beside `protocol` and `message`.
    #[serde(skip)]
    pub envelope_extensions: Map<String, Value>,
}

impl Message {
    /// Creates a message with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(kind: MessageType, source: Endpoint, destination: Endpoint, payload: Value) -> Self {
        Self {
            id: new_message_id(),
            kind,
            timestamp: Utc::now(),
            source,
            destination,
            headers: Headers::default(),
            payload,
            extensions: Map::new(),
            protocol: None,
            envelope_extensions: Map::new(),
        }
    }

    /// Builds a request message.
    #[must_use]
    pub fn request(source: Endpoint, destination: Endpoint, request: &RequestPayload) -> Self {
        Self::new(
            MessageType::Request,
            source,
            destination,
            to_payload(request),
        )
    }

    /// Builds an event message.
    #[must_use]
    pub fn event(source: Endpoint, destination: Endpoint, payload: Value) -> Self {
        Self::new(MessageType::Event, source, destination, payload)
    }

    /// Builds a response answering `self`, addressed back to its source.
    #[must_use]
    pub fn reply_response(&self, from: Endpoint, response: &ResponsePayload) -> Self {
        self.reply(MessageType::Response, from, to_payload(response))
    }

    /// Builds an error answering `self`, addressed back to its source.
    #[must_use]
    pub fn reply_error(&self, from: Endpoint, error: &ErrorPayload) -> Self {
        self.reply(MessageType::Error, from, to_payload(error))
    }

    fn reply(&self, kind: MessageType, from: Endpoint, payload: Value) -> Self {
        let mut message = Self::new(kind, from, self.source.clone(), payload);
        message.headers.correlation_id = Some(self.id.clone());
        message.headers.priority = self.headers.priority;
        message
    }

    /// Envelope marker to emit when encoding.
    #[must_use]
    pub fn protocol_marker(&self) -> &str {
        self.protocol.as_deref().unwrap_or(PROTOCOL_VERSION)
    }

    /// Nonce used for replay detection.
    #[must_use]
    pub fn nonce(&self) -> &str {
        self.headers.nonce.as_deref().unwrap_or(&self.id)
    }

    /// Effective priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.headers.priority.unwrap_or_default()
    }

    /// Deserialises the payload into a typed body.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error when the payload does not
    /// match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

fn to_payload<T: Serialize>(body: &T) -> Value {
    // Payload structs contain only maps, strings, and numbers.
    serde_json::to_value(body).unwrap_or(Value::Null)
}

/// Body of a `request` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Capability to invoke.
    pub capability: CapabilityId,
    /// Semantic-version constraint, e.g. `>=1.0.0 <2.0.0`. Any version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Version to prefer when it satisfies the constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<String>,
    /// Capability arguments.
    #[serde(default)]
    pub parameters: Value,
    /// Parent task id for delegated work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    /// Where the result of delegated work must be delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_callback: Option<Endpoint>,
}

impl RequestPayload {
    /// Request for `capability` with the given parameters and no version constraint.
    #[must_use]
    pub fn new(capability: CapabilityId, parameters: Value) -> Self {
        Self {
            capability,
            version: None,
            preferred_version: None,
            parameters,
            parent_task_id: None,
            completion_callback: None,
        }
    }

    /// Sets the version constraint.
    #[must_use]
    pub fn with_version(mut self, constraint: impl Into<String>) -> Self {
        self.version = Some(constraint.into());
        self
    }

    /// Sets the preferred version.
    #[must_use]
    pub fn with_preferred_version(mut self, version: impl Into<String>) -> Self {
        self.preferred_version = Some(version.into());
        self
    }

    /// Marks the request as delegated work reporting to `callback`.
    #[must_use]
    pub fn delegated(mut self, parent_task_id: impl Into<String>, callback: Endpoint) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self.completion_callback = Some(callback);
        self
    }

    /// Whether the request asks for asynchronous completion.
    #[must_use]
    pub fn is_delegated(&self) -> bool {
        self.parent_task_id.is_some() && self.completion_callback.is_some()
    }
}

/// Outcome status of a `response` message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The capability completed and `result` holds its output.
    Success,
    /// Delegated work was accepted; the result follows later.
    Accepted,
}

/// Body of a `response` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Outcome status.
    pub status: ResponseStatus,
    /// Capability output.
    #[serde(default)]
    pub result: Value,
    /// Version that actually served the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_version: Option<String>,
    /// Execution measurements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl ResponsePayload {
    /// Successful response carrying `result`.
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            result,
            capability_version: None,
            metrics: None,
        }
    }

    /// Acknowledgement for delegated work.
    #[must_use]
    pub fn accepted(task_id: &str) -> Self {
        Self {
            status: ResponseStatus::Accepted,
            result: serde_json::json!({ "task_id": task_id }),
            capability_version: None,
            metrics: None,
        }
    }
}

/// Body of an `error` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Standard error code.
    pub code: ErrorCode,
    /// Human-readable summary.
    pub message: String,
    /// Structured detail; withheld for security and execution errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the caller may retry.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorPayload {
    /// Builds an error payload, dropping `details` when the code requires it.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            details: if code.suppresses_detail() {
                None
            } else {
                details
            },
            retryable: code.is_transient(),
        }
    }
}
