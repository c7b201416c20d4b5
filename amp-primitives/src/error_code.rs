//! Standard AMP error codes and their taxonomy.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Error code carried in the `code` field of an error payload.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Payload bytes are not valid JSON.
    MalformedJson,
    /// Protocol marker names an unknown protocol or major version.
    UnsupportedProtocolVersion,
    /// Required fields are missing or have the wrong shape.
    SchemaViolation,
    /// Raw message exceeds the configured size bound.
    MessageTooLarge,
    /// Timestamp falls outside the clock-skew window.
    InvalidTimestamp,
    /// Destination agent is unknown or unreachable.
    AgentNotFound,
    /// No registered capability satisfies the request.
    CapabilityNotFound,
    /// Credentials were missing, invalid, or not authorised.
    AuthenticationFailed,
    /// Caller exhausted its rate-limit bucket.
    RateLimitExceeded,
    /// Deadline elapsed before a result was produced.
    Timeout,
    /// A capability schema is itself unusable.
    InvalidSchema,
    /// Request parameters do not satisfy the input schema or constraints.
    InvalidParameters,
    /// A session id was supplied but no live context exists for it.
    ContextNotFound,
    /// The runtime cannot accept more work.
    InsufficientResources,
    /// The (source, nonce) pair was already seen within the replay window.
    ReplayDetected,
    /// Signature or decryption check failed.
    IntegrityViolation,
    /// Unexpected failure inside the runtime or a handler.
    InternalError,
}

/// Broad family an [`ErrorCode`] belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    /// Malformed or unsupported input, rejected before dispatch.
    Protocol,
    /// Authentication, integrity, or replay failures.
    Security,
    /// Schema or constraint mismatches, reported with field detail.
    Validation,
    /// Handler or runtime internal failures.
    Execution,
    /// Timeouts and connection failures; eligible for retry.
    Transient,
    /// Destination or capability resolution failures.
    Routing,
}

impl ErrorCode {
    /// All codes, in declaration order.
    pub const ALL: [Self; 17] = [
        Self::MalformedJson,
        Self::UnsupportedProtocolVersion,
        Self::SchemaViolation,
        Self::MessageTooLarge,
        Self::InvalidTimestamp,
        Self::AgentNotFound,
        Self::CapabilityNotFound,
        Self::AuthenticationFailed,
        Self::RateLimitExceeded,
        Self::Timeout,
        Self::InvalidSchema,
        Self::InvalidParameters,
        Self::ContextNotFound,
        Self::InsufficientResources,
        Self::ReplayDetected,
        Self::IntegrityViolation,
        Self::InternalError,
    ];

    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedJson => "MALFORMED_JSON",
            Self::UnsupportedProtocolVersion => "UNSUPPORTED_PROTOCOL_VERSION",
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::CapabilityNotFound => "CAPABILITY_NOT_FOUND",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidSchema => "INVALID_SCHEMA",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::ContextNotFound => "CONTEXT_NOT_FOUND",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::IntegrityViolation => "INTEGRITY_VIOLATION",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category used to decide retry eligibility and detail suppression.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::MalformedJson
            | Self::UnsupportedProtocolVersion
            | Self::SchemaViolation
            | Self::MessageTooLarge
            | Self::InvalidTimestamp => ErrorCategory::Protocol,
            Self::AuthenticationFailed | Self::ReplayDetected | Self::IntegrityViolation => {
                ErrorCategory::Security
            }
            Self::InvalidSchema | Self::InvalidParameters | Self::RateLimitExceeded => {
                ErrorCategory::Validation
            }
            Self::InternalError => ErrorCategory::Execution,
            Self::Timeout | Self::InsufficientResources => ErrorCategory::Transient,
            Self::AgentNotFound | Self::CapabilityNotFound | Self::ContextNotFound => {
                ErrorCategory::Routing
            }
        }
    }

    /// Whether a caller may retry an operation that failed with this code.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    /// Whether error details must be withheld from the wire.
    #[must_use]
    pub const fn suppresses_detail(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Security | ErrorCategory::Execution
        )
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
