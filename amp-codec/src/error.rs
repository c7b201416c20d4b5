use amp_primitives::ErrorCode;
use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failures raised while decoding or encoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Raw input exceeded the configured bound.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the rejected input.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Input was not parseable JSON.
    #[error("malformed json: {source}")]
    MalformedJson {
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// Envelope carried an unknown protocol marker or major version.
    #[error("unsupported protocol version `{marker}`")]
    UnsupportedProtocolVersion {
        /// Marker found in the envelope.
        marker: String,
    },

    /// A required field was missing or malformed.
    #[error("schema violation at `{path}`: {reason}")]
    SchemaViolation {
        /// JSON path of the offending field.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Timestamp outside the accepted clock-skew window.
    #[error("timestamp {timestamp} outside the {skew_secs}s skew window")]
    InvalidTimestamp {
        /// Timestamp carried by the message.
        timestamp: String,
        /// Configured tolerance.
        skew_secs: u64,
    },

    /// Encrypted payload could not be opened.
    #[error("integrity violation: {reason}")]
    IntegrityViolation {
        /// Internal reason, never sent on the wire.
        reason: String,
    },

    /// Serialising an outbound message failed.
    #[error("failed to encode message: {source}")]
    Encode {
        /// Serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// Codec configuration rejected.
    #[error("invalid codec configuration: {reason}")]
    InvalidConfig {
        /// Why the configuration is unusable.
        reason: String,
    },
}

impl CodecError {
    /// Convenience constructor for [`CodecError::SchemaViolation`].
    pub fn schema(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            Self::MalformedJson { .. } => ErrorCode::MalformedJson,
            Self::UnsupportedProtocolVersion { .. } => ErrorCode::UnsupportedProtocolVersion,
            Self::SchemaViolation { .. } => ErrorCode::SchemaViolation,
            Self::InvalidTimestamp { .. } => ErrorCode::InvalidTimestamp,
            Self::IntegrityViolation { .. } => ErrorCode::IntegrityViolation,
            Self::Encode { .. } | Self::InvalidConfig { .. } => ErrorCode::InternalError,
        }
    }
}
