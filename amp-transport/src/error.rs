//! Transport error type.

use amp_codec::CodecError;
use amp_primitives::ErrorCode;
use thiserror::Error;

/// Result alias used by transports.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type shared by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport is misconfigured.
    #[error("transport not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// The destination has no known address on this transport.
    #[error("no route to agent `{agent}`")]
    UnknownPeer {
        /// Destination agent id.
        agent: String,
    },

    /// Connection-level failure (refused, reset, peer gone, 5xx).
    #[error("transport connection error: {reason}")]
    Connection {
        /// Additional context about the error.
        reason: String,
    },

    /// The peer did not answer in time.
    #[error("transport timed out")]
    Timeout,

    /// The peer rejected the request at the transport level.
    #[error("peer rejected message with status {status}")]
    Rejected {
        /// Transport status code.
        status: u16,
    },

    /// The inbound stream was already taken or the transport is shut down.
    #[error("transport closed")]
    Closed,

    /// Outbound message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for connection failures.
    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same send may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }

    /// Standard wire code reported when forwarding fails.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownPeer { .. } => ErrorCode::AgentNotFound,
            Self::Timeout => ErrorCode::Timeout,
            Self::Connection { .. } | Self::Closed => ErrorCode::InsufficientResources,
            Self::Rejected { status: 413 } => ErrorCode::MessageTooLarge,
            Self::Codec(err) => err.code(),
            Self::Configuration { .. } | Self::Rejected { .. } => ErrorCode::InternalError,
        }
    }
}
