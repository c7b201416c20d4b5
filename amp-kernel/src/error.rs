//! Runtime errors and their wire mapping.

use std::time::Duration;

use amp_codec::CodecError;
use amp_context::ContextError;
use amp_primitives::{Error as ModelError, ErrorCode, ErrorPayload};
use amp_registry::{HandlerError, RegistryError};
use amp_security::SecurityError;
use amp_transport::TransportError;
use serde_json::{Value, json};
use thiserror::Error;

use crate::lifecycle::LifecycleError;
use crate::scheduler::SchedulerError;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Every failure the runtime can report, inbound or outbound.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Wire decode or encode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Authentication, integrity, replay, or authorization failure.
    #[error(transparent)]
    Security(#[from] SecurityError),
    /// Context lookup or access failure.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Capability resolution or validation failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Handler reported a failure.
    #[error(transparent)]
    Handler(#[from] HandlerError),
    /// Outbound delivery failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Worker pool refused the task.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// Dispatcher attempted an illegal state transition.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Identifier or descriptor failed validation.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Per-caller token bucket is empty.
    #[error("rate limit exceeded for `{agent}` on `{capability}`")]
    RateLimited {
        /// Caller agent id, or `anonymous`.
        agent: String,
        /// Capability id.
        capability: String,
    },
    /// Deadline elapsed before an outcome was available.
    #[error("timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        /// Deadline that elapsed.
        elapsed: Duration,
    },
    /// A peer answered with an error payload.
    #[error("remote error {}: {}", .payload.code, .payload.message)]
    Remote {
        /// Payload as received.
        payload: ErrorPayload,
    },
    /// A peer answered with something other than a response or error.
    #[error("unexpected reply: {reason}")]
    UnexpectedReply {
        /// What was wrong.
        reason: String,
    },
    /// Outbound operation attempted without a transport.
    #[error("no transport attached")]
    NoTransport,
    /// Transient failures persisted through every retry.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Final failure.
        last: Box<RuntimeError>,
    },
    /// Runtime configuration was rejected.
    #[error("invalid runtime configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
    /// Handler task ended without producing a result.
    #[error("internal error: {reason}")]
    Internal {
        /// Internal description.
        reason: String,
    },
}

impl RuntimeError {
    /// Shorthand for [`RuntimeError::InvalidConfig`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`RuntimeError::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Codec(err) => err.code(),
            Self::Security(err) => err.code(),
            Self::Context(err) => err.code(),
            Self::Registry(err) => err.code(),
            Self::Handler(err) => err.code(),
            Self::Transport(err) => err.code(),
            Self::Scheduler(_) => ErrorCode::InsufficientResources,
            Self::Model(_) => ErrorCode::InvalidParameters,
            Self::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Remote { payload } => payload.code,
            Self::RetriesExhausted { last, .. } => last.code(),
            Self::Lifecycle(_)
            | Self::UnexpectedReply { .. }
            | Self::NoTransport
            | Self::InvalidConfig { .. }
            | Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether another attempt may succeed: timeouts and connection failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport(err) => err.is_transient(),
            Self::Remote { payload } => payload.code == ErrorCode::Timeout,
            _ => false,
        }
    }

    /// Structured detail safe to put on the wire.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Registry(err) => err.details(),
            Self::Handler(HandlerError::InvalidParameters { reason }) => {
                Some(json!({ "reason": reason }))
            }
            Self::Timeout { elapsed } => Some(json!({
                "timeout_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            })),
            Self::RateLimited { capability, .. } => Some(json!({ "capability": capability })),
            Self::Codec(CodecError::SchemaViolation { path, reason }) => {
                Some(json!({ "path": path, "reason": reason }))
            }
            _ => None,
        }
    }

    /// Caller-facing summary; internal reasons stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::AuthenticationFailed => "authentication failed".to_owned(),
            ErrorCode::IntegrityViolation => "integrity check failed".to_owned(),
            ErrorCode::ReplayDetected => "replayed message".to_owned(),
            ErrorCode::InternalError => "internal error".to_owned(),
            ErrorCode::InsufficientResources => "insufficient resources".to_owned(),
            _ => self.to_string(),
        }
    }

    /// Error payload for the wire.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        if let Self::Remote { payload } = self {
            return payload.clone();
        }
        ErrorPayload::new(self.code(), self.public_message(), self.details())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::ErrorCategory;

    #[test]
    fn codes_follow_sources() {
        let err = RuntimeError::from(HandlerError::execution("db down"));
        assert_eq!(err.code(), ErrorCode::InternalError);
        let payload = err.to_payload();
        assert_eq!(payload.message, "internal error");
        assert!(payload.details.is_none());

        let err = RuntimeError::RateLimited {
            agent: "agent-a".into(),
            capability: "translate".into(),
        };
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(err.code().category(), ErrorCategory::Validation);
        assert_eq!(err.to_payload().details.unwrap()["capability"], "translate");
    }

    #[test]
    fn security_errors_hide_reason() {
        let err = RuntimeError::from(SecurityError::auth("unknown api key `k-1`"));
        let payload = err.to_payload();
        assert_eq!(payload.code, ErrorCode::AuthenticationFailed);
        assert_eq!(payload.message, "authentication failed");
        assert!(!payload.retryable);
    }

    #[test]
    fn transient_classification() {
        assert!(RuntimeError::Timeout { elapsed: Duration::from_millis(5) }.is_transient());
        assert!(RuntimeError::from(TransportError::connection("refused")).is_transient());
        assert!(!RuntimeError::from(SecurityError::integrity("bad mac")).is_transient());
        let exhausted = RuntimeError::RetriesExhausted {
            attempts: 3,
            last: Box::new(RuntimeError::Timeout { elapsed: Duration::from_secs(1) }),
        };
        assert!(!exhausted.is_transient());
        assert_eq!(exhausted.code(), ErrorCode::Timeout);
    }
}
