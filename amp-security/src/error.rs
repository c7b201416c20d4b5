use amp_primitives::ErrorCode;
use thiserror::Error;

/// Result alias for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Failures raised by the security envelope.
///
/// The `reason` strings are for logs only; the wire carries the generic code.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// Credentials were rejected or missing.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed {
        /// Internal reason.
        reason: String,
    },

    /// Authenticated caller is not allowed to perform the action.
    #[error("access denied for `{agent}` on `{capability}`: {reason}")]
    AccessDenied {
        /// Caller agent id, or `anonymous`.
        agent: String,
        /// Requested capability.
        capability: String,
        /// Rule outcome.
        reason: String,
    },

    /// Signature was missing, malformed, or did not verify.
    #[error("integrity violation: {reason}")]
    IntegrityViolation {
        /// Internal reason.
        reason: String,
    },

    /// The (source, nonce) pair was already seen within the window.
    #[error("replay detected for source `{source_agent}` nonce `{nonce}`")]
    ReplayDetected {
        /// Source agent id, or `anonymous`.
        source_agent: String,
        /// Repeated nonce.
        nonce: String,
    },

    /// Replay cache is saturated with unexpired entries.
    #[error("replay cache full ({capacity} live entries)")]
    ReplayCacheFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// Key material or configuration was unusable.
    #[error("invalid security configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}

impl SecurityError {
    /// Shorthand for [`SecurityError::AuthenticationFailed`].
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SecurityError::IntegrityViolation`].
    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SecurityError::InvalidConfig`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailed { .. } | Self::AccessDenied { .. } => {
                ErrorCode::AuthenticationFailed
            }
            Self::IntegrityViolation { .. } => ErrorCode::IntegrityViolation,
            Self::ReplayDetected { .. } => ErrorCode::ReplayDetected,
            Self::ReplayCacheFull { .. } => ErrorCode::InsufficientResources,
            Self::InvalidConfig { .. } => ErrorCode::InternalError,
        }
    }
}
