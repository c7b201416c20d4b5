//! Registry and handler errors.

use amp_primitives::ErrorCode;
use serde_json::{Value, json};
use thiserror::Error;

use crate::schema::FieldViolation;

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced while registering or resolving capabilities.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No capability with this id is registered.
    #[error("capability `{id}` is not registered")]
    CapabilityNotFound {
        /// Requested capability id.
        id: String,
        /// Capability ids currently registered.
        available: Vec<String>,
    },

    /// The capability exists but no registered version satisfies the constraint.
    #[error("no version of `{id}` satisfies `{constraint}`")]
    NoMatchingVersion {
        /// Requested capability id.
        id: String,
        /// Requested constraint.
        constraint: String,
        /// Versions currently registered for the id.
        available: Vec<String>,
    },

    /// A version constraint or preferred version could not be parsed.
    #[error("invalid version constraint `{constraint}`: {reason}")]
    InvalidConstraint {
        /// Offending input.
        constraint: String,
        /// Parser message.
        reason: String,
    },

    /// A capability declared a schema that does not compile.
    #[error("capability `{capability}` declares an invalid schema: {reason}")]
    InvalidSchema {
        /// Capability id.
        capability: String,
        /// Compiler message.
        reason: String,
    },

    /// Request parameters do not satisfy the input schema.
    #[error("parameters do not match the input schema")]
    InvalidParameters {
        /// One entry per failing field.
        violations: Vec<FieldViolation>,
    },

    /// Serialized parameters exceed `max_input_length`.
    #[error("input length {length} exceeds limit {limit}")]
    InputTooLong {
        /// Serialized parameter length in bytes.
        length: usize,
        /// Declared limit.
        limit: usize,
    },

    /// `parameters.language` is outside `supported_languages`.
    #[error("language `{language}` is not supported")]
    UnsupportedLanguage {
        /// Requested language.
        language: String,
        /// Declared languages.
        supported: Vec<String>,
    },

    /// A handler returned a result violating its own output schema.
    #[error("capability `{capability}` produced output violating its schema")]
    InvalidOutput {
        /// Capability id.
        capability: String,
        /// One entry per failing field.
        violations: Vec<FieldViolation>,
    },
}

impl RegistryError {
    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CapabilityNotFound { .. } | Self::NoMatchingVersion { .. } => {
                ErrorCode::CapabilityNotFound
            }
            Self::InvalidConstraint { .. }
            | Self::InvalidParameters { .. }
            | Self::InputTooLong { .. }
            | Self::UnsupportedLanguage { .. } => ErrorCode::InvalidParameters,
            Self::InvalidSchema { .. } => ErrorCode::InvalidSchema,
            Self::InvalidOutput { .. } => ErrorCode::InternalError,
        }
    }

    /// Caller-facing detail attached to the wire error payload.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::CapabilityNotFound { available, .. } => {
                Some(json!({ "available_capabilities": available }))
            }
            Self::NoMatchingVersion { available, .. } => {
                Some(json!({ "available_versions": available }))
            }
            Self::InvalidParameters { violations } => Some(json!({ "violations": violations })),
            Self::InputTooLong { length, limit } => {
                Some(json!({ "input_length": length, "max_input_length": limit }))
            }
            Self::UnsupportedLanguage { supported, .. } => {
                Some(json!({ "supported_languages": supported }))
            }
            Self::InvalidConstraint { .. } | Self::InvalidSchema { .. } | Self::InvalidOutput { .. } => {
                None
            }
        }
    }
}

/// Result alias returned by capability handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Failures reported by capability handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Parameters passed the schema but the handler rejected them.
    #[error("invalid parameters: {reason}")]
    InvalidParameters {
        /// Caller-facing reason.
        reason: String,
    },

    /// Handler-internal failure; the reason is logged, never sent.
    #[error("execution failed: {reason}")]
    Execution {
        /// Internal reason.
        reason: String,
    },

    /// A resource the handler depends on is exhausted.
    #[error("resources unavailable: {reason}")]
    Unavailable {
        /// Internal reason.
        reason: String,
    },
}

impl HandlerError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }

    /// Creates a parameter rejection.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Creates a resource exhaustion error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameters { .. } => ErrorCode::InvalidParameters,
            Self::Execution { .. } => ErrorCode::InternalError,
            Self::Unavailable { .. } => ErrorCode::InsufficientResources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_lists_available_ids() {
        let err = RegistryError::CapabilityNotFound {
            id: "translate".into(),
            available: vec!["echo".into(), "summarize".into()],
        };
        assert_eq!(err.code(), ErrorCode::CapabilityNotFound);
        assert_eq!(
            err.details(),
            Some(json!({ "available_capabilities": ["echo", "summarize"] }))
        );
    }

    #[test]
    fn invalid_output_is_internal_without_detail() {
        let err = RegistryError::InvalidOutput {
            capability: "echo".into(),
            violations: vec![FieldViolation::new("result", "expected string")],
        };
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(err.details().is_none());
    }

    #[test]
    fn handler_error_codes() {
        assert_eq!(HandlerError::execution("boom").code(), ErrorCode::InternalError);
        assert_eq!(HandlerError::invalid("bad").code(), ErrorCode::InvalidParameters);
        assert_eq!(
            HandlerError::unavailable("pool").code(),
            ErrorCode::InsufficientResources
        );
    }
}
