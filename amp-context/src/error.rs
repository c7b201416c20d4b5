//! Error types for the context store.

use amp_primitives::ErrorCode;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Errors emitted by context components.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The provided configuration was invalid.
    #[error("invalid context configuration: {0}")]
    InvalidConfig(&'static str),
    /// No live context has this id.
    #[error("context `{id}` not found")]
    NotFound {
        /// Requested context id.
        id: String,
    },
    /// No live context is bound to this session.
    #[error("no context for session `{session_id}`")]
    SessionNotFound {
        /// Requested session id.
        session_id: String,
    },
    /// A live context is already bound to this session.
    #[error("session `{session_id}` already has context `{context_id}`")]
    SessionExists {
        /// Session id.
        session_id: String,
        /// Context currently bound to it.
        context_id: String,
    },
    /// Caller is not on the context access list.
    #[error("agent `{agent}` may not {operation} context `{context_id}`")]
    AccessDenied {
        /// Context id.
        context_id: String,
        /// Caller agent id, or `anonymous`.
        agent: String,
        /// `read` or `write`.
        operation: &'static str,
    },
    /// Merge requested on a context without a parent.
    #[error("context `{id}` has no parent to merge into")]
    NoParent {
        /// Context id.
        id: String,
    },
    /// Context id cannot be used as a storage key.
    #[error("invalid context id `{id}`")]
    InvalidId {
        /// Offending id.
        id: String,
    },
    /// Underlying I/O failure while reading or writing context files.
    #[error("i/o error: {source}")]
    Io {
        /// Source [`std::io::Error`].
        #[from]
        source: std::io::Error,
    },
    /// Serialization or deserialization error.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: SerdeError,
    },
}

impl ContextError {
    /// Helper for [`ContextError::NotFound`].
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Standard wire code for this failure.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } | Self::SessionNotFound { .. } | Self::NoParent { .. } => {
                ErrorCode::ContextNotFound
            }
            Self::AccessDenied { .. } => ErrorCode::AuthenticationFailed,
            Self::SessionExists { .. } | Self::InvalidId { .. } => ErrorCode::InvalidParameters,
            Self::InvalidConfig(_) | Self::Io { .. } | Self::Serialization { .. } => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Result type alias for context operations.
pub type ContextResult<T> = Result<T, ContextError>;
