//! Validation errors raised while building primitive types.

use thiserror::Error;

/// Result alias for primitive construction.
pub type Result<T> = std::result::Result<T, Error>;

/// Rejected ids, identities, capabilities, and versions.
#[derive(Debug, Error)]
pub enum Error {
    /// Agent identifier failed validation.
    #[error("invalid agent id `{id}`: {reason}")]
    InvalidAgentId {
        /// Rejected input.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Capability identifier failed validation.
    #[error("invalid capability id `{id}`: {reason}")]
    InvalidCapabilityId {
        /// Rejected input.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Capability definition failed validation.
    #[error("invalid capability: {reason}")]
    InvalidCapability {
        /// Why it was rejected.
        reason: String,
    },

    /// Agent identity failed validation.
    #[error("invalid agent identity: {reason}")]
    InvalidIdentity {
        /// Why it was rejected.
        reason: String,
    },

    /// A semantic version string could not be parsed.
    #[error("invalid semantic version `{input}`: {source}")]
    InvalidVersion {
        /// Rejected input.
        input: String,
        /// Parser error.
        #[source]
        source: semver::Error,
    },
}
