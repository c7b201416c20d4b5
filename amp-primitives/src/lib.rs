//! Core shared types for Agent Mesh Protocol runtimes.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod error;
mod error_code;
mod identity;
mod ids;
mod message;

/// Capability descriptors and supporting builders.
pub use capability::{
    Capability, CapabilityBuilder, CapabilityConstraints, CapabilityId, RateLimit, parse_version,
};
/// Error type and result alias shared across the runtime.
pub use error::{Error, Result};
/// Standard wire error codes.
pub use error_code::{ErrorCategory, ErrorCode};
/// Identity advertised by an agent and resolved by authentication.
pub use identity::{AgentIdentity, AgentIdentityBuilder};
/// Identifiers for agents, messages, and contexts.
pub use ids::{AgentId, new_context_id, new_message_id};
/// Wire message model.
pub use message::{
    Credentials, EncryptionAlgorithm, EncryptionHeader, Endpoint, ErrorPayload, Headers, Message,
    MessageType, PROTOCOL_MAJOR, PROTOCOL_NAME, PROTOCOL_VERSION, Priority, RequestPayload,
    ResponsePayload, ResponseStatus, SignatureAlgorithm, SignatureHeader,
};

/// Re-exported so downstream crates agree on the semver type.
pub use semver;
