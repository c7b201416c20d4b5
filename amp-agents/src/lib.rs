//! Agent Mesh Protocol runtime SDK facade.
//!
//! Depend on this crate via `cargo add amp-agents`. It bundles the runtime
//! crates behind feature flags so downstream agents can enable only the
//! components they need.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export of the shared message and identity model.
pub use amp_primitives as primitives;

/// Agent runtime and dispatcher (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use amp_kernel as kernel;

/// Wire encoding and validation (enabled by `codec` feature).
#[cfg(feature = "codec")]
pub use amp_codec as codec;

/// Authentication, integrity, replay protection, and access policy
/// (enabled by `security` feature).
#[cfg(feature = "security")]
pub use amp_security as security;

/// Session contexts (enabled by `context` feature).
#[cfg(feature = "context")]
pub use amp_context as context;

/// Versioned capability registry (enabled by `registry` feature).
#[cfg(feature = "registry")]
pub use amp_registry as registry;

/// Loopback and HTTP bindings (enabled by `transport` feature).
#[cfg(feature = "transport")]
pub use amp_transport as transport;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use amp_config as config;

/// Tracing setup and runtime counters (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use amp_telemetry as telemetry;

/// Types most agents need, in one import.
#[cfg(feature = "kernel")]
pub mod prelude {
    pub use amp_kernel::{AgentRuntime, AgentRuntimeBuilder, RequestOptions, RuntimeError, RuntimeResult};
    pub use amp_primitives::{
        AgentId, AgentIdentity, Capability, CapabilityId, ErrorCode, Message, RequestPayload,
        ResponsePayload,
    };
    pub use amp_registry::{CapabilityHandler, HandlerError, HandlerResult, Invocation};
}
