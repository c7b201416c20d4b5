//! Capability registry for AMP agents.
//!
//! Capabilities are keyed by (id, semantic version) and bound to a
//! [`CapabilityHandler`]. Requests resolve through version negotiation: a
//! preferred version wins when it satisfies the constraint, otherwise the
//! highest satisfying version is chosen. Input and output schemas are
//! compiled at registration time.

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod handler;
pub mod negotiate;
pub mod registry;
pub mod schema;

pub use error::{HandlerError, HandlerResult, RegistryError, RegistryResult};
pub use handler::{CapabilityHandler, Invocation};
pub use negotiate::{VersionConstraint, negotiate};
pub use registry::{CapabilityRegistry, Registration};
pub use schema::{CompiledSchema, FieldViolation};
