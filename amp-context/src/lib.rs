//! Shared conversational context for AMP agents.
//!
//! A [`ContextStore`] owns every context of a runtime. Contexts hold shared
//! memory visible to all participants plus a private partition per agent,
//! can be forked and merged, and expire after an optional ttl. Handlers get
//! a [`ContextHandle`] scoped to the calling agent.

#![warn(missing_docs, clippy::pedantic)]

pub mod backing;
mod error;
mod handle;
mod record;
mod store;

pub use backing::{BackingStore, FileBackingStore, InMemoryBackingStore};
pub use error::{ContextError, ContextResult};
pub use handle::ContextHandle;
pub use record::{AccessControl, ContextOptions, ContextSnapshot, Lineage};
pub use store::{ContextConfig, ContextStore};
