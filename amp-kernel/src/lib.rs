//! Agent runtime for the Agent Mesh Protocol.
//!
//! [`AgentRuntime`] owns the dispatcher: every inbound wire message is
//! decoded, admitted by the security envelope, routed to a local capability
//! or forwarded, and answered with exactly one correlated `response` or
//! `error`. Handler work runs on a bounded [`TaskScheduler`], outbound calls
//! retry transient failures under a [`RetryPolicy`], and delegated work is
//! acknowledged immediately and completed through a callback.
//!
//! The registry service is reached over the mesh itself through
//! [`MeshRegistryClient`], kept alive by a [`RegistrationController`].

#![warn(missing_docs, clippy::pedantic)]

mod dispatch;
mod error;
pub mod lifecycle;
mod outbound;
mod pending;
mod ratelimit;
pub mod registry;
pub mod registry_wire;
pub mod retry;
mod runtime;
pub mod scheduler;
mod settings;
pub mod sink;

pub use error::{RuntimeError, RuntimeResult};
pub use lifecycle::{DispatchEvent, DispatchLifecycle, DispatchState, LifecycleError, LifecycleResult, Route};
pub use outbound::{DelegatedTask, RequestOptions};
pub use pending::PendingRequests;
pub use ratelimit::RateLimits;
pub use registry::{
    AgentRegistry, MeshRegistryClient, MeshRegistryError, MeshRegistryResult, RegistrationConfig,
    RegistrationController,
};
pub use retry::{RetryPolicy, Retryable};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder};
pub use scheduler::{SchedulerConfig, SchedulerError, SchedulerResult, TaskScheduler};
pub use settings::security_envelope;
pub use sink::{CollectingEventSink, EventSink, TracingEventSink};
