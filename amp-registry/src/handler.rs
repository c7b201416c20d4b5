//! Capability handler plugin interface.

use std::future::Future;
use std::sync::Arc;

use amp_context::ContextHandle;
use amp_primitives::{AgentId, Capability};
use async_trait::async_trait;
use serde_json::Value;

use crate::HandlerResult;

/// Everything a handler receives for one request.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Id of the request message.
    pub message_id: String,
    /// Authenticated caller, or the unauthenticated `source.agent_id`.
    pub caller: Option<AgentId>,
    /// Descriptor of the resolved capability version.
    pub capability: Arc<Capability>,
    /// Validated request parameters.
    pub parameters: Value,
    /// Session context, when the request named a session.
    pub context: Option<ContextHandle>,
}

/// Trait implemented by capability handlers.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Executes the capability, returning its JSON result.
    async fn execute(&self, invocation: Invocation) -> HandlerResult<Value>;
}

#[async_trait]
impl<F, Fut> CapabilityHandler for F
where
    F: Send + Sync + Fn(Invocation) -> Fut,
    Fut: Future<Output = HandlerResult<Value>> + Send,
{
    async fn execute(&self, invocation: Invocation) -> HandlerResult<Value> {
        (self)(invocation).await
    }
}
