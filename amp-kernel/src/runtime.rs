//! Agent runtime: composition root owning every piece of per-agent state.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use amp_codec::{Codec, CodecConfig};
use amp_context::ContextStore;
use amp_primitives::semver::Version;
use amp_primitives::{AgentId, AgentIdentity, Capability, CapabilityId, Endpoint};
use amp_registry::{CapabilityHandler, CapabilityRegistry};
use amp_security::{SecurityConfig, SecurityEnvelope};
use amp_telemetry::RuntimeMetrics;
use amp_transport::Transport;
use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::pending::PendingRequests;
use crate::ratelimit::RateLimits;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerConfig, TaskScheduler};
use crate::sink::{EventSink, TracingEventSink};
use crate::{RuntimeError, RuntimeResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) struct RuntimeInner {
    pub(crate) identity: AgentIdentity,
    pub(crate) codec: Codec,
    pub(crate) security: SecurityEnvelope,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) contexts: Arc<ContextStore>,
    pub(crate) scheduler: TaskScheduler,
    pub(crate) limits: RateLimits,
    pub(crate) metrics: Arc<RuntimeMetrics>,
    pub(crate) pending: PendingRequests,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) retry: RetryPolicy,
    pub(crate) default_timeout: Duration,
    pub(crate) auto_create_sessions: bool,
    sweep_interval: Duration,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One agent on the mesh.
///
/// Owns the capability registry, context store, replay cache, rate-limit
/// buckets, and pending outbound requests, so several isolated runtimes can
/// live in one process. Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct AgentRuntime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent", self.agent_id())
            .field("registry", &self.inner.registry)
            .field("scheduler", &self.inner.scheduler)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Starts building a runtime for `identity`.
    #[must_use]
    pub fn builder(identity: AgentIdentity) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(identity)
    }

    /// Identity this runtime answers as.
    #[must_use]
    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    /// Shorthand for `identity().id()`.
    #[must_use]
    pub fn agent_id(&self) -> &AgentId {
        self.inner.identity.id()
    }

    /// Endpoint naming this agent.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::agent(self.agent_id().clone())
    }

    /// Capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    /// Context store.
    #[must_use]
    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.inner.contexts
    }

    /// Security envelope.
    #[must_use]
    pub fn security(&self) -> &SecurityEnvelope {
        &self.inner.security
    }

    /// Codec used for inbound decoding.
    #[must_use]
    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.inner.metrics
    }

    /// Handler worker pool.
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    /// Outbound retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Registers `handler` for `capability`. See [`CapabilityRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Registry`] when a schema does not compile.
    pub fn register_capability<H>(
        &self,
        capability: Capability,
        handler: H,
    ) -> RuntimeResult<Option<Arc<Capability>>>
    where
        H: CapabilityHandler + 'static,
    {
        Ok(self.inner.registry.register(capability, handler)?)
    }

    /// Removes (id, version) for future requests; in-flight invocations finish.
    pub fn unregister_capability(&self, id: &CapabilityId, version: &Version) -> Option<Arc<Capability>> {
        self.inner.registry.unregister(id, version)
    }

    /// Uses `transport` for outbound traffic.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self
            .inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    pub(crate) fn transport(&self) -> RuntimeResult<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RuntimeError::NoTransport)
    }

    /// Consumes `transport`'s inbound stream, handling every frame on its own
    /// task, and attaches it for outbound traffic.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Transport`] when the inbound stream was
    /// already taken.
    pub fn serve(&self, transport: Arc<dyn Transport>) -> RuntimeResult<()> {
        let mut inbound = transport.receive()?;
        self.attach_transport(transport);

        let runtime = self.clone();
        let agent = self.agent_id().clone();
        let handle = tokio::spawn(async move {
            info!(%agent, "serving inbound messages");
            while let Some(mut frame) = inbound.next().await {
                let runtime = runtime.clone();
                tokio::spawn(async move {
                    let reply = runtime.handle_message(&frame.raw, frame.bearer.as_deref()).await;
                    frame.respond(reply);
                });
            }
            debug!(%agent, "inbound stream ended");
        });
        self.track(handle);
        Ok(())
    }

    /// Starts the periodic sweep of expired contexts, replay entries, and
    /// idle rate-limit state.
    pub fn spawn_maintenance(&self) {
        let runtime = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(runtime.inner.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                runtime.run_maintenance().await;
            }
        });
        self.track(handle);
    }

    /// Runs one maintenance pass immediately.
    pub async fn run_maintenance(&self) {
        let now = Utc::now();
        let contexts = self.inner.contexts.sweep_expired(now).await;
        let nonces = self.inner.security.purge_replay(now);
        self.inner.limits.retain_recent();
        debug!(contexts, nonces, "maintenance pass complete");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Stops serving, stops maintenance, and refuses further handler work.
    pub fn shutdown(&self) {
        self.inner.scheduler.close();
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(agent = %self.agent_id(), "runtime shut down");
    }
}

/// Builder for [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    pub(crate) identity: AgentIdentity,
    pub(crate) codec: CodecConfig,
    pub(crate) security: Option<SecurityEnvelope>,
    pub(crate) registry: Option<Arc<CapabilityRegistry>>,
    pub(crate) contexts: Option<Arc<ContextStore>>,
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) events: Option<Arc<dyn EventSink>>,
    pub(crate) metrics: Option<Arc<RuntimeMetrics>>,
    pub(crate) retry: RetryPolicy,
    pub(crate) default_timeout: Duration,
    pub(crate) auto_create_sessions: bool,
    pub(crate) sweep_interval: Duration,
}

impl fmt::Debug for AgentRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntimeBuilder")
            .field("agent", self.identity.id())
            .field("codec", &self.codec)
            .field("scheduler", &self.scheduler)
            .field("retry", &self.retry)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl AgentRuntimeBuilder {
    fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            codec: CodecConfig::default(),
            security: None,
            registry: None,
            contexts: None,
            scheduler: SchedulerConfig::default(),
            events: None,
            metrics: None,
            retry: RetryPolicy::default(),
            default_timeout: DEFAULT_TIMEOUT,
            auto_create_sessions: false,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Wire limits.
    #[must_use]
    pub fn codec_config(mut self, config: CodecConfig) -> Self {
        self.codec = config;
        self
    }

    /// Authentication, integrity, replay, and access policy.
    #[must_use]
    pub fn security(mut self, envelope: SecurityEnvelope) -> Self {
        self.security = Some(envelope);
        self
    }

    /// Shares an existing capability registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Shares an existing context store.
    #[must_use]
    pub fn contexts(mut self, contexts: Arc<ContextStore>) -> Self {
        self.contexts = Some(contexts);
        self
    }

    /// Handler concurrency.
    #[must_use]
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Destination for inbound events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Shares an existing metrics instance.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry policy for outbound requests and delegated completions.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Deadline when neither the request nor the capability sets one.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Create a context on first use of an unknown session id.
    #[must_use]
    pub fn auto_create_sessions(mut self, enabled: bool) -> Self {
        self.auto_create_sessions = enabled;
        self
    }

    /// Interval of [`AgentRuntime::spawn_maintenance`].
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Finalises the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Codec`] for invalid wire limits, or
    /// [`RuntimeError::InvalidConfig`] for zero durations, a bad retry
    /// policy, or a replay window shorter than the accepted clock skew.
    pub fn build(self) -> RuntimeResult<AgentRuntime> {
        if self.default_timeout.is_zero() {
            return Err(RuntimeError::config("default timeout must be greater than zero"));
        }
        if self.sweep_interval.is_zero() {
            return Err(RuntimeError::config("sweep interval must be greater than zero"));
        }
        self.retry.validate()?;

        let security = match self.security {
            Some(security) => security,
            None => SecurityEnvelope::builder(SecurityConfig {
                replay_window: self.codec.clock_skew,
                ..SecurityConfig::default()
            })
            .build()?,
        };
        if security.config().replay_window < self.codec.clock_skew {
            return Err(RuntimeError::config(format!(
                "replay window {:?} is shorter than the accepted clock skew {:?}",
                security.config().replay_window,
                self.codec.clock_skew
            )));
        }
        let mut codec = Codec::new(self.codec)?;
        if let Some(cipher) = security.payload_cipher() {
            codec = codec.with_cipher(cipher);
        }

        info!(agent = %self.identity.id(), "agent runtime built");
        Ok(AgentRuntime {
            inner: Arc::new(RuntimeInner {
                identity: self.identity,
                codec,
                security,
                registry: self.registry.unwrap_or_default(),
                contexts: self.contexts.unwrap_or_default(),
                scheduler: TaskScheduler::new(self.scheduler),
                limits: RateLimits::new(),
                metrics: self.metrics.unwrap_or_default(),
                pending: PendingRequests::new(),
                events: self
                    .events
                    .unwrap_or_else(|| Arc::new(TracingEventSink)),
                retry: self.retry,
                default_timeout: self.default_timeout,
                auto_create_sessions: self.auto_create_sessions,
                sweep_interval: self.sweep_interval,
                transport: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::CapabilityId;
    use amp_registry::{HandlerResult, Invocation};
    use serde_json::{Value, json};

    fn identity(id: &str) -> AgentIdentity {
        AgentIdentity::builder(AgentId::new(id).unwrap())
            .name(id)
            .unwrap()
            .version("1.0.0")
            .unwrap()
            .build()
            .unwrap()
    }

    async fn echo(invocation: Invocation) -> HandlerResult<Value> {
        Ok(invocation.parameters)
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = AgentRuntime::builder(identity("agent-a"))
            .default_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn replay_window_must_cover_clock_skew() {
        let codec = CodecConfig {
            clock_skew: Duration::from_secs(3_600),
            ..CodecConfig::default()
        };
        let security = SecurityEnvelope::builder(SecurityConfig {
            replay_window: Duration::from_secs(300),
            ..SecurityConfig::default()
        })
        .build()
        .unwrap();
        let err = AgentRuntime::builder(identity("agent-a"))
            .codec_config(codec.clone())
            .security(security)
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));

        let runtime = AgentRuntime::builder(identity("agent-a"))
            .codec_config(codec)
            .build()
            .unwrap();
        assert_eq!(runtime.security().config().replay_window, Duration::from_secs(3_600));
    }

    #[test]
    fn capabilities_register_and_unregister() {
        let runtime = AgentRuntime::builder(identity("agent-a")).build().unwrap();
        let capability = Capability::builder(CapabilityId::new("echo").unwrap())
            .version("1.0.0")
            .unwrap()
            .input_schema(json!({ "type": "object" }))
            .build()
            .unwrap();
        let version = capability.version().clone();
        assert!(runtime.register_capability(capability, echo).unwrap().is_none());
        assert_eq!(runtime.registry().ids(), vec!["echo".to_owned()]);

        let id = CapabilityId::new("echo").unwrap();
        assert!(runtime.unregister_capability(&id, &version).is_some());
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn outbound_without_transport_fails() {
        let runtime = AgentRuntime::builder(identity("agent-a")).build().unwrap();
        assert!(matches!(runtime.transport(), Err(RuntimeError::NoTransport)));
        runtime.shutdown();
        assert!(runtime.scheduler().is_closed());
    }
}
