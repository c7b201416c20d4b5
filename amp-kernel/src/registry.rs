//! Registration with the mesh registry agent, heartbeats, and discovery.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use amp_primitives::{AgentId, CapabilityId, RequestPayload};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{debug, info, warn};

use crate::outbound::RequestOptions;
use crate::registry_wire::{
    AgentRecord, AgentRef, CapabilityRecord, DISCOVERY_CAPABILITY, DiscoverRequest,
    DiscoverResponse, HeartbeatResponse, REGISTRATION_CAPABILITY, RegisterRequest,
    RegisterResponse, RegistrationAction,
};
use crate::runtime::AgentRuntime;
use crate::RuntimeError;

const DEFAULT_FAILURE_THRESHOLD: NonZeroUsize = match NonZeroUsize::new(3) {
    Some(threshold) => threshold,
    None => unreachable!(),
};

/// Configuration for registration and heartbeat maintenance.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationConfig {
    heartbeat_interval: Duration,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    max_consecutive_failures: NonZeroUsize,
}

impl RegistrationConfig {
    /// Creates a new configuration.
    #[must_use]
    pub fn new(
        heartbeat_interval: Duration,
        initial_retry_delay: Duration,
        max_retry_delay: Duration,
        max_consecutive_failures: NonZeroUsize,
    ) -> Self {
        Self {
            heartbeat_interval,
            initial_retry_delay,
            max_retry_delay,
            max_consecutive_failures,
        }
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(self) -> Duration {
        self.heartbeat_interval
    }

    /// Returns the initial retry delay.
    #[must_use]
    pub const fn initial_retry_delay(self) -> Duration {
        self.initial_retry_delay
    }

    /// Returns the maximum retry delay.
    #[must_use]
    pub const fn max_retry_delay(self) -> Duration {
        self.max_retry_delay
    }

    /// Returns the limit on consecutive heartbeat failures before re-registration.
    #[must_use]
    pub const fn max_consecutive_failures(self) -> NonZeroUsize {
        self.max_consecutive_failures
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MeshRegistryError::InvalidConfig`] when any duration is zero
    /// or the retry delay bounds are inconsistent.
    pub fn validate(self) -> MeshRegistryResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(MeshRegistryError::InvalidConfig(
                "heartbeat interval must be greater than zero",
            ));
        }
        if self.initial_retry_delay.is_zero() {
            return Err(MeshRegistryError::InvalidConfig(
                "initial retry delay must be greater than zero",
            ));
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(MeshRegistryError::InvalidConfig(
                "initial retry delay cannot exceed max retry delay",
            ));
        }
        Ok(())
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_consecutive_failures: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

/// Result alias for mesh registry operations.
pub type MeshRegistryResult<T> = Result<T, MeshRegistryError>;

/// Errors surfaced by the registry-service integration.
#[derive(Debug, Error)]
pub enum MeshRegistryError {
    /// Registration configuration was invalid.
    #[error("invalid registration configuration: {0}")]
    InvalidConfig(&'static str),
    /// The request to the registry agent failed.
    #[error(transparent)]
    Request(#[from] RuntimeError),
    /// The registry agent answered but refused the operation.
    #[error("registry refused the operation: {reason}")]
    Rejected {
        /// Message supplied by the registry.
        reason: String,
    },
    /// The registry agent answered with an unreadable result.
    #[error("malformed registry result: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl MeshRegistryError {
    /// Convenience helper to construct rejection errors.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Backend the registration controller talks to.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Registers (or refreshes) the agent described by `request`.
    async fn register(&self, request: &RegisterRequest) -> MeshRegistryResult<()>;

    /// Sends a heartbeat for an already registered agent.
    async fn heartbeat(&self, request: &RegisterRequest) -> MeshRegistryResult<HeartbeatResponse>;

    /// Removes the agent from the registry.
    async fn deregister(&self, request: &RegisterRequest) -> MeshRegistryResult<()>;

    /// Lists agents offering `capability`, optionally within a version constraint.
    async fn discover(
        &self,
        capability: &str,
        version: Option<&str>,
    ) -> MeshRegistryResult<Vec<AgentRecord>>;
}

impl AgentRuntime {
    /// Describes this agent and every registered capability version for the
    /// registry service.
    #[must_use]
    pub fn registration_request(&self, endpoint: Option<String>) -> RegisterRequest {
        let identity = self.identity();
        let mut capabilities: Vec<CapabilityRecord> = self
            .registry()
            .capabilities()
            .iter()
            .map(|capability| CapabilityRecord {
                id: capability.id().to_string(),
                version: capability.version().to_string(),
            })
            .collect();
        capabilities.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.version.cmp(&b.version)));

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("framework".to_owned(), identity.framework().to_owned());
        metadata.insert(
            "protocol_version".to_owned(),
            identity.protocol_version().to_owned(),
        );

        RegisterRequest {
            agent_id: identity.id().clone(),
            name: identity.name().to_owned(),
            version: identity.version().to_owned(),
            capabilities,
            endpoint,
            metadata,
        }
    }
}

/// [`AgentRegistry`] reached through the mesh itself: the registry service is
/// an agent exposing the `registration` and `discovery` capabilities.
#[derive(Clone)]
pub struct MeshRegistryClient {
    runtime: AgentRuntime,
    registry_agent: AgentId,
    timeout: Option<Duration>,
}

impl fmt::Debug for MeshRegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshRegistryClient")
            .field("agent", self.runtime.agent_id())
            .field("registry_agent", &self.registry_agent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MeshRegistryClient {
    /// Creates a client that sends registry calls from `runtime` to
    /// `registry_agent`.
    #[must_use]
    pub fn new(runtime: AgentRuntime, registry_agent: AgentId) -> Self {
        Self {
            runtime,
            registry_agent,
            timeout: None,
        }
    }

    /// Bounds each registry call; the runtime default applies otherwise.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Agent that hosts the registry service.
    #[must_use]
    pub fn registry_agent(&self) -> &AgentId {
        &self.registry_agent
    }

    async fn call<P, T>(&self, capability: &str, parameters: &P) -> MeshRegistryResult<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = RequestPayload::new(
            CapabilityId::new(capability).map_err(RuntimeError::from)?,
            serde_json::to_value(parameters)?,
        );
        let options = RequestOptions {
            timeout: self.timeout,
            ..RequestOptions::default()
        };
        let response = self
            .runtime
            .request_with(&self.registry_agent, request, options)
            .await?;
        Ok(serde_json::from_value(response.result)?)
    }

    async fn registration(&self, action: RegistrationAction) -> MeshRegistryResult<RegisterResponse> {
        let response: RegisterResponse = self.call(REGISTRATION_CAPABILITY, &action).await?;
        if response.success {
            Ok(response)
        } else {
            Err(MeshRegistryError::rejected(
                response
                    .message
                    .unwrap_or_else(|| "no reason given".to_owned()),
            ))
        }
    }
}

#[async_trait]
impl AgentRegistry for MeshRegistryClient {
    async fn register(&self, request: &RegisterRequest) -> MeshRegistryResult<()> {
        self.registration(RegistrationAction::Register(request.clone()))
            .await?;
        debug!(agent = %request.agent_id, registry = %self.registry_agent, "registration acknowledged");
        Ok(())
    }

    async fn heartbeat(&self, request: &RegisterRequest) -> MeshRegistryResult<HeartbeatResponse> {
        let action = RegistrationAction::Heartbeat(AgentRef {
            agent_id: request.agent_id.clone(),
        });
        self.call(REGISTRATION_CAPABILITY, &action).await
    }

    async fn deregister(&self, request: &RegisterRequest) -> MeshRegistryResult<()> {
        self.registration(RegistrationAction::Deregister(AgentRef {
            agent_id: request.agent_id.clone(),
        }))
        .await?;
        Ok(())
    }

    async fn discover(
        &self,
        capability: &str,
        version: Option<&str>,
    ) -> MeshRegistryResult<Vec<AgentRecord>> {
        let query = DiscoverRequest {
            capability: capability.to_owned(),
            version: version.map(str::to_owned),
        };
        let response: DiscoverResponse = self.call(DISCOVERY_CAPABILITY, &query).await?;
        debug!(capability, found = response.agents.len(), "discovery answered");
        Ok(response.agents)
    }
}

/// Keeps an agent registered: registers with backoff, heartbeats on an
/// interval, and re-registers once heartbeats keep failing or the registry
/// reports it lost the record.
pub struct RegistrationController {
    registry: Arc<dyn AgentRegistry>,
    request: Arc<RegisterRequest>,
    config: RegistrationConfig,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for RegistrationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationController")
            .field("registry", &"dyn AgentRegistry")
            .field("agent", &self.request.agent_id)
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl RegistrationController {
    /// Creates a stopped controller.
    #[must_use]
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        request: RegisterRequest,
        config: RegistrationConfig,
    ) -> Self {
        Self {
            registry,
            request: Arc::new(request),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Whether the maintenance task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Spawns the registration and heartbeat task. Calling it again while the
    /// task runs does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MeshRegistryError::InvalidConfig`] for an invalid configuration.
    pub fn start(&mut self) -> MeshRegistryResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.config.validate()?;
        self.shutdown.store(false, Ordering::Release);

        let registry = Arc::clone(&self.registry);
        let request = Arc::clone(&self.request);
        let shutdown = Arc::clone(&self.shutdown);
        let config = self.config;

        self.worker = Some(tokio::spawn(async move {
            run_registration_loop(registry, request, shutdown, config).await;
        }));
        Ok(())
    }

    /// Stops heartbeats and deregisters the agent.
    ///
    /// # Errors
    ///
    /// Returns the deregistration failure; the task is stopped regardless.
    pub async fn stop(&mut self) -> MeshRegistryResult<()> {
        self.shutdown.store(true, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        handle.abort();

        match self.registry.deregister(&self.request).await {
            Ok(()) => {
                info!(agent_id = %self.request.agent_id, "agent deregistered");
                Ok(())
            }
            Err(err) => {
                warn!(?err, agent_id = %self.request.agent_id, "agent deregistration failed");
                Err(err)
            }
        }
    }
}

async fn run_registration_loop(
    registry: Arc<dyn AgentRegistry>,
    request: Arc<RegisterRequest>,
    shutdown: Arc<AtomicBool>,
    config: RegistrationConfig,
) {
    let mut retry_delay = config.initial_retry_delay();

    while !shutdown.load(Ordering::Acquire) {
        match registry.register(&request).await {
            Ok(()) => {
                info!(
                    agent_id = %request.agent_id,
                    capabilities = request.capabilities.len(),
                    "agent registered with mesh"
                );
                retry_delay = config.initial_retry_delay();
                if run_heartbeat_loop(registry.as_ref(), &request, &shutdown, config).await {
                    break;
                }
            }
            Err(err) => {
                warn!(?err, ?retry_delay, "agent registration failed; retrying");
                sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(config.max_retry_delay());
            }
        }
    }
}

/// Returns `true` on shutdown and `false` when the agent must register again.
async fn run_heartbeat_loop(
    registry: &dyn AgentRegistry,
    request: &RegisterRequest,
    shutdown: &AtomicBool,
    config: RegistrationConfig,
) -> bool {
    let mut failures: usize = 0;
    let mut interval = tokio::time::interval(config.heartbeat_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; registration just happened.
    interval.tick().await;

    loop {
        interval.tick().await;
        if shutdown.load(Ordering::Acquire) {
            return true;
        }

        match registry.heartbeat(request).await {
            Ok(response) if response.needs_register => {
                warn!(agent_id = %request.agent_id, "registry lost the agent record; re-registering");
                return false;
            }
            Ok(_) => failures = 0,
            Err(err) => {
                failures += 1;
                warn!(?err, failures, "heartbeat failure");
                if failures >= config.max_consecutive_failures().get() {
                    warn!(
                        failures,
                        "heartbeat failure threshold reached; attempting re-registration"
                    );
                    return false;
                }
            }
        }
    }
}
