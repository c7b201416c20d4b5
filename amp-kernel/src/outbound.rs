//! Requests, delegations, and events sent to other agents.

use std::time::Duration;

use amp_primitives::{
    AgentId, Endpoint, ErrorPayload, Message, MessageType, Priority, RequestPayload, ResponsePayload,
    ResponseStatus,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::runtime::AgentRuntime;
use crate::{RuntimeError, RuntimeResult};

/// Per-call settings for [`AgentRuntime::request_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Session whose context the callee should use.
    pub session_id: Option<String>,
    /// Deadline advertised in `headers.timeout_ms`; also bounds how long the
    /// caller waits for an asynchronous reply.
    pub timeout: Option<Duration>,
    /// Delivery priority.
    pub priority: Option<Priority>,
}

impl RequestOptions {
    /// Runs the request inside `session_id`.
    #[must_use]
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Delegated work accepted by another agent.
///
/// Dropping the task withdraws interest in its result.
#[derive(Debug)]
pub struct DelegatedTask {
    task_id: String,
    destination: AgentId,
    completion: oneshot::Receiver<Message>,
    runtime: AgentRuntime,
}

impl DelegatedTask {
    /// Id the callee acknowledged; equals the request message id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Agent performing the work.
    #[must_use]
    pub fn destination(&self) -> &AgentId {
        &self.destination
    }

    /// Waits for the result delivered to the completion callback.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Remote`] when the work failed, or
    /// [`RuntimeError::Internal`] if the runtime stopped waiting.
    pub async fn outcome(mut self) -> RuntimeResult<ResponsePayload> {
        let completion = (&mut self.completion)
            .await
            .map_err(|_| RuntimeError::internal("delegation waiter dropped"))?;
        interpret_reply(&self.task_id, completion)
    }

    /// Same as [`DelegatedTask::outcome`] with an upper bound on the wait.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Timeout`] when nothing arrives in time, or
    /// any error from [`DelegatedTask::outcome`].
    pub async fn outcome_within(self, wait: Duration) -> RuntimeResult<ResponsePayload> {
        timeout(wait, self.outcome())
            .await
            .map_err(|_| RuntimeError::Timeout { elapsed: wait })?
    }
}

impl Drop for DelegatedTask {
    fn drop(&mut self) {
        self.runtime.inner.pending.cancel(&self.task_id);
    }
}

impl AgentRuntime {
    /// Invokes a capability on `destination` and waits for the outcome.
    ///
    /// # Errors
    ///
    /// See [`AgentRuntime::request_with`].
    pub async fn request(
        &self,
        destination: &AgentId,
        request: RequestPayload,
    ) -> RuntimeResult<ResponsePayload> {
        self.request_with(destination, request, RequestOptions::default())
            .await
    }

    /// Invokes a capability on `destination` with explicit options.
    ///
    /// The reply is taken from the transport when it answers inline, or
    /// from a later inbound `response`/`error` correlated to the request.
    /// Transient failures are retried with a fresh message id per attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Remote`] carrying the peer's error payload,
    /// [`RuntimeError::Timeout`] when no reply arrives in time,
    /// [`RuntimeError::RetriesExhausted`] after repeated transient failures,
    /// or [`RuntimeError::NoTransport`].
    pub async fn request_with(
        &self,
        destination: &AgentId,
        request: RequestPayload,
        options: RequestOptions,
    ) -> RuntimeResult<ResponsePayload> {
        let wait = options.timeout.unwrap_or(self.inner.default_timeout);
        self.inner
            .retry
            .run(|attempt| {
                let message = self.build_request(destination, &request, &options);
                debug!(
                    message_id = %message.id,
                    %destination,
                    capability = %request.capability,
                    attempt,
                    "sending request"
                );
                async move { self.exchange(message, wait).await }
            })
            .await
    }

    /// Delegates `request` to `destination`, returning once the callee has
    /// accepted it. The result arrives later at this agent.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Remote`] when the callee refused the work, or
    /// the transport errors of [`AgentRuntime::request_with`].
    pub async fn delegate(
        &self,
        destination: &AgentId,
        request: RequestPayload,
        parent_task_id: impl Into<String>,
    ) -> RuntimeResult<DelegatedTask> {
        let request = request.delegated(parent_task_id, self.endpoint());
        let options = RequestOptions::default();
        self.inner
            .retry
            .run(|_| {
                let message = self.build_request(destination, &request, &options);
                async move { self.send_delegation(destination, message).await }
            })
            .await
    }

    /// Sends a fire-and-forget event.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::NoTransport`] or the transport failure.
    pub async fn send_event(&self, destination: &AgentId, payload: Value) -> RuntimeResult<()> {
        let event = Message::event(self.endpoint(), Endpoint::agent(destination.clone()), payload);
        debug!(message_id = %event.id, %destination, "sending event");
        self.send_sealed(event).await?;
        Ok(())
    }

    fn build_request(
        &self,
        destination: &AgentId,
        request: &RequestPayload,
        options: &RequestOptions,
    ) -> Message {
        let mut source = self.endpoint();
        source.session_id.clone_from(&options.session_id);
        let mut message = Message::request(source, Endpoint::agent(destination.clone()), request);
        message.headers.timeout_ms = options
            .timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        message.headers.priority = options.priority;
        message
    }

    async fn exchange(&self, message: Message, wait: Duration) -> RuntimeResult<ResponsePayload> {
        let request_id = message.id.clone();
        let waiter = self.inner.pending.register(request_id.clone());
        let _registered = self.inner.pending.cancel_on_drop(&request_id);

        let reply = match self.send_sealed(message).await? {
            Some(raw) => self.inner.codec.decode(&raw)?,
            None => match timeout(wait, waiter).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => return Err(RuntimeError::internal("reply waiter dropped")),
                Err(_) => return Err(RuntimeError::Timeout { elapsed: wait }),
            },
        };
        interpret_reply(&request_id, reply)
    }

    async fn send_delegation(
        &self,
        destination: &AgentId,
        message: Message,
    ) -> RuntimeResult<DelegatedTask> {
        let task_id = message.id.clone();
        let completion = self.inner.pending.register_delegation(task_id.clone());
        let task = DelegatedTask {
            task_id: task_id.clone(),
            destination: destination.clone(),
            completion,
            runtime: self.clone(),
        };

        // Early returns drop `task`, which withdraws the waiter.
        let Some(raw) = self.send_sealed(message).await? else {
            // Acknowledgement and result both arrive as inbound messages.
            return Ok(task);
        };

        let acknowledgement = self.inner.codec.decode(&raw)?;
        let response = interpret_reply(&task_id, acknowledgement.clone())?;
        if response.status == ResponseStatus::Accepted {
            info!(%task_id, %destination, "delegation accepted");
        } else {
            // The callee answered synchronously; hand the result to the waiter.
            self.inner.pending.complete(acknowledgement);
        }
        Ok(task)
    }
}

fn interpret_reply(request_id: &str, reply: Message) -> RuntimeResult<ResponsePayload> {
    if reply.headers.correlation_id.as_deref() != Some(request_id) {
        return Err(RuntimeError::UnexpectedReply {
            reason: format!(
                "correlation id {:?} does not match request {request_id}",
                reply.headers.correlation_id
            ),
        });
    }
    match reply.kind {
        MessageType::Response => reply
            .payload_as::<ResponsePayload>()
            .map_err(|err| RuntimeError::UnexpectedReply {
                reason: err.to_string(),
            }),
        MessageType::Error => {
            let payload = reply
                .payload_as::<ErrorPayload>()
                .map_err(|err| RuntimeError::UnexpectedReply {
                    reason: err.to_string(),
                })?;
            Err(RuntimeError::Remote { payload })
        }
        other => Err(RuntimeError::UnexpectedReply {
            reason: format!("`{}` message in reply position", other.as_str()),
        }),
    }
}
