//! Inbound message pipeline.
//!
//! Every request moves through [`DispatchLifecycle`] and produces exactly one
//! reply whose correlation id is the request id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use amp_codec::{CodecError, Peeked, encode};
use amp_primitives::{
    AgentId, Capability, Endpoint, ErrorCategory, ErrorPayload, Message, MessageType, RequestPayload,
    ResponsePayload,
};
use amp_registry::{Invocation, Registration};
use amp_security::Admission;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{DispatchEvent, DispatchLifecycle, Route};
use crate::runtime::AgentRuntime;
use crate::{RuntimeError, RuntimeResult};

const ANONYMOUS: &str = "anonymous";

enum Outcome {
    Respond(ResponsePayload),
    Forwarded(Option<Bytes>),
}

impl AgentRuntime {
    /// Processes one raw inbound message.
    ///
    /// Requests always yield exactly one encoded reply. Responses, errors,
    /// and events are consumed and yield `None`, as do messages that could
    /// not be forwarded inline.
    pub async fn handle_message(&self, raw: &[u8], bearer: Option<&str>) -> Option<Bytes> {
        self.inner.metrics.record_received();

        let message = match self.inner.codec.decode(raw) {
            Ok(message) => message,
            Err(err) => {
                let peeked = self.inner.codec.peek(raw);
                warn!(
                    message_id = ?peeked.id,
                    code = %err.code(),
                    error = %err,
                    "rejected undecodable message"
                );
                return self.reject_undecodable(peeked, &RuntimeError::from(err));
            }
        };

        let admission = match self.inner.security.admit(&message, bearer) {
            Ok(admission) => admission,
            Err(err) => {
                warn!(
                    message_id = %message.id,
                    source = ?message.source.agent_id,
                    code = %err.code(),
                    error = %err,
                    "security check failed"
                );
                if message.kind != MessageType::Request {
                    return None;
                }
                let err = RuntimeError::from(err);
                return self.encode_reply(message.reply_error(self.endpoint(), &err.to_payload()), Some(&message));
            }
        };

        match message.kind {
            MessageType::Request => self.dispatch_request(message, admission).await,
            MessageType::Response | MessageType::Error => {
                let correlation_id = message.headers.correlation_id.clone();
                if !self.inner.pending.complete(message) {
                    debug!(?correlation_id, "dropping reply with no pending request");
                }
                None
            }
            MessageType::Event => {
                self.inner.events.on_event(&message);
                None
            }
        }
    }

    async fn dispatch_request(&self, message: Message, admission: Admission) -> Option<Bytes> {
        let mut lifecycle = DispatchLifecycle::new(message.id.clone());
        let started = Instant::now();
        let outcome = self.run_request(&message, &admission, &mut lifecycle).await;

        let reply = match outcome {
            Ok(Outcome::Forwarded(reply)) => {
                advance(&mut lifecycle, DispatchEvent::Complete);
                advance(&mut lifecycle, DispatchEvent::Respond);
                return reply;
            }
            Ok(Outcome::Respond(response)) => {
                advance(&mut lifecycle, DispatchEvent::Complete);
                debug!(
                    message_id = %message.id,
                    elapsed_ms = elapsed_ms(started),
                    status = ?response.status,
                    "request completed"
                );
                message.reply_response(self.endpoint(), &response)
            }
            Err(err) => {
                advance(&mut lifecycle, DispatchEvent::Fail);
                log_failure(&message, &err);
                message.reply_error(self.endpoint(), &err.to_payload())
            }
        };
        let encoded = self.encode_reply(reply, Some(&message));
        advance(&mut lifecycle, DispatchEvent::Respond);
        encoded
    }

    async fn run_request(
        &self,
        message: &Message,
        admission: &Admission,
        lifecycle: &mut DispatchLifecycle,
    ) -> RuntimeResult<Outcome> {
        lifecycle.transition(DispatchEvent::Authenticate)?;
        let request: RequestPayload = message
            .payload_as()
            .map_err(|err| CodecError::schema("payload", err.to_string()))?;
        let caller = admission
            .identity
            .as_ref()
            .map(|identity| identity.id().clone())
            .or_else(|| message.source.agent_id.clone());

        self.inner
            .security
            .authorize(caller.as_ref(), &request.capability)
            .await?;
        lifecycle.transition(DispatchEvent::Authorize)?;

        let local = message
            .destination
            .agent_id
            .as_ref()
            .is_none_or(|destination| destination == self.agent_id());
        if !local {
            lifecycle.transition(DispatchEvent::Route(Route::Remote))?;
            return Ok(Outcome::Forwarded(self.forward(message).await?));
        }
        lifecycle.transition(DispatchEvent::Route(Route::Local))?;

        let registration = self.inner.registry.resolve(
            request.capability.as_str(),
            request.version.as_deref(),
            request.preferred_version.as_deref(),
        )?;
        registration.validate_input(&request.parameters)?;

        let context = match &message.source.session_id {
            Some(session_id) => Some(
                self.inner
                    .contexts
                    .session_handle(session_id, caller.clone(), self.inner.auto_create_sessions)
                    .await?,
            ),
            None => None,
        };
        self.inner.limits.check(
            caller.as_ref().map_or(ANONYMOUS, AgentId::as_str),
            registration.capability(),
        )?;

        let deadline = self.deadline(message.headers.timeout_ms, registration.capability());
        let invocation = Invocation {
            message_id: message.id.clone(),
            caller,
            capability: Arc::clone(registration.capability()),
            parameters: request.parameters.clone(),
            context,
        };

        lifecycle.transition(DispatchEvent::Execute)?;
        if let (Some(_), Some(callback)) = (&request.parent_task_id, &request.completion_callback) {
            self.spawn_delegated(message.clone(), callback.clone(), registration, invocation, deadline);
            self.inner.metrics.record_delegation();
            info!(
                message_id = %message.id,
                capability = %request.capability,
                parent_task_id = ?request.parent_task_id,
                "delegated task accepted"
            );
            return Ok(Outcome::Respond(ResponsePayload::accepted(&message.id)));
        }

        Ok(Outcome::Respond(self.execute(registration, invocation, deadline).await?))
    }

    /// `min(timeout_ms, response_time_ms)`, or the runtime default when
    /// neither is set.
    fn deadline(&self, requested_ms: Option<u64>, capability: &Capability) -> Duration {
        let declared_ms = capability.constraints().response_time_ms;
        match (requested_ms, declared_ms) {
            (Some(requested), Some(declared)) => Duration::from_millis(requested.min(declared)),
            (Some(ms), None) | (None, Some(ms)) => Duration::from_millis(ms),
            (None, None) => self.inner.default_timeout,
        }
    }

    /// Runs the handler on the worker pool and waits for it until `deadline`.
    ///
    /// A result produced after the deadline is dropped and logged as
    /// `ORPHANED_RESULT`.
    async fn execute(
        &self,
        registration: Arc<Registration>,
        invocation: Invocation,
        deadline: Duration,
    ) -> RuntimeResult<ResponsePayload> {
        let message_id = invocation.message_id.clone();
        let capability = Arc::clone(&invocation.capability);
        let handler = Arc::clone(registration.handler());
        let metrics = Arc::clone(&self.inner.metrics);
        let (tx, rx) = oneshot::channel();

        let task_message_id = message_id.clone();
        self.inner.scheduler.spawn(async move {
            if tx.is_closed() {
                debug!(message_id = %task_message_id, "caller gone before a worker was free; skipping");
                return;
            }
            metrics.record_invocation();
            let result = handler.execute(invocation).await;
            if tx.send(result).is_err() {
                metrics.record_orphaned();
                warn!(
                    event = "ORPHANED_RESULT",
                    message_id = %task_message_id,
                    "handler finished after its deadline; result discarded"
                );
            }
        })?;

        let started = Instant::now();
        let result = match timeout(deadline, rx).await {
            Err(_) => return Err(RuntimeError::Timeout { elapsed: deadline }),
            Ok(Err(_)) => {
                return Err(RuntimeError::internal(format!(
                    "handler task for {message_id} ended without a result"
                )));
            }
            Ok(Ok(result)) => result?,
        };
        registration.validate_output(&result)?;

        let mut response = ResponsePayload::success(result);
        response.capability_version = Some(capability.version().to_string());
        response.metrics = Some(json!({ "duration_ms": elapsed_ms(started) }));
        Ok(response)
    }

    fn spawn_delegated(
        &self,
        request: Message,
        callback: Endpoint,
        registration: Arc<Registration>,
        invocation: Invocation,
        deadline: Duration,
    ) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let outcome = runtime
                .execute(registration, invocation, deadline)
                .await
                .map_err(|err| {
                    log_failure(&request, &err);
                    err.to_payload()
                });
            runtime.deliver_completion(&request, &callback, &outcome).await;
        });
    }

    /// Sends the outcome of delegated work to its callback, retrying
    /// transient failures with a fresh message id per attempt.
    async fn deliver_completion(
        &self,
        request: &Message,
        callback: &Endpoint,
        outcome: &Result<ResponsePayload, ErrorPayload>,
    ) {
        let delivered = self
            .inner
            .retry
            .run(|_| {
                let mut completion = match outcome {
                    Ok(response) => request.reply_response(self.endpoint(), response),
                    Err(error) => request.reply_error(self.endpoint(), error),
                };
                completion.destination = callback.clone();
                async move { self.send_sealed(completion).await }
            })
            .await;

        match delivered {
            Ok(_) => {
                match outcome {
                    Ok(_) => self.inner.metrics.record_response(),
                    Err(error) => self.inner.metrics.record_error(error.code),
                }
                info!(
                    message_id = %request.id,
                    callback = ?callback.agent_id,
                    success = outcome.is_ok(),
                    "delegated result delivered"
                );
            }
            Err(err) => error!(
                message_id = %request.id,
                callback = ?callback.agent_id,
                error = %err,
                "delegated result could not be delivered"
            ),
        }
    }

    /// Hands a request addressed to another agent to the transport.
    ///
    /// The message keeps its id, source, and signature; an opened payload is
    /// sealed again under its original key.
    async fn forward(&self, message: &Message) -> RuntimeResult<Option<Bytes>> {
        let transport = self.transport()?;
        let mut outbound = message.clone();
        if let Some(header) = &outbound.headers.encryption {
            let cipher = self
                .inner
                .security
                .payload_cipher()
                .ok_or_else(|| RuntimeError::internal("opened payload without a cipher"))?;
            outbound.payload = cipher
                .seal(header, &outbound.payload)
                .map_err(|err| RuntimeError::internal(err.to_string()))?;
        }

        let reply = transport.send(&outbound).await?;
        self.inner.metrics.record_forwarded();
        debug!(
            message_id = %message.id,
            destination = ?message.destination.agent_id,
            inline_reply = reply.is_some(),
            "request forwarded"
        );
        Ok(reply)
    }

    /// Signs and encrypts `message`, then sends it on the attached transport.
    pub(crate) async fn send_sealed(&self, mut message: Message) -> RuntimeResult<Option<Bytes>> {
        let transport = self.transport()?;
        self.inner.security.seal(&mut message)?;
        Ok(transport.send(&message).await?)
    }

    fn reject_undecodable(&self, peeked: Peeked, err: &RuntimeError) -> Option<Bytes> {
        let mut reply = Message::new(
            MessageType::Error,
            self.endpoint(),
            peeked.source.unwrap_or_default(),
            json!(err.to_payload()),
        );
        reply.headers.correlation_id = peeked.id;
        self.encode_reply(reply, None)
    }

    /// Seals and encodes a reply, mirroring the request's encryption.
    fn encode_reply(&self, mut reply: Message, request: Option<&Message>) -> Option<Bytes> {
        if let Some(request) = request {
            reply.headers.encryption.clone_from(&request.headers.encryption);
        }
        if let Err(err) = self.inner.security.seal(&mut reply) {
            error!(message_id = %reply.id, error = %err, "failed to seal reply; sending plain error");
            let fallback = ErrorPayload::new(err.code(), "internal error", None);
            let mut plain = Message::new(
                MessageType::Error,
                reply.source.clone(),
                reply.destination.clone(),
                json!(fallback),
            );
            plain.headers.correlation_id = reply.headers.correlation_id.take();
            reply = plain;
        }

        match reply.kind {
            MessageType::Error => {
                let code = reply.payload_as::<ErrorPayload>().map(|payload| payload.code);
                if let Ok(code) = code {
                    self.inner.metrics.record_error(code);
                }
            }
            _ => self.inner.metrics.record_response(),
        }

        match encode(&reply) {
            Ok(raw) => Some(raw),
            Err(err) => {
                error!(message_id = %reply.id, error = %err, "failed to encode reply");
                None
            }
        }
    }
}

fn advance(lifecycle: &mut DispatchLifecycle, event: DispatchEvent) {
    if let Err(err) = lifecycle.transition(event) {
        error!(error = %err, "dispatch lifecycle out of order");
    }
}

fn log_failure(message: &Message, err: &RuntimeError) {
    let code = err.code();
    match code.category() {
        ErrorCategory::Security => {
            warn!(message_id = %message.id, %code, error = %err, "request rejected");
        }
        ErrorCategory::Execution => {
            error!(message_id = %message.id, %code, error = %err, "request failed");
        }
        _ => info!(message_id = %message.id, %code, error = %err, "request failed"),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
