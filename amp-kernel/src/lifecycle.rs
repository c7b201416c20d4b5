//! Per-request dispatch state machine.

use thiserror::Error;
use tracing::debug;

/// Where a request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Executed by a capability registered on this runtime.
    Local,
    /// Handed to the outbound transport for another agent.
    Remote,
}

/// States a request passes through inside the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Decoded and structurally valid.
    Received,
    /// Credentials, signature, and nonce accepted.
    Authenticated,
    /// Access policy allows the caller to invoke the capability.
    Authorized,
    /// Execution target chosen.
    Routed(Route),
    /// Handler running under its deadline.
    Executing,
    /// Produced a result (or forwarded successfully).
    Completed,
    /// Produced an error.
    Failed,
    /// Exactly one outbound message has been emitted.
    Responded,
}

impl DispatchState {
    /// Returns `true` once the reply has been emitted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Responded)
    }

    /// Returns `true` for states with an outcome ready to send.
    #[must_use]
    pub const fn has_outcome(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Events that move a request between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Security admission passed.
    Authenticate,
    /// Access policy passed.
    Authorize,
    /// Target selected.
    Route(Route),
    /// Handler started.
    Execute,
    /// Outcome is a success.
    Complete,
    /// Outcome is an error; legal from every state before an outcome exists.
    Fail,
    /// Reply emitted.
    Respond,
}

/// Tracks one request through [`DispatchState`]s.
#[derive(Debug, Clone)]
pub struct DispatchLifecycle {
    message_id: String,
    state: DispatchState,
}

impl DispatchLifecycle {
    /// Starts tracking a freshly decoded message.
    #[must_use]
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            state: DispatchState::Received,
        }
    }

    /// Id of the tracked message.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> DispatchState {
        self.state
    }

    /// Applies `event`, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when `event` is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: DispatchEvent) -> LifecycleResult<DispatchState> {
        use DispatchEvent as E;
        use DispatchState as S;

        let next = match (self.state, event) {
            (S::Received, E::Authenticate) => Some(S::Authenticated),
            (S::Authenticated, E::Authorize) => Some(S::Authorized),
            (S::Authorized, E::Route(route)) => Some(S::Routed(route)),
            (S::Routed(Route::Local), E::Execute) => Some(S::Executing),
            (S::Executing | S::Routed(Route::Remote), E::Complete) => Some(S::Completed),
            (
                S::Received | S::Authenticated | S::Authorized | S::Routed(_) | S::Executing,
                E::Fail,
            ) => Some(S::Failed),
            (S::Completed | S::Failed, E::Respond) => Some(S::Responded),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                message_id: self.message_id.clone(),
                from: self.state,
                event,
            });
        };

        debug!(
            message_id = %self.message_id,
            from = ?self.state,
            state = ?next_state,
            ?event,
            "dispatch transition"
        );
        self.state = next_state;
        Ok(next_state)
    }
}

/// Errors emitted by the dispatch state machine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid dispatch transition from {from:?} via {event:?} for message {message_id}")]
    InvalidTransition {
        /// Message whose transition failed.
        message_id: String,
        /// State prior to the attempted transition.
        from: DispatchState,
        /// Event that triggered the failure.
        event: DispatchEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_success_path() {
        let mut lifecycle = DispatchLifecycle::new("msg-1");
        assert_eq!(lifecycle.state(), DispatchState::Received);
        for event in [
            DispatchEvent::Authenticate,
            DispatchEvent::Authorize,
            DispatchEvent::Route(Route::Local),
            DispatchEvent::Execute,
            DispatchEvent::Complete,
        ] {
            lifecycle.transition(event).unwrap();
        }
        assert!(lifecycle.state().has_outcome());
        lifecycle.transition(DispatchEvent::Respond).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn remote_route_skips_execution() {
        let mut lifecycle = DispatchLifecycle::new("msg-2");
        lifecycle.transition(DispatchEvent::Authenticate).unwrap();
        lifecycle.transition(DispatchEvent::Authorize).unwrap();
        lifecycle.transition(DispatchEvent::Route(Route::Remote)).unwrap();
        assert!(lifecycle.transition(DispatchEvent::Execute).is_err());
        assert_eq!(
            lifecycle.transition(DispatchEvent::Complete).unwrap(),
            DispatchState::Completed
        );
    }

    #[test]
    fn fail_is_reachable_before_outcome_only() {
        let mut lifecycle = DispatchLifecycle::new("msg-3");
        lifecycle.transition(DispatchEvent::Fail).unwrap();
        assert!(matches!(
            lifecycle.transition(DispatchEvent::Fail),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        lifecycle.transition(DispatchEvent::Respond).unwrap();
        assert!(lifecycle.transition(DispatchEvent::Respond).is_err());
    }

    #[test]
    fn cannot_skip_authorization() {
        let mut lifecycle = DispatchLifecycle::new("msg-4");
        lifecycle.transition(DispatchEvent::Authenticate).unwrap();
        let err = lifecycle
            .transition(DispatchEvent::Route(Route::Local))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }
}
