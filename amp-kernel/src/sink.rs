//! Destinations for inbound `event` messages.

use std::sync::{Arc, Mutex, PoisonError};

use amp_primitives::Message;
use tracing::info;

/// Receives every admitted inbound event.
pub trait EventSink: Send + Sync {
    /// Records one event. Events never produce a reply.
    fn on_event(&self, message: &Message);
}

/// Sink that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, message: &Message) {
        info!(
            message_id = %message.id,
            source = ?message.source.agent_id,
            payload = %message.payload,
            "event received"
        );
    }
}

/// Sink that keeps events in memory until drained.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<Message>>,
}

impl CollectingEventSink {
    /// Creates an empty shared sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Removes and returns the collected events.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.drain(..).collect()
    }
}

impl EventSink for CollectingEventSink {
    fn on_event(&self, message: &Message) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::{AgentId, Endpoint};
    use serde_json::json;

    #[test]
    fn collecting_sink_drains_in_order() {
        let sink = CollectingEventSink::new();
        let source = Endpoint::agent(AgentId::new("agent-a").unwrap());
        let target = Endpoint::agent(AgentId::new("agent-b").unwrap());
        for n in 0..3 {
            sink.on_event(&Message::event(source.clone(), target.clone(), json!({ "n": n })));
        }
        let events = sink.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].payload["n"], 2);
        assert!(sink.drain().is_empty());
    }
}
