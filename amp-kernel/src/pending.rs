//! Outbound requests awaiting an asynchronous reply.

use amp_primitives::{Message, MessageType};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
struct Waiter {
    tx: oneshot::Sender<Message>,
    // Delegation waiters outlive the `accepted` acknowledgement.
    skip_accepted: bool,
}

/// Waiters keyed by the id of the request they sent.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: DashMap<String, Waiter>,
}

impl PendingRequests {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the first reply to `message_id`.
    pub fn register(&self, message_id: impl Into<String>) -> oneshot::Receiver<Message> {
        self.insert(message_id.into(), false)
    }

    /// Registers interest in the final outcome of delegated work, ignoring
    /// the interim `accepted` response.
    pub fn register_delegation(&self, message_id: impl Into<String>) -> oneshot::Receiver<Message> {
        self.insert(message_id.into(), true)
    }

    fn insert(&self, message_id: String, skip_accepted: bool) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(message_id, Waiter { tx, skip_accepted });
        rx
    }

    /// Hands `reply` to the waiter named by its correlation id.
    ///
    /// Returns `false` when nobody is waiting, including waiters that
    /// already gave up.
    pub fn complete(&self, reply: Message) -> bool {
        let Some(correlation_id) = reply.headers.correlation_id.clone() else {
            return false;
        };
        let Some((_, waiter)) = self
            .waiters
            .remove_if(&correlation_id, |_, waiter| !(waiter.skip_accepted && is_accepted(&reply)))
        else {
            if self.waiters.contains_key(&correlation_id) {
                debug!(%correlation_id, "delegation acknowledged");
                return true;
            }
            return false;
        };
        let delivered = waiter.tx.send(reply).is_ok();
        if !delivered {
            debug!(%correlation_id, "reply arrived after the waiter gave up");
        }
        delivered
    }

    /// Drops interest in `message_id`.
    pub fn cancel(&self, message_id: &str) {
        self.waiters.remove(message_id);
    }

    /// Cancels `message_id` when the returned guard is dropped, so a caller
    /// that stops waiting for any reason leaves no waiter behind.
    pub(crate) fn cancel_on_drop<'a>(&'a self, message_id: &'a str) -> CancelOnDrop<'a> {
        CancelOnDrop {
            pending: self,
            message_id,
        }
    }

    /// Number of outstanding waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

pub(crate) struct CancelOnDrop<'a> {
    pending: &'a PendingRequests,
    message_id: &'a str,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.message_id);
    }
}

fn is_accepted(reply: &Message) -> bool {
    reply.kind == MessageType::Response
        && reply.payload.get("status").and_then(Value::as_str) == Some("accepted")
}
