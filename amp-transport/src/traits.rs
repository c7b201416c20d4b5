//! Transport collaborator interface.

use std::pin::Pin;

use amp_primitives::Message;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::oneshot;

use crate::TransportResult;

/// Stream of inbound frames yielded by [`Transport::receive`].
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundFrame> + Send>>;

/// One raw inbound message plus the channel for its inline reply.
#[derive(Debug)]
pub struct InboundFrame {
    /// Undecoded wire bytes.
    pub raw: Bytes,
    /// Bearer token presented by the binding, if any.
    pub bearer: Option<String>,
    reply: Option<oneshot::Sender<Option<Bytes>>>,
}

impl InboundFrame {
    /// Frame whose sender does not wait for a reply.
    #[must_use]
    pub fn new(raw: Bytes, bearer: Option<String>) -> Self {
        Self {
            raw,
            bearer,
            reply: None,
        }
    }

    /// Frame whose sender awaits the inline reply on the returned receiver.
    #[must_use]
    pub fn with_reply(raw: Bytes, bearer: Option<String>) -> (Self, oneshot::Receiver<Option<Bytes>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                raw,
                bearer,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Whether the sender is waiting for a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Completes the frame. `None` means the message produced no reply.
    pub fn respond(&mut self, reply: Option<Bytes>) {
        if let Some(tx) = self.reply.take() {
            // The sender may have given up waiting.
            let _ = tx.send(reply);
        }
    }
}

/// Trait implemented by every binding (loopback, HTTP, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `message` to `destination.agent_id`, returning the peer's
    /// inline reply bytes when the binding carries one.
    async fn send(&self, message: &Message) -> TransportResult<Option<Bytes>>;

    /// Takes the inbound frame stream. Later calls return
    /// [`crate::TransportError::Closed`].
    fn receive(&self) -> TransportResult<InboundStream>;
}
