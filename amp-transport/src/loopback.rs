//! In-process transport connecting runtimes in the same process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use amp_codec::encode;
use amp_primitives::{AgentId, Message};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use crate::traits::{InboundFrame, InboundStream, Transport};
use crate::{TransportError, TransportResult};

const DEFAULT_INBOX_CAPACITY: usize = 256;
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Switchboard of per-agent inboxes.
#[derive(Clone, Default, Debug)]
pub struct LoopbackNetwork {
    peers: Arc<RwLock<HashMap<AgentId, mpsc::Sender<InboundFrame>>>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `agent`, replacing any previous attachment.
    #[must_use]
    pub fn attach(&self, agent: AgentId) -> LoopbackTransport {
        let (tx, rx) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent.clone(), tx);
        LoopbackTransport {
            agent,
            network: self.clone(),
            inbox: Mutex::new(Some(rx)),
            bearer: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Detaches `agent`; later sends to it fail with a connection error.
    pub fn detach(&self, agent: &AgentId) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent);
    }

    fn route(&self, agent: &AgentId) -> Option<mpsc::Sender<InboundFrame>> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .cloned()
    }
}

/// One agent's attachment to a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    agent: AgentId,
    network: LoopbackNetwork,
    inbox: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    bearer: Option<String>,
    reply_timeout: Duration,
}

impl LoopbackTransport {
    /// Presents `token` as a bearer credential on every send.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Bounds how long a send waits for the peer's inline reply.
    #[must_use]
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Agent this transport is attached as.
    #[must_use]
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, message: &Message) -> TransportResult<Option<Bytes>> {
        let destination = message
            .destination
            .agent_id
            .as_ref()
            .ok_or_else(|| TransportError::configuration("message has no destination agent"))?;
        let peer = self
            .network
            .route(destination)
            .ok_or_else(|| TransportError::UnknownPeer {
                agent: destination.to_string(),
            })?;

        let raw = encode(message)?;
        let (frame, reply) = InboundFrame::with_reply(raw, self.bearer.clone());
        peer.send(frame)
            .await
            .map_err(|_| TransportError::connection(format!("agent `{destination}` stopped receiving")))?;
        trace!(from = %self.agent, to = %destination, message_id = %message.id, "loopback frame delivered");

        match timeout(self.reply_timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            // Peer dropped the frame without answering.
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn receive(&self) -> TransportResult<InboundStream> {
        let rx = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(TransportError::Closed)?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amp_primitives::{Endpoint, MessageType};
    use futures::StreamExt;
    use serde_json::json;

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    fn event_to(dest: &str) -> Message {
        Message::new(
            MessageType::Event,
            Endpoint::agent(agent("agent-a")),
            Endpoint::agent(agent(dest)),
            json!({"event": "ping"}),
        )
    }

    #[tokio::test]
    async fn delivers_and_returns_inline_reply() {
        let network = LoopbackNetwork::new();
        let a = network.attach(agent("agent-a")).with_bearer("key-a");
        let b = network.attach(agent("agent-b"));

        let mut inbound = b.receive().unwrap();
        let server = tokio::spawn(async move {
            let mut frame = inbound.next().await.unwrap();
            assert_eq!(frame.bearer.as_deref(), Some("key-a"));
            assert!(frame.expects_reply());
            frame.respond(Some(Bytes::from_static(b"pong")));
        });

        let reply = a.send(&event_to("agent-b")).await.unwrap();
        assert_eq!(reply, Some(Bytes::from_static(b"pong")));
        server.await.unwrap();
        assert!(matches!(b.receive(), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn unknown_and_detached_peers() {
        let network = LoopbackNetwork::new();
        let a = network.attach(agent("agent-a"));
        let err = a.send(&event_to("agent-z")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer { .. }));
        assert!(!err.is_transient());

        let b = network.attach(agent("agent-b"));
        drop(b);
        let err = a.send(&event_to("agent-b")).await.unwrap_err();
        assert!(err.is_transient());

        network.detach(&agent("agent-b"));
        assert!(matches!(
            a.send(&event_to("agent-b")).await,
            Err(TransportError::UnknownPeer { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_frame_means_no_reply() {
        let network = LoopbackNetwork::new();
        let a = network.attach(agent("agent-a"));
        let b = network.attach(agent("agent-b"));
        let mut inbound = b.receive().unwrap();
        tokio::spawn(async move {
            drop(inbound.next().await);
        });
        assert_eq!(a.send(&event_to("agent-b")).await.unwrap(), None);
    }
}
