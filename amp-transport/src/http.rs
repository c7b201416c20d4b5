//! HTTP binding: `POST /amp/v1/invoke` with bearer authentication.
//!
//! Status codes are transport-level only. Protocol errors travel as AMP error
//! messages inside a 200 body; 202 means the message produced no reply.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use amp_codec::encode;
use amp_primitives::{AgentId, Message};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::body::{HttpBody as _, to_bytes};
use hyper::header::{ALLOW, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::http_client::{HyperClient, build_client};
use crate::traits::{InboundFrame, InboundStream, Transport};
use crate::{TransportError, TransportResult};

/// Path of the invoke endpoint.
pub const INVOKE_PATH: &str = "/amp/v1/invoke";

/// Settings for [`HttpTransport`].
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Base URL of each known peer, e.g. `http://10.0.0.5:8700`.
    pub peers: HashMap<AgentId, String>,
    /// Token sent as `Authorization: Bearer` on outbound requests.
    pub bearer_token: Option<String>,
    /// Bound on one outbound request, and on how long the listener waits for
    /// the runtime's reply.
    pub request_timeout: Duration,
    /// Address to listen on; outbound-only when absent.
    pub listen: Option<SocketAddr>,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Inbound frames buffered before the listener applies backpressure.
    pub inbox_capacity: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
            bearer_token: None,
            request_timeout: Duration::from_secs(30),
            listen: None,
            max_body_bytes: 1024 * 1024,
            inbox_capacity: 256,
        }
    }
}

impl HttpTransportConfig {
    /// Adds a peer base URL.
    #[must_use]
    pub fn with_peer(mut self, agent: AgentId, base_url: impl Into<String>) -> Self {
        self.peers.insert(agent, base_url.into());
        self
    }

    /// Listens on `addr`.
    #[must_use]
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Sets the outbound bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// HTTP client plus optional listener.
pub struct HttpTransport {
    client: HyperClient,
    peers: HashMap<AgentId, Uri>,
    bearer: Option<String>,
    request_timeout: Duration,
    local_addr: Option<SocketAddr>,
    inbox: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("peers", &self.peers)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct Listener {
    inbox: mpsc::Sender<InboundFrame>,
    max_body_bytes: usize,
    reply_timeout: Duration,
}

impl HttpTransport {
    /// Builds the client and, when configured, binds and spawns the listener.
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] for unparsable peer URLs or a
    /// listen address that cannot be bound.
    pub fn bind(config: HttpTransportConfig) -> TransportResult<Self> {
        let peers = config
            .peers
            .iter()
            .map(|(agent, base)| {
                let uri = format!("{}{INVOKE_PATH}", base.trim_end_matches('/'))
                    .parse::<Uri>()
                    .map_err(|err| {
                        TransportError::configuration(format!("invalid URL for peer `{agent}`: {err}"))
                    })?;
                Ok((agent.clone(), uri))
            })
            .collect::<TransportResult<HashMap<_, _>>>()?;

        let mut transport = Self {
            client: build_client(config.request_timeout),
            peers,
            bearer: config.bearer_token.clone(),
            request_timeout: config.request_timeout,
            local_addr: None,
            inbox: Mutex::new(None),
            shutdown: Mutex::new(None),
        };

        if let Some(addr) = config.listen {
            transport.spawn_listener(addr, &config)?;
        }
        Ok(transport)
    }

    fn spawn_listener(&mut self, addr: SocketAddr, config: &HttpTransportConfig) -> TransportResult<()> {
        let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
        let listener = Arc::new(Listener {
            inbox: tx,
            max_body_bytes: config.max_body_bytes,
            reply_timeout: config.request_timeout,
        });

        let make_service = make_service_fn(move |_conn| {
            let listener = Arc::clone(&listener);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle_request(Arc::clone(&listener), request)
                }))
            }
        });

        let server = Server::try_bind(&addr)
            .map_err(|err| TransportError::configuration(format!("cannot bind {addr}: {err}")))?
            .serve(make_service);
        let local_addr = server.local_addr();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = stop_rx.await;
        });
        tokio::spawn(async move {
            if let Err(err) = graceful.await {
                warn!(?err, "amp http listener stopped with error");
            }
        });
        info!(%local_addr, path = INVOKE_PATH, "amp http listener started");

        self.local_addr = Some(local_addr);
        *self.inbox.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        *self.shutdown.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        Ok(())
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops the listener; in-flight requests finish.
    pub fn shutdown(&self) {
        if let Some(stop) = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stop.send(());
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_request(
    listener: Arc<Listener>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    Ok(match accept(&listener, request).await {
        Ok(response) | Err(response) => response,
    })
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    response
}

async fn accept(listener: &Listener, request: Request<Body>) -> Result<Response<Body>, Response<Body>> {
    if request.uri().path() != INVOKE_PATH {
        return Err(status(StatusCode::NOT_FOUND));
    }
    if request.method() != Method::POST {
        let mut response = status(StatusCode::METHOD_NOT_ALLOWED);
        response
            .headers_mut()
            .insert(ALLOW, hyper::header::HeaderValue::from_static("POST"));
        return Err(response);
    }

    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > listener.max_body_bytes) {
        return Err(status(StatusCode::PAYLOAD_TOO_LARGE));
    }

    let bearer = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned());

    let mut body = request.into_body();
    let mut raw = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| {
            debug!(?err, "failed reading request body");
            status(StatusCode::BAD_REQUEST)
        })?;
        if raw.len() + chunk.len() > listener.max_body_bytes {
            return Err(status(StatusCode::PAYLOAD_TOO_LARGE));
        }
        raw.extend_from_slice(&chunk);
    }

    let (frame, reply) = InboundFrame::with_reply(raw.freeze(), bearer);
    listener
        .inbox
        .send(frame)
        .await
        .map_err(|_| status(StatusCode::SERVICE_UNAVAILABLE))?;

    match timeout(listener.reply_timeout, reply).await {
        Ok(Ok(Some(bytes))) => {
            let mut response = Response::new(Body::from(bytes));
            response.headers_mut().insert(
                CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            Ok(response)
        }
        Ok(Ok(None) | Err(_)) => Ok(status(StatusCode::ACCEPTED)),
        Err(_) => Err(status(StatusCode::GATEWAY_TIMEOUT)),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: &Message) -> TransportResult<Option<Bytes>> {
        let destination = message
            .destination
            .agent_id
            .as_ref()
            .ok_or_else(|| TransportError::configuration("message has no destination agent"))?;
        let uri = self
            .peers
            .get(destination)
            .ok_or_else(|| TransportError::UnknownPeer {
                agent: destination.to_string(),
            })?;

        let mut builder = Request::post(uri.clone()).header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder
            .body(Body::from(encode(message)?))
            .map_err(|err| TransportError::configuration(format!("failed to build request: {err}")))?;

        let response = timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::connection(format!("request to `{destination}` failed: {err}")))?;

        let code = response.status();
        let bytes = to_bytes(response.into_body())
            .await
            .map_err(|err| TransportError::connection(format!("failed to read response: {err}")))?;

        match code {
            StatusCode::OK => Ok(Some(bytes)),
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(None),
            StatusCode::GATEWAY_TIMEOUT => Err(TransportError::Timeout),
            code if code.is_server_error() => Err(TransportError::connection(format!(
                "peer `{destination}` answered {code}"
            ))),
            code => Err(TransportError::Rejected {
                status: code.as_u16(),
            }),
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

    fn listener() -> HttpTransport {
        HttpTransport::bind(HttpTransportConfig::default().listen_on(([127, 0, 0, 1], 0).into())).unwrap()
    }

    fn small_listener(max_body_bytes: usize) -> HttpTransport {
        HttpTransport::bind(HttpTransportConfig {
            max_body_bytes,
            ..HttpTransportConfig::default().listen_on(([127, 0, 0, 1], 0).into())
        })
        .unwrap()
    }

    fn client_for(server: &HttpTransport) -> HttpTransport {
        let base = format!("http://{}", server.local_addr().unwrap());
        HttpTransport::bind(
            HttpTransportConfig::default()
                .with_peer(agent("agent-b"), base)
                .with_bearer("secret-token"),
        )
        .unwrap()
    }

    fn message(kind: MessageType) -> Message {
        Message::new(
            kind,
            Endpoint::agent(agent("agent-a")),
            Endpoint::agent(agent("agent-b")),
            json!({"hello": "world"}),
        )
    }

    #[tokio::test]
    async fn round_trips_through_listener() {
        let server = listener();
        let client = client_for(&server);
        let mut inbound = server.receive().unwrap();

        tokio::spawn(async move {
            let mut frame = inbound.next().await.unwrap();
            assert_eq!(frame.bearer.as_deref(), Some("secret-token"));
            let body: serde_json::Value = serde_json::from_slice(&frame.raw).unwrap();
            assert_eq!(body["protocol"], "AMP/1.0");
            frame.respond(Some(Bytes::from_static(b"{\"ok\":true}")));

            let mut frame = inbound.next().await.unwrap();
            frame.respond(None);
        });

        let reply = client.send(&message(MessageType::Event)).await.unwrap();
        assert_eq!(reply, Some(Bytes::from_static(b"{\"ok\":true}")));
        let reply = client.send(&message(MessageType::Event)).await.unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn transport_level_statuses() {
        let server = small_listener(16);
        let addr = server.local_addr().unwrap();
        let client = build_client(Duration::from_secs(5));

        let wrong_path = Request::post(format!("http://{addr}/other"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(client.request(wrong_path).await.unwrap().status(), StatusCode::NOT_FOUND);

        let wrong_method = Request::get(format!("http://{addr}{INVOKE_PATH}"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            client.request(wrong_method).await.unwrap().status(),
            StatusCode::METHOD_NOT_ALLOWED
        );

        let too_big = Request::post(format!("http://{addr}{INVOKE_PATH}"))
            .body(Body::from(vec![b' '; 64]))
            .unwrap();
        assert_eq!(
            client.request(too_big).await.unwrap().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn unknown_peer() {
        let client = HttpTransport::bind(HttpTransportConfig::default()).unwrap();
        let err = client.send(&message(MessageType::Event)).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer { .. }));
        assert!(matches!(client.receive(), Err(TransportError::Closed)));
    }
}
