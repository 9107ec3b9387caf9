//! Links that carry realtime frames between this client and the server.
//!
//! A [`Connector`] turns a bearer token into a [`Link`]: an outbound frame
//! sender plus an inbound event receiver. The channel layer only ever talks to
//! links, so the WebSocket implementation and the in-memory one used by tests
//! and tooling are interchangeable.

use crate::channel::ChannelError;
use crate::protocol::{Frame, OutboundEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Frame),
    Closed { reason: String },
}

pub struct Link {
    pub outbound: UnboundedSender<Frame>,
    pub inbound: UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Link, ChannelError>;
}

/// WebSocket connector. The token is sent twice: as an `Authorization`
/// header on the upgrade request and as the payload of the first `auth`
/// frame, since proxies in front of the server may strip either one.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Link, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ChannelError::Connect(format!("token is not a valid header: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (mut write, mut read) = stream.split();

        let auth = OutboundEvent::Auth {
            token: token.to_string(),
        }
        .into_frame()
        .and_then(|frame| frame.encode())
        .map_err(|err| ChannelError::Encode(err.to_string()))?;
        write
            .send(WsMessage::Text(auth))
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;

        let (outbound, mut outbound_rx) = unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(event = %frame.event, %err, "skipping unencodable frame");
                        continue;
                    }
                };
                if let Err(err) = write.send(WsMessage::Text(text)).await {
                    debug!(%err, "websocket writer stopped");
                    return;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => match Frame::decode(&text) {
                        Ok(frame) => {
                            if inbound_tx.send(LinkEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(%err, "ignoring malformed realtime frame"),
                    },
                    Some(Ok(WsMessage::Close(close))) => {
                        break close
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break err.to_string(),
                    None => break "transport closed".to_string(),
                }
            };
            let _ = inbound_tx.send(LinkEvent::Closed { reason });
        });

        Ok(Link { outbound, inbound })
    }
}

/// In-process connector. Each successful connect creates a [`MemoryPeer`]
/// standing in for the server end of the link.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    tokens: Vec<String>,
    peers: Vec<MemoryPeer>,
    reject_with: Option<String>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every following connect attempt, as a server would for a stale token.
    pub fn reject(&self, reason: impl Into<String>) {
        self.inner.lock().reject_with = Some(reason.into());
    }

    pub fn accept(&self) {
        self.inner.lock().reject_with = None;
    }

    /// Tokens of every attempt, accepted or not.
    pub fn tokens(&self) -> Vec<String> {
        self.inner.lock().tokens.clone()
    }

    /// Number of links handed out.
    pub fn links(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn latest(&self) -> Option<MemoryPeer> {
        self.inner.lock().peers.last().cloned()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, token: &str) -> Result<Link, ChannelError> {
        let mut state = self.inner.lock();
        state.tokens.push(token.to_string());
        if let Some(reason) = state.reject_with.clone() {
            return Err(ChannelError::Connect(reason));
        }

        let (outbound, outbound_rx) = unbounded_channel();
        let (inbound_tx, inbound) = unbounded_channel();
        let auth = OutboundEvent::Auth {
            token: token.to_string(),
        }
        .into_frame()
        .map_err(|err| ChannelError::Encode(err.to_string()))?;
        state.peers.push(MemoryPeer {
            to_client: inbound_tx,
            from_client: Arc::new(Mutex::new(outbound_rx)),
            received: Arc::new(Mutex::new(vec![auth])),
        });
        Ok(Link { outbound, inbound })
    }
}

/// Server end of an in-memory link.
#[derive(Clone)]
pub struct MemoryPeer {
    to_client: UnboundedSender<LinkEvent>,
    from_client: Arc<Mutex<UnboundedReceiver<Frame>>>,
    received: Arc<Mutex<Vec<Frame>>>,
}

impl MemoryPeer {
    /// Push an event to the client. Returns false once the client let go of the link.
    pub fn push(&self, event: &str, data: Value) -> bool {
        self.to_client
            .send(LinkEvent::Frame(Frame::new(event, data)))
            .is_ok()
    }

    /// Simulate the transport dropping underneath the client.
    pub fn close(&self, reason: impl Into<String>) -> bool {
        self.to_client
            .send(LinkEvent::Closed {
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Every frame the client sent on this link, starting with its `auth` frame.
    pub fn received(&self) -> Vec<Frame> {
        let mut log = self.received.lock();
        let mut rx = self.from_client.lock();
        while let Ok(frame) = rx.try_recv() {
            log.push(frame);
        }
        log.clone()
    }

    pub fn is_attached(&self) -> bool {
        !self.to_client.is_closed()
    }
}
