//! WAMP over WebSocket, a thin client over `tokio-tungstenite`
//!
//! Only the client-side publisher/subscriber messages are implemented. The
//! socket is owned by a link task; the [`Link`] handle talks to it through a
//! command channel with oneshot replies.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{JoinedLink, Link, SubscriptionId, Transport, TransportEvent};
use crate::wamp::error::TransportError;
use crate::wamp::protocol::{
    event_payload, WireMessage, CLOSE_GOODBYE_AND_OUT, CLOSE_NORMAL, SUBPROTOCOL,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum LinkCommand {
    Publish {
        topic: String,
        payload: Value,
        reply: Reply<()>,
    },
    Subscribe {
        topic: String,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        subscription: SubscriptionId,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
}

/// Joins realms on a WAMP router over WebSocket
///
/// The handshake timeout also bounds every SUBSCRIBE and UNSUBSCRIBE reply
/// on the joined link.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    handshake_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl WebSocketTransport {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn join(&self, realm: &str, router_url: &Url) -> Result<JoinedLink, TransportError> {
        let mut request = router_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );

        debug!("Connecting to {}", router_url);
        let (mut ws, _) = timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(format!("connection to {}", router_url)))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let hello = WireMessage::Hello {
            realm: realm.to_string(),
        };
        ws.send(Message::Text(hello.to_text().into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let session = timeout(self.handshake_timeout, await_welcome(&mut ws))
            .await
            .map_err(|_| TransportError::Timeout("WELCOME".to_string()))??;
        info!(
            "Joined realm {} on {} as session {}",
            realm, router_url, session
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(link_loop(ws, cmd_rx, events_tx));

        Ok(JoinedLink {
            link: Box::new(WebSocketLink {
                cmd_tx,
                reply_timeout: self.handshake_timeout,
                task: Some(task),
            }),
            events: events_rx,
        })
    }
}

async fn await_welcome(ws: &mut WsStream) -> Result<u64, TransportError> {
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| TransportError::Connect(e.to_string()))?;
        match frame {
            Message::Text(text) => {
                return match WireMessage::from_text(&text)? {
                    WireMessage::Welcome { session } => Ok(session),
                    WireMessage::Abort { reason } => Err(TransportError::Aborted(reason)),
                    other => Err(TransportError::Protocol(format!(
                        "expected WELCOME, got {:?}",
                        other
                    ))),
                };
            }
            Message::Close(frame) => {
                return Err(TransportError::Closed(format!(
                    "router closed during join: {:?}",
                    frame
                )))
            }
            _ => continue,
        }
    }
    Err(TransportError::Closed(
        "connection ended during join".to_string(),
    ))
}

struct WebSocketLink {
    cmd_tx: mpsc::Sender<LinkCommand>,
    reply_timeout: Duration,
    task: Option<JoinHandle<()>>,
}

impl WebSocketLink {
    async fn request<T>(
        &self,
        command: LinkCommand,
        rx: oneshot::Receiver<Result<T, TransportError>>,
        waiting_for: &str,
    ) -> Result<T, TransportError> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| TransportError::Closed("link task has stopped".to_string()))?;
        match timeout(self.reply_timeout, rx).await {
            Ok(reply) => reply.map_err(|_| TransportError::Closed("reply dropped".to_string()))?,
            Err(_) => Err(TransportError::Timeout(waiting_for.to_string())),
        }
    }

    /// Waits for the link task so the close frame is on the wire before the
    /// caller tears down its runtime.
    async fn finish(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        match timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("WebSocket link task failed: {}", e),
            Err(_) => debug!("WebSocket link task still closing after {:?}", CLOSE_TIMEOUT),
        }
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        let command = LinkCommand::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            reply,
        };
        self.request(command, rx, "PUBLISH to be sent").await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let (reply, rx) = oneshot::channel();
        let command = LinkCommand::Subscribe {
            topic: topic.to_string(),
            reply,
        };
        self.request(command, rx, "SUBSCRIBED").await
    }

    async fn unsubscribe(&mut self, subscription: SubscriptionId) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        let command = LinkCommand::Unsubscribe {
            subscription,
            reply,
        };
        self.request(command, rx, "UNSUBSCRIBED").await
    }

    async fn leave(&mut self) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(LinkCommand::Leave { reply }).await.is_err() {
            debug!("Leave on a link that already stopped");
            self.finish().await;
            return Ok(());
        }
        let result = match timeout(LEAVE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(TransportError::Timeout("GOODBYE".to_string())),
        };
        if result.is_ok() {
            self.finish().await;
        }
        result
    }
}

async fn link_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut next_request: u64 = 0;
    let mut pending_subscribe: HashMap<u64, Reply<SubscriptionId>> = HashMap::new();
    let mut pending_unsubscribe: HashMap<u64, Reply<()>> = HashMap::new();
    let mut leaving: Option<Reply<()>> = None;

    let close_reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    break "link handle dropped".to_string();
                };
                next_request += 1;
                let request = next_request;
                match cmd {
                    LinkCommand::Publish { topic, payload, reply } => {
                        let text = WireMessage::publish(request, &topic, &payload).to_text();
                        let result = ws_tx
                            .send(Message::Text(text.into()))
                            .await
                            .map_err(|e| TransportError::Closed(e.to_string()));
                        let _ = reply.send(result);
                    }
                    LinkCommand::Subscribe { topic, reply } => {
                        let text = WireMessage::Subscribe { request, topic }.to_text();
                        match ws_tx.send(Message::Text(text.into())).await {
                            Ok(()) => {
                                pending_subscribe.insert(request, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(TransportError::Closed(e.to_string())));
                            }
                        }
                    }
                    LinkCommand::Unsubscribe { subscription, reply } => {
                        let text = WireMessage::Unsubscribe { request, subscription }.to_text();
                        match ws_tx.send(Message::Text(text.into())).await {
                            Ok(()) => {
                                pending_unsubscribe.insert(request, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(TransportError::Closed(e.to_string())));
                            }
                        }
                    }
                    LinkCommand::Leave { reply } => {
                        let text = WireMessage::Goodbye { reason: CLOSE_NORMAL.to_string() }.to_text();
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            let _ = reply.send(Err(TransportError::Closed(e.to_string())));
                            break "GOODBYE could not be sent".to_string();
                        }
                        leaving = Some(reply);
                    }
                }
            }
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => break format!("router closed the socket: {:?}", frame),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("socket error: {}", e),
                    None => break "socket ended".to_string(),
                };

                let message = match WireMessage::from_text(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ignoring frame from router: {}", e);
                        continue;
                    }
                };

                match message {
                    WireMessage::Event { subscription, args, kwargs, .. } => {
                        let event = TransportEvent::Event {
                            subscription,
                            payload: event_payload(args, kwargs),
                        };
                        if events_tx.send(event).is_err() {
                            debug!("Session stopped listening for events");
                        }
                    }
                    WireMessage::Subscribed { request, subscription } => {
                        if let Some(reply) = pending_subscribe.remove(&request) {
                            let _ = reply.send(Ok(subscription));
                        }
                    }
                    WireMessage::Unsubscribed { request } => {
                        if let Some(reply) = pending_unsubscribe.remove(&request) {
                            let _ = reply.send(Ok(()));
                        }
                    }
                    WireMessage::Error { request, error, .. } => {
                        warn!("Router rejected request {}: {}", request, error);
                        if let Some(reply) = pending_subscribe.remove(&request) {
                            let _ = reply.send(Err(TransportError::Rejected(error)));
                        } else if let Some(reply) = pending_unsubscribe.remove(&request) {
                            let _ = reply.send(Err(TransportError::Rejected(error)));
                        }
                    }
                    WireMessage::Goodbye { reason } => {
                        if let Some(reply) = leaving.take() {
                            let _ = reply.send(Ok(()));
                            break reason;
                        }
                        let text = WireMessage::Goodbye { reason: CLOSE_GOODBYE_AND_OUT.to_string() }.to_text();
                        let _ = ws_tx.send(Message::Text(text.into())).await;
                        break reason;
                    }
                    WireMessage::Abort { reason } => break reason,
                    WireMessage::Published { .. } => {}
                    other => warn!("Unexpected message from router: {:?}", other),
                }
            }
        }
    };

    info!("WebSocket link closing: {}", close_reason);
    if let Some(reply) = leaving.take() {
        let _ = reply.send(Ok(()));
    }
    for (_, reply) in pending_subscribe.drain() {
        let _ = reply.send(Err(TransportError::Closed(close_reason.clone())));
    }
    for (_, reply) in pending_unsubscribe.drain() {
        let _ = reply.send(Err(TransportError::Closed(close_reason.clone())));
    }
    if let Err(e) = ws_tx.close().await {
        debug!("Socket close: {}", e);
    }
    if events_tx.send(TransportEvent::Closed(close_reason)).is_err() {
        debug!("Session loop already released the link");
    }
}
