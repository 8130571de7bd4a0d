//! Transport seam between the session loop and the messaging fabric
//!
//! The session loop only needs four operations from a transport: join a
//! realm, publish, subscribe/unsubscribe and leave. Everything about
//! framing stays behind [`Transport`] and [`Link`].

pub mod loopback;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use super::error::TransportError;

pub use loopback::LoopbackTransport;
pub use websocket::WebSocketTransport;

/// Router-assigned identifier of a topic subscription
pub type SubscriptionId = u64;

/// Something the fabric pushed to this session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A publication on a subscribed topic
    Event {
        subscription: SubscriptionId,
        payload: Value,
    },
    /// The router or the connection ended the session
    Closed(String),
}

/// A joined connection together with its inbound event stream
pub struct JoinedLink {
    pub link: Box<dyn Link>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for joined connections
///
/// Implementations are shared between sessions; `join` runs on the
/// session's own runtime.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn join(&self, realm: &str, router_url: &Url) -> Result<JoinedLink, TransportError>;
}

/// One joined connection, exclusively owned by a session loop
#[async_trait]
pub trait Link: Send {
    async fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError>;

    async fn unsubscribe(&mut self, subscription: SubscriptionId) -> Result<(), TransportError>;

    /// Graceful leave. Calling it on an already closed link is not an error.
    async fn leave(&mut self) -> Result<(), TransportError>;
}
