use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const PREVIEW_LEN: usize = 40;

/// A message the fabric delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub realm: String,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload.to_string();
        let preview: String = content.chars().take(PREVIEW_LEN).collect();
        write!(
            f,
            "{} - {}/{} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.realm,
            self.topic,
            preview
        )
    }
}

impl InboundMessage {
    pub fn new(realm: &str, topic: &str, payload: Value) -> Self {
        InboundMessage {
            realm: realm.to_string(),
            topic: topic.to_string(),
            payload,
            timestamp: Local::now(),
        }
    }

    /// Multi-line rendering for message viewers
    pub fn render(&self) -> String {
        let pretty =
            serde_json::to_string_pretty(&self.payload).unwrap_or_else(|_| self.payload.to_string());
        format!(
            "{}: {} / {}\n{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.realm,
            self.topic,
            pretty
        )
    }
}

/// Receives inbound messages on the caller's side of the bridge
pub trait MessageHandler: Send + 'static {
    fn on_message(&mut self, message: InboundMessage);
}

impl<F> MessageHandler for F
where
    F: FnMut(InboundMessage) + Send + 'static,
{
    fn on_message(&mut self, message: InboundMessage) {
        self(message)
    }
}

/// Sending half handed to a session; the session thread pushes, the
/// dispatcher on the caller's runtime pulls
pub type MessageDispatch = mpsc::UnboundedSender<InboundMessage>;

/// Spawns the caller-side dispatcher on the current runtime.
///
/// Messages reach the handler in the order the session pushed them. The task
/// ends once every [`MessageDispatch`] clone is dropped and the queue is
/// drained, so awaiting the handle after closing the session guarantees no
/// further callbacks.
pub fn spawn_dispatcher<H: MessageHandler>(mut handler: H) -> (MessageDispatch, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    let handle = tokio::spawn(async move {
        debug!("Message dispatcher started");
        let mut delivered = 0usize;
        while let Some(message) = rx.recv().await {
            handler.on_message(message);
            delivered += 1;
        }
        info!("Message dispatcher finished after {} message(s)", delivered);
    });
    (tx, handle)
}
