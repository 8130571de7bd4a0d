//! WAMP v2 JSON messages used by the WebSocket transport
//!
//! Only the subset a publisher/subscriber client needs is covered. Messages
//! are JSON arrays whose first element is the message type code.

use serde_json::{json, Map, Value};

use super::error::TransportError;

pub const SUBPROTOCOL: &str = "wamp.2.json";
pub const CLOSE_NORMAL: &str = "wamp.close.normal";
pub const CLOSE_GOODBYE_AND_OUT: &str = "wamp.close.goodbye_and_out";

const HELLO: u64 = 1;
const WELCOME: u64 = 2;
const ABORT: u64 = 3;
const GOODBYE: u64 = 6;
const ERROR: u64 = 8;
const PUBLISH: u64 = 16;
const PUBLISHED: u64 = 17;
const SUBSCRIBE: u64 = 32;
const SUBSCRIBED: u64 = 33;
const UNSUBSCRIBE: u64 = 34;
const UNSUBSCRIBED: u64 = 35;
const EVENT: u64 = 36;

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Hello {
        realm: String,
    },
    Welcome {
        session: u64,
    },
    Abort {
        reason: String,
    },
    Goodbye {
        reason: String,
    },
    Error {
        request_type: u64,
        request: u64,
        error: String,
    },
    Publish {
        request: u64,
        topic: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
    Published {
        request: u64,
        publication: u64,
    },
    Subscribe {
        request: u64,
        topic: String,
    },
    Subscribed {
        request: u64,
        subscription: u64,
    },
    Unsubscribe {
        request: u64,
        subscription: u64,
    },
    Unsubscribed {
        request: u64,
    },
    Event {
        subscription: u64,
        publication: u64,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    },
}

impl WireMessage {
    /// Builds a PUBLISH the way a keyword-argument publish does: a JSON
    /// object travels as kwargs, any other value as the single positional
    /// argument.
    pub fn publish(request: u64, topic: &str, payload: &Value) -> Self {
        let (args, kwargs) = match payload {
            Value::Object(map) => (Vec::new(), map.clone()),
            other => (vec![other.clone()], Map::new()),
        };
        WireMessage::Publish {
            request,
            topic: topic.to_string(),
            args,
            kwargs,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            WireMessage::Hello { realm } => json!([
                HELLO,
                realm,
                {"roles": {"publisher": {}, "subscriber": {}}}
            ]),
            WireMessage::Welcome { session } => json!([WELCOME, session, {}]),
            WireMessage::Abort { reason } => json!([ABORT, {}, reason]),
            WireMessage::Goodbye { reason } => json!([GOODBYE, {}, reason]),
            WireMessage::Error {
                request_type,
                request,
                error,
            } => json!([ERROR, request_type, request, {}, error]),
            WireMessage::Publish {
                request,
                topic,
                args,
                kwargs,
            } => json!([PUBLISH, request, {}, topic, args, kwargs]),
            WireMessage::Published {
                request,
                publication,
            } => json!([PUBLISHED, request, publication]),
            WireMessage::Subscribe { request, topic } => json!([SUBSCRIBE, request, {}, topic]),
            WireMessage::Subscribed {
                request,
                subscription,
            } => json!([SUBSCRIBED, request, subscription]),
            WireMessage::Unsubscribe {
                request,
                subscription,
            } => json!([UNSUBSCRIBE, request, subscription]),
            WireMessage::Unsubscribed { request } => json!([UNSUBSCRIBED, request]),
            WireMessage::Event {
                subscription,
                publication,
                args,
                kwargs,
            } => json!([EVENT, subscription, publication, {}, args, kwargs]),
        }
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }

    pub fn from_text(text: &str) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("invalid JSON: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, TransportError> {
        let items = value
            .as_array()
            .ok_or_else(|| TransportError::Protocol("message is not an array".to_string()))?;
        let code = id_at(items, 0)?;

        let message = match code {
            HELLO => WireMessage::Hello {
                realm: str_at(items, 1)?,
            },
            WELCOME => WireMessage::Welcome {
                session: id_at(items, 1)?,
            },
            ABORT => WireMessage::Abort {
                reason: str_at(items, 2)?,
            },
            GOODBYE => WireMessage::Goodbye {
                reason: str_at(items, 2)?,
            },
            ERROR => WireMessage::Error {
                request_type: id_at(items, 1)?,
                request: id_at(items, 2)?,
                error: str_at(items, 4)?,
            },
            PUBLISH => WireMessage::Publish {
                request: id_at(items, 1)?,
                topic: str_at(items, 3)?,
                args: args_at(items, 4),
                kwargs: kwargs_at(items, 5),
            },
            PUBLISHED => WireMessage::Published {
                request: id_at(items, 1)?,
                publication: id_at(items, 2)?,
            },
            SUBSCRIBE => WireMessage::Subscribe {
                request: id_at(items, 1)?,
                topic: str_at(items, 3)?,
            },
            SUBSCRIBED => WireMessage::Subscribed {
                request: id_at(items, 1)?,
                subscription: id_at(items, 2)?,
            },
            UNSUBSCRIBE => WireMessage::Unsubscribe {
                request: id_at(items, 1)?,
                subscription: id_at(items, 2)?,
            },
            UNSUBSCRIBED => WireMessage::Unsubscribed {
                request: id_at(items, 1)?,
            },
            EVENT => WireMessage::Event {
                subscription: id_at(items, 1)?,
                publication: id_at(items, 2)?,
                args: args_at(items, 4),
                kwargs: kwargs_at(items, 5),
            },
            other => {
                return Err(TransportError::Protocol(format!(
                    "unsupported message type {}",
                    other
                )))
            }
        };
        Ok(message)
    }
}

/// Payload shape handed to subscribers: positional and keyword arguments
pub fn event_payload(args: Vec<Value>, kwargs: Map<String, Value>) -> Value {
    json!({"args": args, "kwargs": kwargs})
}

fn id_at(items: &[Value], index: usize) -> Result<u64, TransportError> {
    items
        .get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::Protocol(format!("expected integer at position {}", index)))
}

fn str_at(items: &[Value], index: usize) -> Result<String, TransportError> {
    items
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TransportError::Protocol(format!("expected string at position {}", index)))
}

fn args_at(items: &[Value], index: usize) -> Vec<Value> {
    items
        .get(index)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn kwargs_at(items: &[Value], index: usize) -> Map<String, Value> {
    items
        .get(index)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
