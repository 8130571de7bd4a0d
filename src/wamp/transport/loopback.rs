//! In-process router for offline runs
//!
//! Routes publications to subscribers of the same realm and topic without a
//! network. It also keeps a record of every publication it accepted, which
//! makes it the transport of choice for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use super::{JoinedLink, Link, SubscriptionId, Transport, TransportEvent};
use crate::wamp::error::TransportError;
use crate::wamp::protocol::{event_payload, WireMessage};

const NO_SUCH_REALM: &str = "wamp.error.no_such_realm";

/// A publication the loopback router accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub realm: String,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Local>,
}

struct AttachedSession {
    realm: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashMap<SubscriptionId, String>,
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    refused_realms: HashSet<String>,
    sessions: HashMap<u64, AttachedSession>,
    publications: Vec<Publication>,
}

impl RouterState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Delivers to every subscription on `realm`/`topic`, returns the count
    fn route(&self, realm: &str, topic: &str, payload: &Value) -> usize {
        let payload = match WireMessage::publish(0, topic, payload) {
            WireMessage::Publish { args, kwargs, .. } => event_payload(args, kwargs),
            _ => payload.clone(),
        };

        let mut delivered = 0;
        for session in self.sessions.values().filter(|s| s.realm == realm) {
            for (id, subscribed) in &session.subscriptions {
                if subscribed == topic {
                    let event = TransportEvent::Event {
                        subscription: *id,
                        payload: payload.clone(),
                    };
                    if session.events.send(event).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }
}

/// Shared in-process router; clones refer to the same router
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<RouterState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        lock(&self.state)
    }

    /// Makes joins to `realm` fail the way a router without that realm does
    pub fn refuse_realm(&self, realm: &str) {
        self.state().refused_realms.insert(realm.to_string());
    }

    /// Publications accepted so far, in arrival order
    pub fn publications(&self) -> Vec<Publication> {
        self.state().publications.clone()
    }

    /// Number of sessions currently joined to `realm`
    pub fn joined_sessions(&self, realm: &str) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|s| s.realm == realm)
            .count()
    }

    /// Delivers a publication from outside the bridge to local subscribers
    pub fn inject(&self, realm: &str, topic: &str, payload: Value) -> usize {
        self.state().route(realm, topic, &payload)
    }

    /// Drops every joined session as if the router went away
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.state();
        for (id, session) in state.sessions.drain() {
            debug!("Loopback router dropping session {}", id);
            let _ = session
                .events
                .send(TransportEvent::Closed(reason.to_string()));
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn join(&self, realm: &str, router_url: &Url) -> Result<JoinedLink, TransportError> {
        let mut state = self.state();
        if state.refused_realms.contains(realm) {
            return Err(TransportError::Aborted(NO_SUCH_REALM.to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session_id = state.next_id();
        state.sessions.insert(
            session_id,
            AttachedSession {
                realm: realm.to_string(),
                events: events_tx,
                subscriptions: HashMap::new(),
            },
        );
        info!(
            "Loopback session {} joined realm {} ({})",
            session_id, realm, router_url
        );

        Ok(JoinedLink {
            link: Box::new(LoopbackLink {
                session_id,
                realm: realm.to_string(),
                state: self.state.clone(),
            }),
            events: events_rx,
        })
    }
}

struct LoopbackLink {
    session_id: u64,
    realm: String,
    state: Arc<Mutex<RouterState>>,
}

impl LoopbackLink {
    fn closed(&self) -> TransportError {
        TransportError::Closed(format!("loopback session {} has left", self.session_id))
    }
}

#[async_trait]
impl Link for LoopbackLink {
    async fn publish(&mut self, topic: &str, payload: &Value) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.sessions.contains_key(&self.session_id) {
            return Err(self.closed());
        }

        state.publications.push(Publication {
            realm: self.realm.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            timestamp: Local::now(),
        });
        let delivered = state.route(&self.realm, topic, payload);
        debug!("Loopback publish on {} reached {} subscriber(s)", topic, delivered);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<SubscriptionId, TransportError> {
        let mut state = lock(&self.state);
        let id = state.next_id();
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| self.closed())?;
        session.subscriptions.insert(id, topic.to_string());
        Ok(id)
    }

    async fn unsubscribe(&mut self, subscription: SubscriptionId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| self.closed())?;
        session.subscriptions.remove(&subscription);
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), TransportError> {
        if lock(&self.state).sessions.remove(&self.session_id).is_some() {
            debug!("Loopback session {} left", self.session_id);
        }
        Ok(())
    }
}

fn lock(state: &Mutex<RouterState>) -> MutexGuard<'_, RouterState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
