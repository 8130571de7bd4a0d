//! Topic fan-out for the subscriber role
//!
//! The router lives inside the session loop. It registers one subscription
//! per topic on the session's link, and turns every inbound event into an
//! [`InboundMessage`] pushed onto the caller's dispatch channel. Events of one
//! topic leave in the order the link produced them; nothing here reorders.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::message_manager::{InboundMessage, MessageDispatch};
use super::transport::{Link, SubscriptionId};
use super::Role;
use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};

pub struct SubscriptionRouter {
    realm: String,
    routes: HashMap<SubscriptionId, String>,
    dispatch: Option<MessageDispatch>,
    activity: ActivityLog,
}

impl SubscriptionRouter {
    pub fn new(realm: &str, dispatch: Option<MessageDispatch>, activity: ActivityLog) -> Self {
        Self {
            realm: realm.to_string(),
            routes: HashMap::new(),
            dispatch,
            activity,
        }
    }

    /// Subscribes every topic on `link`. Repeated topics are subscribed once.
    ///
    /// Stops at the first rejected topic; subscriptions made so far stay
    /// registered so a following [`detach`](Self::detach) removes them.
    pub async fn attach(
        &mut self,
        link: &mut dyn Link,
        topics: &[String],
    ) -> Result<(), TransportError> {
        for topic in topics {
            if self.routes.values().any(|t| t == topic) {
                debug!("Topic {} already routed", topic);
                continue;
            }
            let subscription = link.subscribe(topic).await?;
            debug!("Subscribed {} as {}", topic, subscription);
            self.routes.insert(subscription, topic.clone());
        }
        info!(
            "Routing {} topic(s) on realm {}",
            self.routes.len(),
            self.realm
        );
        Ok(())
    }

    /// Hands an inbound event to the caller. Returns false for unknown
    /// subscriptions.
    pub fn route(&self, subscription: SubscriptionId, payload: Value) -> bool {
        let Some(topic) = self.routes.get(&subscription) else {
            debug!("Dropping event for unknown subscription {}", subscription);
            return false;
        };

        self.activity.record(ActivityRecord::new(
            ActivityKind::Receive,
            Role::Subscriber,
            &self.realm,
            topic,
            &payload,
        ));

        if let Some(dispatch) = &self.dispatch {
            if dispatch
                .send(InboundMessage::new(&self.realm, topic, payload))
                .is_err()
            {
                warn!("Caller stopped listening, message on {} dropped", topic);
            }
        }
        true
    }

    /// Unregisters all subscriptions. Failures are logged; the link may
    /// already be gone.
    pub async fn detach(&mut self, link: &mut dyn Link) {
        for (subscription, topic) in self.routes.drain() {
            if let Err(e) = link.unsubscribe(subscription).await {
                debug!("Unsubscribe of {} failed: {}", topic, e);
            }
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.values().cloned().collect();
        topics.sort();
        topics
    }
}
