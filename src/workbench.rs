//! Caller-facing facade over the two role supervisors
//!
//! `Workbench` is what a UI or the CLI talks to. It keeps one supervisor per
//! role behind an async mutex, so `start_*` and `stop` calls for a role are
//! serialized even when the caller issues them from several tasks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::activity::ActivityLog;
use crate::wamp::config::BenchSettings;
use crate::wamp::supervisor::ConnectionSupervisor;
use crate::wamp::transport::Transport;
use crate::wamp::{
    MessageHandler, Realm, Role, ScheduleSpec, SessionError, SessionState, SessionStatus,
};

/// One realm/topic destination of a batch publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishTarget {
    pub realm: String,
    pub topic: String,
}

impl PublishTarget {
    pub fn new(realm: &str, topic: &str) -> Self {
        Self {
            realm: realm.to_string(),
            topic: topic.to_string(),
        }
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.realm, self.topic)
    }
}

/// One send action, consumed when submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub realm: String,
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub schedule: ScheduleSpec,
}

pub struct Workbench {
    publisher: Mutex<ConnectionSupervisor>,
    subscriber: Mutex<ConnectionSupervisor>,
    activity: ActivityLog,
}

impl Workbench {
    pub fn new(
        transport: Arc<dyn Transport>,
        activity: ActivityLog,
        settings: BenchSettings,
    ) -> Self {
        let publisher = ConnectionSupervisor::new(
            Role::Publisher,
            transport.clone(),
            activity.clone(),
            settings.clone(),
        );
        let subscriber =
            ConnectionSupervisor::new(Role::Subscriber, transport, activity.clone(), settings);

        Self {
            publisher: Mutex::new(publisher),
            subscriber: Mutex::new(subscriber),
            activity,
        }
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub async fn start_publisher(
        &self,
        realm: &Realm,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        self.publisher.lock().await.start_publisher(realm).await
    }

    pub async fn start_subscriber<H: MessageHandler>(
        &self,
        realm: &Realm,
        topics: &[String],
        handler: H,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        self.subscriber
            .lock()
            .await
            .start_subscriber(realm, topics, handler)
            .await
    }

    /// Publishes through the active publisher session, returns the delay in
    /// seconds before the message goes out
    pub async fn publish(
        &self,
        realm: &str,
        topic: &str,
        payload: Value,
        schedule: &ScheduleSpec,
    ) -> Result<u64, SessionError> {
        self.publisher
            .lock()
            .await
            .publish(realm, topic, payload, schedule)
    }

    pub async fn submit(&self, request: PublishRequest) -> Result<u64, SessionError> {
        let PublishRequest {
            realm,
            topic,
            payload,
            schedule,
        } = request;
        self.publish(&realm, &topic, payload, &schedule).await
    }

    /// Sends the same payload to several targets.
    ///
    /// Each target is attempted independently; one failure does not stop the
    /// rest. Results come back in target order.
    pub async fn publish_batch(
        &self,
        targets: &[PublishTarget],
        payload: Value,
        schedule: &ScheduleSpec,
    ) -> Vec<(PublishTarget, Result<u64, SessionError>)> {
        let publisher = self.publisher.lock().await;
        let results: Vec<_> = targets
            .iter()
            .map(|target| {
                let result =
                    publisher.publish(&target.realm, &target.topic, payload.clone(), schedule);
                if let Err(e) = &result {
                    warn!("Batch publish to {} failed: {}", target, e);
                }
                (target.clone(), result)
            })
            .collect();

        info!(
            "Batch publish: {}/{} target(s) accepted",
            results.iter().filter(|(_, r)| r.is_ok()).count(),
            results.len()
        );
        results
    }

    pub async fn publisher_state(&self) -> Option<SessionState> {
        self.publisher.lock().await.current_state()
    }

    pub async fn subscriber_state(&self) -> Option<SessionState> {
        self.subscriber.lock().await.current_state()
    }

    pub async fn stop_publisher(&self) -> Result<(), SessionError> {
        self.publisher.lock().await.stop().await
    }

    pub async fn stop_subscriber(&self) -> Result<(), SessionError> {
        self.subscriber.lock().await.stop().await
    }

    /// Stops both roles; both are attempted even if the first fails
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        info!("Shutting down workbench");
        let publisher = self.stop_publisher().await;
        let subscriber = self.stop_subscriber().await;
        publisher.and(subscriber)
    }
}
