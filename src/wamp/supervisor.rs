//! Single-active-session policy per role
//!
//! A supervisor owns at most one [`SessionHandle`]. Starting a new session
//! first closes the previous one and waits until it is `Closed` and its
//! thread is gone, so two sessions of the same role are never reachable at
//! the same time.

use chrono::Local;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::{BenchSettings, Realm};
use super::error::SessionError;
use super::message_manager::{spawn_dispatcher, MessageHandler};
use super::schedule::{compute_delay, ScheduleSpec};
use super::session::{OpenRequest, SessionHandle, SessionState, SessionStatus};
use super::transport::Transport;
use super::Role;
use crate::activity::{ActivityKind, ActivityLog, ActivityRecord};

pub struct ConnectionSupervisor {
    role: Role,
    transport: Arc<dyn Transport>,
    activity: ActivityLog,
    settings: BenchSettings,
    session: Option<SessionHandle>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        activity: ActivityLog,
        settings: BenchSettings,
    ) -> Self {
        Self {
            role,
            transport,
            activity,
            settings,
            session: None,
            dispatcher: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Realm of the current session, if one is held
    pub fn active_realm(&self) -> Option<&Realm> {
        self.session.as_ref().map(|session| session.realm())
    }

    pub fn current_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|session| session.state())
    }

    pub fn status(&self) -> Option<watch::Receiver<SessionStatus>> {
        self.session.as_ref().map(|session| session.status())
    }

    fn ensure_role(&self, requested: Role) -> Result<(), SessionError> {
        if self.role != requested {
            return Err(SessionError::WrongRole {
                supervisor: self.role,
                requested,
            });
        }
        Ok(())
    }

    /// Replaces the current session with a publisher joined to `realm`.
    pub async fn start_publisher(
        &mut self,
        realm: &Realm,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        self.ensure_role(Role::Publisher)?;
        self.stop().await?;

        let request = OpenRequest {
            role: Role::Publisher,
            realm: realm.clone(),
            topics: Vec::new(),
            join_timeout: self.settings.join_timeout(),
        };
        let session =
            SessionHandle::open(request, self.transport.clone(), self.activity.clone(), None)
                .await?;

        self.record(ActivityKind::Connect, realm.name(), "", &connect_payload(realm));
        info!("Publisher ready on {}", realm);
        Ok(self.install(session, None))
    }

    /// Replaces the current session with a subscriber joined to `realm`.
    ///
    /// Every topic is subscribed before this returns. `handler` runs on a
    /// dispatcher task of the calling runtime, one message at a time.
    pub async fn start_subscriber<H: MessageHandler>(
        &mut self,
        realm: &Realm,
        topics: &[String],
        handler: H,
    ) -> Result<watch::Receiver<SessionStatus>, SessionError> {
        self.ensure_role(Role::Subscriber)?;
        self.stop().await?;

        let (dispatch, dispatcher) = spawn_dispatcher(handler);
        let request = OpenRequest {
            role: Role::Subscriber,
            realm: realm.clone(),
            topics: topics.to_vec(),
            join_timeout: self.settings.join_timeout(),
        };
        let opened = SessionHandle::open(
            request,
            self.transport.clone(),
            self.activity.clone(),
            Some(dispatch),
        )
        .await;

        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                // The session thread dropped its dispatch sender on exit.
                if let Err(join_err) = dispatcher.await {
                    warn!("Dispatcher ended abnormally: {}", join_err);
                }
                return Err(e);
            }
        };

        self.record(ActivityKind::Connect, realm.name(), "", &connect_payload(realm));
        let mut subscribed: Vec<&String> = Vec::new();
        for topic in topics {
            if subscribed.contains(&topic) {
                continue;
            }
            self.record(ActivityKind::Subscribe, realm.name(), topic, &Value::Null);
            subscribed.push(topic);
        }
        info!(
            "Subscriber ready on {} with {} topic(s)",
            realm,
            subscribed.len()
        );
        Ok(self.install(session, Some(dispatcher)))
    }

    fn install(
        &mut self,
        session: SessionHandle,
        dispatcher: Option<JoinHandle<()>>,
    ) -> watch::Receiver<SessionStatus> {
        let status = session.status();
        self.session = Some(session);
        self.dispatcher = dispatcher;
        status
    }

    /// Resolves the schedule and hands the publish to the session loop.
    ///
    /// Returns the resolved delay in seconds. The activity record is written
    /// at submission, before the message reaches the wire.
    pub fn publish(
        &self,
        realm: &str,
        topic: &str,
        payload: Value,
        schedule: &ScheduleSpec,
    ) -> Result<u64, SessionError> {
        self.ensure_role(Role::Publisher)?;

        let session = self
            .session
            .as_ref()
            .filter(|session| session.state() == SessionState::Joined)
            .ok_or(SessionError::NoActiveSession)?;

        if session.realm().name() != realm {
            return Err(SessionError::RealmMismatch {
                active: session.realm().name().to_string(),
                requested: realm.to_string(),
            });
        }

        let delay = compute_delay(schedule, Local::now().naive_local())?;
        session.publish_at(topic, payload.clone(), delay)?;
        debug!("Publish on {}/{} accepted, delay {}s", realm, topic, delay);

        self.record(ActivityKind::Publish, realm, topic, &payload);
        Ok(delay)
    }

    /// Closes the current session. Safe to call when none exists.
    ///
    /// For a subscriber, the dispatcher has delivered its last message when
    /// this returns.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let realm = session.realm().clone();
        info!("Stopping {} session on {}", self.role, realm.name());
        let closed = session.close().await;

        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!("Dispatcher ended abnormally: {}", e);
            }
        }

        self.record(ActivityKind::Disconnect, realm.name(), "", &Value::Null);
        closed
    }

    fn record(&self, kind: ActivityKind, realm: &str, topic: &str, payload: &Value) {
        self.activity
            .record(ActivityRecord::new(kind, self.role, realm, topic, payload));
    }
}

fn connect_payload(realm: &Realm) -> Value {
    json!({ "router_url": realm.router_url().as_str() })
}
