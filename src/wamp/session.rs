//! Session thread, event loop and lifecycle
//!
//! Every session runs on its own OS thread with its own current-thread tokio
//! runtime. The loop owns the transport link; the outside world only holds a
//! [`SessionHandle`], which enqueues commands and observes a `watch` of the
//! session status.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──► Joined ──► Leaving ──► Closed
//!     │
//!     └──► ConnectFailed (terminal)
//! ```
//!
//! Inside the loop the phases are statum typestates, so a publish can only
//! be delivered by a `WampSession<Joined>`.

use chrono::{DateTime, Local};
use serde_json::Value;
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::Realm;
use super::error::SessionError;
use super::message_manager::MessageDispatch;
use super::router::SubscriptionRouter;
use super::transport::{JoinedLink, Link, SubscriptionId, Transport, TransportEvent};
use super::Role;
use crate::activity::ActivityLog;

/// Observable lifecycle state of a session
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Connecting,
    Joined,
    Leaving,
    Closed,
    ConnectFailed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Joined => write!(f, "joined"),
            SessionState::Leaving => write!(f, "leaving"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
        }
    }
}

/// Snapshot of a session as seen by the caller
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub role: Role,
    pub realm: String,
    pub state: SessionState,
    /// Failures that happened after the triggering call had returned,
    /// e.g. a delayed publish the link refused
    pub error_messages: Vec<String>,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl SessionStatus {
    fn new(role: Role, realm: &str) -> Self {
        Self {
            role,
            realm: realm.to_string(),
            state: SessionState::Connecting,
            error_messages: Vec::new(),
            messages_sent: 0,
            messages_received: 0,
            last_activity: None,
        }
    }
}

/// Everything needed to open a session
#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub role: Role,
    pub realm: Realm,
    /// Topics routed at join time, subscriber role only
    pub topics: Vec<String>,
    pub join_timeout: Duration,
}

enum SessionCommand {
    Publish {
        topic: String,
        payload: Value,
        delay: Duration,
    },
    Leave,
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Connecting,
    Joined,
    Leaving,
    Closed,
}

#[machine]
pub struct WampSession<S: SessionPhase> {
    request: OpenRequest,
    transport: Arc<dyn Transport>,
    status: watch::Sender<SessionStatus>,
    router: SubscriptionRouter,
    link: Option<Box<dyn Link>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    scheduled: CancellationToken,
}

impl<S: SessionPhase> WampSession<S> {
    fn set_state(&self, state: SessionState) {
        debug!(
            "{} session on {} is now {}",
            self.request.role,
            self.request.realm.name(),
            state
        );
        self.status.send_modify(|status| status.state = state);
    }

    fn push_error(&self, message: String) {
        self.status
            .send_modify(|status| status.error_messages.push(message));
    }

    /// Unsubscribes and says GOODBYE. Unsubscribing gets the join timeout,
    /// a router that stays silent only costs that long.
    async fn release(&mut self, link: &mut dyn Link) {
        if timeout(self.request.join_timeout, self.router.detach(link))
            .await
            .is_err()
        {
            warn!(
                "Unsubscribe on {} did not finish within {:?}",
                self.request.realm.name(),
                self.request.join_timeout
            );
        }
        if let Err(e) = link.leave().await {
            warn!("Graceful leave failed: {}", e);
        }
    }
}

impl WampSession<Connecting> {
    fn create(
        request: OpenRequest,
        transport: Arc<dyn Transport>,
        status: watch::Sender<SessionStatus>,
        activity: ActivityLog,
        dispatch: Option<MessageDispatch>,
    ) -> Self {
        let router = SubscriptionRouter::new(request.realm.name(), dispatch, activity);
        Self::new(
            request,
            transport,
            status,
            router,
            None,                     // link
            None,                     // events
            CancellationToken::new(), // scheduled
        )
    }

    /// Performs the join handshake and, for subscribers, registers every
    /// topic before the session counts as joined.
    async fn join(mut self) -> Result<WampSession<Joined>, String> {
        let realm = self.request.realm.clone();
        info!(
            "Opening {} session on realm {} at {}",
            self.request.role,
            realm.name(),
            realm.router_url()
        );

        let joined = timeout(
            self.request.join_timeout,
            self.transport.join(realm.name(), realm.router_url()),
        )
        .await;

        let JoinedLink { mut link, events } = match joined {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => return Err(self.fail(e.to_string())),
            Err(_) => {
                return Err(self.fail(format!(
                    "join handshake did not finish within {:?}",
                    self.request.join_timeout
                )))
            }
        };

        if self.request.role == Role::Subscriber {
            let attached = timeout(
                self.request.join_timeout,
                self.router.attach(link.as_mut(), &self.request.topics),
            )
            .await;
            let failure = match attached {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("subscribe failed: {}", e)),
                Err(_) => Some(format!(
                    "subscribe did not finish within {:?}",
                    self.request.join_timeout
                )),
            };
            if let Some(reason) = failure {
                let reason = self.fail(reason);
                self.release(link.as_mut()).await;
                return Err(reason);
            }
        }

        self.link = Some(link);
        self.events = Some(events);
        self.status.send_modify(|status| {
            status.state = SessionState::Joined;
            status.last_activity = Some(Local::now());
        });
        info!("Session joined realm {}", realm.name());
        Ok(self.transition())
    }

    fn fail(&self, reason: String) -> String {
        error!(
            "{} session on {} failed to connect: {}",
            self.request.role,
            self.request.realm.name(),
            reason
        );
        self.set_state(SessionState::ConnectFailed(reason.clone()));
        reason
    }
}

impl WampSession<Joined> {
    /// Serves commands and inbound events until asked to leave or the
    /// link goes away.
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> WampSession<Leaving> {
        let Some(mut events) = self.events.take() else {
            warn!("Joined session without an event stream");
            self.set_state(SessionState::Leaving);
            return self.transition();
        };
        let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel::<(String, Value)>();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Publish { topic, payload, delay }) => {
                        if delay.is_zero() {
                            self.deliver(&topic, &payload).await;
                        } else {
                            self.schedule(topic, payload, delay, deliver_tx.clone());
                        }
                    }
                    Some(SessionCommand::Leave) => {
                        info!("Leave requested for realm {}", self.request.realm.name());
                        // Events already received are still handed out.
                        while let Ok(TransportEvent::Event { subscription, payload }) = events.try_recv() {
                            self.receive(subscription, payload);
                        }
                        break;
                    }
                    None => {
                        warn!("Session handle dropped without closing");
                        break;
                    }
                },
                Some((topic, payload)) = deliver_rx.recv() => {
                    self.deliver(&topic, &payload).await;
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Event { subscription, payload }) => {
                        self.receive(subscription, payload);
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        warn!("Router ended the session: {}", reason);
                        self.push_error(format!("connection lost: {}", reason));
                        break;
                    }
                    None => {
                        warn!("Transport event stream ended");
                        self.push_error("connection lost".to_string());
                        break;
                    }
                }
            }
        }

        self.set_state(SessionState::Leaving);
        self.scheduled.cancel();
        self.transition()
    }

    fn receive(&self, subscription: SubscriptionId, payload: Value) {
        if self.router.route(subscription, payload) {
            self.status.send_modify(|status| {
                status.messages_received += 1;
                status.last_activity = Some(Local::now());
            });
        }
    }

    fn schedule(
        &self,
        topic: String,
        payload: Value,
        delay: Duration,
        deliver: mpsc::UnboundedSender<(String, Value)>,
    ) {
        debug!("Publish on {} scheduled in {:?}", topic, delay);
        let cancelled = self.scheduled.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("Scheduled publish on {} dropped, session is leaving", topic);
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = deliver.send((topic, payload));
                }
            }
        });
    }

    async fn deliver(&mut self, topic: &str, payload: &Value) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match link.publish(topic, payload).await {
            Ok(()) => {
                info!(
                    "Published on {}/{}",
                    self.request.realm.name(),
                    topic
                );
                self.status.send_modify(|status| {
                    status.messages_sent += 1;
                    status.last_activity = Some(Local::now());
                });
            }
            Err(e) => {
                error!("Publish on {} failed: {}", topic, e);
                self.push_error(format!("publish on {} failed: {}", topic, e));
            }
        }
    }
}

impl WampSession<Leaving> {
    /// Unregisters subscriptions and leaves the realm
    async fn leave(mut self) -> WampSession<Closed> {
        if let Some(mut link) = self.link.take() {
            self.release(link.as_mut()).await;
        }
        self.set_state(SessionState::Closed);
        info!(
            "{} session on {} closed",
            self.request.role,
            self.request.realm.name()
        );
        self.transition()
    }
}

async fn drive(
    session: WampSession<Connecting>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    ready: oneshot::Sender<Result<(), SessionError>>,
) {
    let joined = match session.join().await {
        Ok(joined) => joined,
        Err(reason) => {
            let _ = ready.send(Err(SessionError::ConnectFailed(reason)));
            return;
        }
    };

    let leaving = if ready.send(Ok(())).is_err() {
        warn!("Opener went away before the join completed");
        joined.set_state(SessionState::Leaving);
        joined.transition()
    } else {
        joined.run(commands).await
    };

    let _closed = leaving.leave().await;
}

fn run_session_thread(
    request: OpenRequest,
    transport: Arc<dyn Transport>,
    status: watch::Sender<SessionStatus>,
    activity: ActivityLog,
    dispatch: Option<MessageDispatch>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    ready: oneshot::Sender<Result<(), SessionError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build session runtime: {}", e);
            status.send_modify(|s| s.state = SessionState::ConnectFailed(e.to_string()));
            let _ = ready.send(Err(SessionError::ThreadError(e.to_string())));
            return;
        }
    };

    let session = WampSession::create(request, transport, status, activity, dispatch);
    runtime.block_on(drive(session, commands, ready));
    debug!("Session thread finished");
}

/// Caller-side handle of one live session
///
/// Owns the session thread. All methods are safe to call from any thread;
/// none of them touches loop-owned state directly.
pub struct SessionHandle {
    role: Role,
    realm: Realm,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Spawns the session thread and waits for the join handshake.
    ///
    /// # Errors
    ///
    /// * [`SessionError::ConnectFailed`] - transport or handshake failure,
    ///   or a topic the router refused; the thread has exited when this
    ///   returns
    /// * [`SessionError::ThreadError`] - the thread could not be spawned or
    ///   died before reporting
    pub async fn open(
        request: OpenRequest,
        transport: Arc<dyn Transport>,
        activity: ActivityLog,
        dispatch: Option<MessageDispatch>,
    ) -> Result<Self, SessionError> {
        let role = request.role;
        let realm = request.realm.clone();

        let (status_tx, status_rx) = watch::channel(SessionStatus::new(role, realm.name()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("wamp-{}-{}", role, realm.name()))
            .spawn(move || {
                run_session_thread(
                    request,
                    transport,
                    status_tx,
                    activity,
                    dispatch,
                    commands_rx,
                    ready_tx,
                )
            })
            .map_err(|e| SessionError::ThreadError(e.to_string()))?;
        debug!("Spawned session thread for {} on {}", role, realm.name());

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                role,
                realm,
                commands: commands_tx,
                status: status_rx,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                join_thread(thread).await?;
                Err(e)
            }
            Err(_) => {
                join_thread(thread).await?;
                Err(SessionError::ThreadError(
                    "session thread exited before the join completed".to_string(),
                ))
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state.clone()
    }

    /// Receiver for status updates, usable from any thread
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Schedules a send on the session's own loop.
    ///
    /// Returns as soon as the request is enqueued. Each request waits out its
    /// own delay, so a later zero-delay publish may reach the wire before an
    /// earlier delayed one.
    pub fn publish_at(
        &self,
        topic: &str,
        payload: Value,
        delay_secs: u64,
    ) -> Result<(), SessionError> {
        if self.state() != SessionState::Joined {
            return Err(SessionError::NotConnected);
        }

        self.commands
            .send(SessionCommand::Publish {
                topic: topic.to_string(),
                payload,
                delay: Duration::from_secs(delay_secs),
            })
            .map_err(|_| SessionError::NotConnected)
    }

    /// Leaves the realm and tears the session thread down.
    ///
    /// When this returns the state is `Closed` and the thread is gone.
    /// Closing a closed session is a no-op.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let Some(thread) = self.thread.take() else {
            debug!("Session on {} already closed", self.realm.name());
            return Ok(());
        };

        if self.commands.send(SessionCommand::Leave).is_err() {
            debug!("Session loop on {} already stopped", self.realm.name());
        }
        join_thread(thread).await
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!(
                "Session on {} dropped while open, requesting leave",
                self.realm.name()
            );
            let _ = self.commands.send(SessionCommand::Leave);
        }
    }
}

async fn join_thread(thread: thread::JoinHandle<()>) -> Result<(), SessionError> {
    tokio::task::spawn_blocking(move || thread.join())
        .await
        .map_err(|e| SessionError::ThreadError(e.to_string()))?
        .map_err(|_| SessionError::ThreadError("session thread panicked".to_string()))
}
