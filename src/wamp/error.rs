//! Error definitions for the WAMP session bridge

use thiserror::Error;

use super::Role;

/// Errors raised while resolving a publish schedule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Malformed or out-of-range time specification
    #[error("Invalid time specification: {0}")]
    InvalidTimeSpec(String),
}

/// Errors of the session lifecycle and of publish/subscribe requests
///
/// Every variant is recoverable and reported to the immediate caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport or handshake failure, the session never reached `Joined`
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The session exists but is not `Joined`
    #[error("Session is not connected")]
    NotConnected,

    /// No session was started for this role, or it has failed or closed
    #[error("No active session")]
    NoActiveSession,

    /// Publish addressed a realm other than the one the active session joined
    #[error("Active session is bound to realm '{active}', not '{requested}'")]
    RealmMismatch { active: String, requested: String },

    /// A start operation was issued to the supervisor of the other role
    #[error("Supervisor for {supervisor} cannot start a {requested} session")]
    WrongRole { supervisor: Role, requested: Role },

    /// The schedule could not be resolved into a delay
    #[error(transparent)]
    InvalidSchedule(#[from] ScheduleError),

    /// The session thread could not be spawned or terminated abnormally
    #[error("Session thread error: {0}")]
    ThreadError(String),
}

/// Errors reported by a transport implementation
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Failed to connect to router: {0}")]
    Connect(String),

    #[error("Router aborted the join: {0}")]
    Aborted(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The router answered a request with an ERROR message
    #[error("Router rejected the request: {0}")]
    Rejected(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Errors of the realm/topic configuration collaborator
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid realm: {0}")]
    InvalidRealm(String),

    #[error("Invalid router URL '{url}': {reason}")]
    InvalidRouterUrl { url: String, reason: String },

    #[error("Realm '{0}' is not configured")]
    UnknownRealm(String),
}
