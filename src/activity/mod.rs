//! # Activity Log
//!
//! Record of everything the bridge did on the fabric: connects,
//! disconnects, subscriptions, publishes and received messages. Records feed
//! two consumers, an in-memory table for message viewers and an optional
//! line-oriented audit file written by a background worker.
//!
//! Recording is best-effort. [`ActivityLog::record`] never fails and never
//! waits on I/O; a sink that cannot take a record is reported on the
//! [`ActivityLog::errors`] side channel and in the tracing output, and the
//! publish or subscribe that produced the record carries on.
//!
//! The in-memory table keeps the newest records only; once it holds its
//! capacity the oldest record is evicted for each new one. The audit file
//! keeps everything.

pub mod audit_worker;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::wamp::Role;

const LIVE_CAPACITY: usize = 256;
const ERROR_CAPACITY: usize = 32;

/// Records kept in memory unless a capacity is given
pub const DEFAULT_RETAINED: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Connect,
    Disconnect,
    Subscribe,
    Publish,
    Receive,
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityKind::Connect => "connect",
            ActivityKind::Disconnect => "disconnect",
            ActivityKind::Subscribe => "subscribe",
            ActivityKind::Publish => "publish",
            ActivityKind::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// One entry of the activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub timestamp: DateTime<Local>,
    pub kind: ActivityKind,
    pub role: Role,
    pub realm: String,
    pub topic: String,
    pub payload_text: String,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind, role: Role, realm: &str, topic: &str, payload: &Value) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            role,
            realm: realm.to_string(),
            topic: topic.to_string(),
            payload_text: payload.to_string(),
        }
    }

    /// Audit trail rendering, one record per line, fields separated by ` | `
    pub fn audit_line(&self) -> String {
        format!(
            "{} | {} | {} | {} | {} | {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.role,
            self.kind,
            self.realm,
            self.topic,
            self.payload_text.replace(['\n', '\r'], " ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivityLogError {
    /// A sink could not take a record; the record is still in memory
    #[error("Activity log sink unavailable: {0}")]
    LogSinkUnavailable(String),
}

struct LogInner {
    entries: Mutex<VecDeque<ActivityRecord>>,
    capacity: usize,
    live: broadcast::Sender<ActivityRecord>,
    errors: broadcast::Sender<ActivityLogError>,
    audit: Option<mpsc::UnboundedSender<ActivityRecord>>,
}

/// Shared handle to the activity log; clones append to the same log
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<LogInner>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    /// In-memory log without an audit file
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RETAINED)
    }

    /// In-memory log keeping at most `capacity` records (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(None, capacity).0
    }

    /// Log that also appends every record to `path`, keeping the newest
    /// `capacity` records in memory.
    ///
    /// Spawns the audit worker on the current runtime. The worker stops
    /// once every clone of the log is dropped.
    pub fn with_audit_file(path: impl Into<PathBuf>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();
        let (log, errors) = Self::build(Some(audit_tx), capacity);
        let handle = audit_worker::spawn(path.into(), audit_rx, errors);
        (log, handle)
    }

    fn build(
        audit: Option<mpsc::UnboundedSender<ActivityRecord>>,
        capacity: usize,
    ) -> (Self, broadcast::Sender<ActivityLogError>) {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        let capacity = capacity.max(1);
        let log = Self {
            inner: Arc::new(LogInner {
                entries: Mutex::new(VecDeque::with_capacity(capacity.min(LIVE_CAPACITY))),
                capacity,
                live,
                errors: errors.clone(),
                audit,
            }),
        };
        (log, errors)
    }

    fn entries_guard(&self) -> MutexGuard<'_, VecDeque<ActivityRecord>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a record. Safe to call from any thread.
    pub fn record(&self, record: ActivityRecord) {
        debug!(
            "Activity: {} {} {}/{}",
            record.role, record.kind, record.realm, record.topic
        );

        if let Some(audit) = &self.inner.audit {
            if audit.send(record.clone()).is_err() {
                self.report(ActivityLogError::LogSinkUnavailable(
                    "audit worker is not running".to_string(),
                ));
            }
        }

        // No live viewers is not a failure.
        let _ = self.inner.live.send(record.clone());

        let mut entries = self.entries_guard();
        if entries.len() >= self.inner.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    fn report(&self, error: ActivityLogError) {
        warn!("{}", error);
        let _ = self.inner.errors.send(error);
    }

    /// Snapshot of the retained records in submission order
    pub fn entries(&self) -> Vec<ActivityRecord> {
        self.entries_guard().iter().cloned().collect()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.entries_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries_guard().is_empty()
    }

    /// Empties the in-memory table; the audit file is left untouched
    pub fn clear(&self) {
        self.entries_guard().clear();
    }

    /// Records appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.inner.live.subscribe()
    }

    /// Sink failures reported from now on
    pub fn errors(&self) -> broadcast::Receiver<ActivityLogError> {
        self.inner.errors.subscribe()
    }
}
