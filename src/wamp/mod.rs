//! # WAMP Session Bridge
//!
//! Owns the live connections to a WAMP-style publish/subscribe fabric and
//! bridges them to a caller running on an unrelated thread (a UI loop, the
//! CLI). One connection exists per role: a publisher and a subscriber.
//!
//! ## Module Architecture
//!
//! ```text
//! wamp/
//! ├── config.rs           - Realm/topic configuration and loading
//! ├── error.rs            - Error taxonomy
//! ├── message_manager.rs  - Inbound messages and cross-thread dispatch
//! ├── protocol.rs         - WAMP v2 JSON message subset
//! ├── router.rs           - Topic fan-out for the subscriber role
//! ├── schedule.rs         - Publish delay calculation
//! ├── session.rs          - Session thread, event loop and state machine
//! ├── supervisor.rs       - Single-active-session policy per role
//! └── transport/          - Transport seam, WebSocket and loopback links
//! ```
//!
//! ## Threading
//!
//! ```text
//! Caller ──[SessionCommand]──► Session thread (own tokio runtime)
//!   ▲                               │
//!   └──[InboundMessage]── Dispatcher ◄┘  (subscriber role)
//! ```
//!
//! The caller never touches loop-owned state. Requests are enqueued onto the
//! session's command channel, state is observed through a `watch` channel and
//! inbound events come back through an unbounded FIFO channel.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod protocol;
pub mod router;
pub mod schedule;
pub mod session;
pub mod supervisor;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use config::{Realm, RealmTopicConfig};
pub use error::{ConfigError, ScheduleError, SessionError, TransportError};
pub use message_manager::{InboundMessage, MessageHandler};
pub use schedule::{compute_delay, Hms, ScheduleSpec};
pub use session::{SessionHandle, SessionState, SessionStatus};
pub use supervisor::ConnectionSupervisor;

/// Role a session plays on the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publisher,
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
        }
    }
}
