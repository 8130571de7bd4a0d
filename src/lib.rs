//! Headless publish/subscribe workbench for WAMP routers.
//!
//! The [`workbench::Workbench`] facade drives one publisher and one
//! subscriber session, each on its own thread, and records everything it
//! does in an [`activity::ActivityLog`].

pub mod activity;
pub mod wamp;
pub mod workbench;

pub use workbench::{PublishRequest, PublishTarget, Workbench};
