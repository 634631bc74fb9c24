//! session-pool: lifecycle of pooled, expiring remote execution sessions.
//!
//! A [`PoolSession`] wraps a plain [`RemoteSession`] and adds the pooling
//! state machine (idle, in use, expired), a deadline, and hooks into the
//! [`SessionManager`] that owns it and the [`ExpirationTracker`] that retires
//! it. [`DeadlineTracker`] is a tokio-driven tracker implementation.

mod contract;
mod error;
mod session;
mod state;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod test_support;

pub use contract::{ExpirationTracker, RemoteSession, SessionConfig, SessionManager};
pub use error::SessionError;
pub use session::{PoolSession, RestartMode, SessionId, SessionSnapshot};
pub use state::SessionState;
pub use tracker::{DeadlineTracker, TrackerConfig, TrackerTasks};
