//! Capabilities a pooled session needs from its surroundings.
//!
//! These traits are the seams between the state machine and the rest of the
//! system. Sessions receive them at construction, so tests substitute doubles
//! and the pool and timer implementations stay swappable.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::PoolSession;

/// Configuration handed to the manager when a session is reopened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote queue the session is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A plain handle to a remote compute resource.
///
/// Knows nothing about pooling. [`PoolSession`] wraps one and layers state,
/// deadline, and collaborator hooks around it.
#[async_trait]
pub trait RemoteSession: Send + Sync + 'static {
    /// Identifier assigned by the remote side.
    fn remote_id(&self) -> &str;

    /// Open the remote resource, localizing the given resources.
    async fn open(&self, resources: &[String]) -> Result<(), SessionError>;

    /// Close the remote resource.
    async fn close(&self, keep_scratch: bool) -> Result<(), SessionError>;
}

/// The pool that owns sessions and decides who gets which one.
#[async_trait]
pub trait SessionManager<S: RemoteSession>: Send + Sync {
    /// Called once after the session's resource opened.
    fn register_open(&self, session: &Arc<PoolSession<S>>);

    /// Called once when the session closes, whether or not the close succeeded.
    fn unregister_open(&self, session: &PoolSession<S>);

    /// Put a released session back into the pool.
    async fn return_after_use(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError>;

    /// Produce a replacement for `session`.
    async fn reopen(
        &self,
        session: Arc<PoolSession<S>>,
        config: SessionConfig,
        resources: Vec<String>,
    ) -> Result<Arc<PoolSession<S>>, SessionError>;

    /// Drop all bookkeeping for a session being discarded.
    async fn destroy(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError>;
}

/// Time-ordered expiration queue plus the restart machinery behind it.
#[async_trait]
pub trait ExpirationTracker<S: RemoteSession>: Send + Sync {
    /// Track the session by its deadline. Sessions without one are ignored.
    fn enqueue(&self, session: &Arc<PoolSession<S>>);

    /// Stop tracking the session. Unknown sessions are ignored.
    fn dequeue(&self, session: &PoolSession<S>);

    /// Hand an expired session off for close-and-restart without waiting.
    fn schedule_restart(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError>;

    /// Close and replace an expired session before returning.
    async fn close_and_restart(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError>;
}
