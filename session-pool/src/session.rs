//! PoolSession - a remote session that knows it lives in a pool.
//!
//! Three states: Idle (in the pool), InUse (checked out), Expired (terminal).
//! A caller taking the session, the caller handing it back, and the
//! expiration timer all compete to move it out of Idle. The state cell
//! decides the winner:
//! - acquire: Idle -> InUse, or Idle -> Expired if the deadline has passed
//! - release: InUse -> Idle, or InUse -> Expired if the deadline has passed
//! - expire:  Idle -> Expired; an InUse session is left for its release
//!
//! Whoever moves the session into Expired triggers exactly one
//! close-and-restart through the tracker. Collaborator calls never happen
//! while any lock is held.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::contract::{ExpirationTracker, RemoteSession, SessionConfig, SessionManager};
use crate::error::SessionError;
use crate::state::{SessionState, StateCell};

/// Unique identifier for a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the retiring actor wants close-and-restart to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMode {
    /// Hand off to the tracker and return immediately.
    Background,
    /// Wait for the restart to finish.
    Inline,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub remote_id: String,
    pub state: SessionState,
    /// Milliseconds until the deadline; negative once it has passed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_ms: Option<i64>,
}

/// Pooling wrapper around a [`RemoteSession`].
pub struct PoolSession<S: RemoteSession> {
    id: SessionId,
    inner: S,
    config: SessionConfig,
    state: StateCell,
    deadline: StdMutex<Option<Instant>>,
    closing: AtomicBool,
    manager: Weak<dyn SessionManager<S>>,
    tracker: Option<Weak<dyn ExpirationTracker<S>>>,
}

impl<S: RemoteSession> PoolSession<S> {
    pub fn new(inner: S, config: SessionConfig, manager: Weak<dyn SessionManager<S>>) -> Self {
        Self {
            id: SessionId::new(),
            inner,
            config,
            state: StateCell::new(),
            deadline: StdMutex::new(None),
            closing: AtomicBool::new(false),
            manager,
            tracker: None,
        }
    }

    /// Attach the expiration tracker. Without one the session is never
    /// enqueued and nothing restarts it when it expires.
    pub fn with_tracker(mut self, tracker: Weak<dyn ExpirationTracker<S>>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.lock_deadline()
    }

    /// Set the deadline. Meant to be called once, before the session opens.
    pub fn set_deadline(&self, deadline: Instant) {
        *self.lock_deadline() = Some(deadline);
    }

    pub fn belongs_to<M: SessionManager<S> + ?Sized>(&self, manager: &Arc<M>) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|own| std::ptr::addr_eq(Arc::as_ptr(&own), Arc::as_ptr(manager)))
    }

    /// Open the remote resource, then register with the manager and tracker.
    pub async fn open(self: &Arc<Self>, resources: &[String]) -> Result<(), SessionError> {
        let manager = self.manager()?;
        self.inner.open(resources).await?;

        manager.register_open(self);
        if let Some(tracker) = self.tracker() {
            tracker.enqueue(self);
        }

        tracing::debug!(
            session = %self.id,
            remote_id = self.inner.remote_id(),
            deadline_ms = ?self.expires_in_ms(),
            "Session opened"
        );
        Ok(())
    }

    /// Close the remote resource.
    ///
    /// Manager and tracker bookkeeping is removed on every exit path, even
    /// when the close fails or the future is dropped part way.
    pub async fn close(&self, keep_scratch: bool) -> Result<(), SessionError> {
        self.closing.store(true, Ordering::Release);
        let _cleanup = CloseCleanup { session: self };
        self.inner.close(keep_scratch).await
    }

    /// Try to take the session for use.
    ///
    /// Returns `Ok(false)` when the session has expired (now or earlier); the
    /// caller must get a different one.
    ///
    /// # Panics
    ///
    /// If the session is already in use.
    pub fn acquire(self: &Arc<Self>) -> Result<bool, SessionError> {
        loop {
            let target = match self.state.load() {
                SessionState::InUse => panic!("{self} is already in use"),
                SessionState::Expired => return Ok(false),
                SessionState::Idle if self.should_expire() => SessionState::Expired,
                SessionState::Idle => SessionState::InUse,
            };

            if self.state.transition(SessionState::Idle, target).is_err() {
                continue;
            }

            if target == SessionState::InUse {
                return Ok(true);
            }

            tracing::info!(session = %self.id, "Session deadline passed at acquire; retiring");
            self.schedule_restart()?;
            return Ok(false);
        }
    }

    /// Stop using the session.
    ///
    /// Returns `Ok(true)` if it may go back to the pool, `Ok(false)` if its
    /// deadline passed while in use and it is being retired instead.
    ///
    /// # Panics
    ///
    /// If the session is not in use.
    pub fn release(self: &Arc<Self>) -> Result<bool, SessionError> {
        let target = if self.should_expire() {
            SessionState::Expired
        } else {
            SessionState::Idle
        };

        if let Err(actual) = self.state.transition(SessionState::InUse, target) {
            panic!("{self} released while not in use; currently {actual}");
        }

        if target == SessionState::Idle {
            return Ok(true);
        }

        tracing::info!(session = %self.id, "Session deadline passed during use; retiring");
        self.schedule_restart()?;
        Ok(false)
    }

    /// Enforce the deadline from the expiration timer.
    ///
    /// Returns `Ok(true)` if the deadline has been or will be enforced (or
    /// there is none), `Ok(false)` if it has not passed yet.
    pub async fn expire(self: &Arc<Self>, mode: RestartMode) -> Result<bool, SessionError> {
        if self.deadline().is_none() {
            return Ok(true);
        }
        if !self.should_expire() {
            return Ok(false);
        }
        if self.closing.load(Ordering::Acquire) {
            tracing::debug!(session = %self.id, "Ignoring expiration of a closed session");
            return Ok(true);
        }

        loop {
            // InUse: release() will retire it. Expired: already handled.
            if self.state.load() != SessionState::Idle {
                return Ok(true);
            }
            if self
                .state
                .transition(SessionState::Idle, SessionState::Expired)
                .is_ok()
            {
                tracing::info!(session = %self.id, ?mode, "Idle session deadline passed; retiring");
                self.retire(mode).await?;
                return Ok(true);
            }
        }
    }

    /// Hand the session back to its manager's pool.
    pub async fn return_to_manager(self: &Arc<Self>) -> Result<(), SessionError> {
        self.manager()?.return_after_use(Arc::clone(self)).await
    }

    /// Ask the manager for a replacement session.
    pub async fn reopen(
        self: &Arc<Self>,
        config: SessionConfig,
        resources: Vec<String>,
    ) -> Result<Arc<Self>, SessionError> {
        self.manager()?
            .reopen(Arc::clone(self), config, resources)
            .await
    }

    pub async fn destroy(self: &Arc<Self>) -> Result<(), SessionError> {
        self.manager()?.destroy(Arc::clone(self)).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            remote_id: self.inner.remote_id().to_string(),
            state: self.state(),
            expires_in_ms: self.expires_in_ms(),
        }
    }

    fn should_expire(&self) -> bool {
        self.deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn expires_in_ms(&self) -> Option<i64> {
        let deadline = self.deadline()?;
        let now = Instant::now();
        Some(match deadline.checked_duration_since(now) {
            Some(left) => i64::try_from(left.as_millis()).unwrap_or(i64::MAX),
            None => -i64::try_from(now.duration_since(deadline).as_millis()).unwrap_or(i64::MAX),
        })
    }

    fn lock_deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        // The guarded value is Copy and written whole; a poisoned lock still holds a valid one.
        self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn manager(&self) -> Result<Arc<dyn SessionManager<S>>, SessionError> {
        self.manager.upgrade().ok_or(SessionError::ManagerGone)
    }

    fn tracker(&self) -> Option<Arc<dyn ExpirationTracker<S>>> {
        self.tracker.as_ref().and_then(Weak::upgrade)
    }

    /// Restart path for acquire/release: never blocks the caller.
    fn schedule_restart(self: &Arc<Self>) -> Result<(), SessionError> {
        match self.tracker() {
            Some(tracker) => tracker.schedule_restart(Arc::clone(self)),
            None => {
                tracing::warn!(session = %self.id, "Session expired with no tracker to restart it");
                Ok(())
            }
        }
    }

    async fn retire(self: &Arc<Self>, mode: RestartMode) -> Result<(), SessionError> {
        match mode {
            RestartMode::Background => self.schedule_restart(),
            RestartMode::Inline => match self.tracker() {
                Some(tracker) => tracker.close_and_restart(Arc::clone(self)).await,
                None => self.schedule_restart(),
            },
        }
    }
}

impl<S: RemoteSession> fmt::Display for PoolSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} ({})", self.id, self.inner.remote_id())?;
        if let Some(ms) = self.expires_in_ms() {
            write!(f, ", expires in {ms}ms")?;
        }
        Ok(())
    }
}

impl<S: RemoteSession> fmt::Debug for PoolSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSession")
            .field("id", &self.id)
            .field("remote_id", &self.inner.remote_id())
            .field("state", &self.state())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Runs close-time de-registration on drop.
struct CloseCleanup<'a, S: RemoteSession> {
    session: &'a PoolSession<S>,
}

impl<S: RemoteSession> Drop for CloseCleanup<'_, S> {
    fn drop(&mut self) {
        if let Some(manager) = self.session.manager.upgrade() {
            manager.unregister_open(self.session);
        }
        if let Some(tracker) = self.session.tracker() {
            tracker.dequeue(self.session);
        }
        tracing::debug!(session = %self.session.id, "Session closed");
    }
}
