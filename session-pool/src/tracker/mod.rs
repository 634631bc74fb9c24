//! DeadlineTracker - time-ordered expiration and restart of pooled sessions.
//!
//! Two background tasks:
//! - expiry loop: sleeps until the earliest deadline, then calls
//!   `expire(RestartMode::Background)` on every due session
//! - restart worker: closes expired sessions and asks their manager for a
//!   replacement, so neither callers nor the timer wait on remote teardown
//!
//! Sessions enter the queue when they open and leave it when they close.

mod queue;

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::contract::{ExpirationTracker, RemoteSession};
use crate::error::SessionError;
use crate::session::{PoolSession, RestartMode, SessionId};
use queue::ExpirationQueue;

const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(162 * 60 * 60);
const DEFAULT_LIFETIME_JITTER: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Base lifetime given to each session.
    pub session_lifetime: Duration,
    /// Upper bound of the per-session spread added to the lifetime, so
    /// sessions opened together do not all expire together.
    pub lifetime_jitter: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

impl TrackerConfig {
    /// Build from `SESSION_POOL_LIFETIME_SECS` and
    /// `SESSION_POOL_LIFETIME_JITTER_SECS` as returned by `lookup`.
    /// Missing or invalid values use the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            session_lifetime: parse_secs(lookup("SESSION_POOL_LIFETIME_SECS"))
                .unwrap_or(DEFAULT_SESSION_LIFETIME),
            lifetime_jitter: parse_secs(lookup("SESSION_POOL_LIFETIME_JITTER_SECS"))
                .unwrap_or(DEFAULT_LIFETIME_JITTER),
        }
    }

    pub fn with_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.session_lifetime = lifetime;
        self
    }

    pub fn with_lifetime_jitter(mut self, jitter: Duration) -> Self {
        self.lifetime_jitter = jitter;
        self
    }
}

fn parse_secs(value: Option<String>) -> Option<Duration> {
    let secs = value?.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Handles to the tracker's background tasks.
pub struct TrackerTasks {
    expiry: JoinHandle<()>,
    restarts: JoinHandle<()>,
}

impl TrackerTasks {
    /// Wait for both tasks to finish (after [`DeadlineTracker::shutdown`]).
    pub async fn join(self) {
        for (task, handle) in [("expiry", self.expiry), ("restart", self.restarts)] {
            if let Err(e) = handle.await {
                tracing::error!(task, error = %e, "Tracker task failed");
            }
        }
    }
}

/// Expiration tracker driven by tokio timers.
pub struct DeadlineTracker<S: RemoteSession> {
    config: TrackerConfig,
    queue: StdMutex<ExpirationQueue<S>>,
    queue_changed: Notify,
    restart_tx: mpsc::UnboundedSender<Arc<PoolSession<S>>>,
    restart_rx: StdMutex<Option<mpsc::UnboundedReceiver<Arc<PoolSession<S>>>>>,
    shutdown: CancellationToken,
}

impl<S: RemoteSession> DeadlineTracker<S> {
    pub fn new(config: TrackerConfig) -> Arc<Self> {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            queue: StdMutex::new(ExpirationQueue::new()),
            queue_changed: Notify::new(),
            restart_tx,
            restart_rx: StdMutex::new(Some(restart_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Deadline for a session created now: lifetime plus a jitter derived
    /// from the session's random id. `None` when the sum does not fit in an
    /// `Instant`.
    pub fn deadline_for(&self, id: SessionId) -> Option<Instant> {
        let (_, low) = id.as_uuid().as_u64_pair();
        // The top two bits of the low half hold the UUID variant.
        let random = low & ((1 << 62) - 1);
        let fraction = random as f64 / (1u64 << 62) as f64;
        let jitter = self.config.lifetime_jitter.mul_f64(fraction);
        Instant::now()
            .checked_add(self.config.session_lifetime)?
            .checked_add(jitter)
    }

    /// Give `session` its deadline. Call before the session opens.
    ///
    /// A lifetime too large to represent leaves the session without a
    /// deadline, so it never expires.
    pub fn assign_deadline(&self, session: &PoolSession<S>) {
        match self.deadline_for(session.id()) {
            Some(deadline) => session.set_deadline(deadline),
            None => tracing::warn!(
                session = %session.id(),
                lifetime = ?self.config.session_lifetime,
                "Session lifetime out of range; session will not expire"
            ),
        }
    }

    fn is_running(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        // The receiver stays parked here until `start` hands it to the worker.
        self.restart_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of sessions waiting on a deadline.
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Spawn the expiry loop and the restart worker on the current runtime.
    pub fn start(self: &Arc<Self>) -> Result<TrackerTasks, SessionError> {
        let restarts = self
            .restart_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SessionError::TrackerAlreadyStarted)?;

        Ok(TrackerTasks {
            expiry: tokio::spawn(Arc::clone(self).run_expiry()),
            restarts: tokio::spawn(Arc::clone(self).run_restarts(restarts)),
        })
    }

    /// Stop both background tasks. Restarts still queued are dropped and
    /// logged; later hand-offs fail with [`SessionError::TrackerStopped`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn lock_queue(&self) -> MutexGuard<'_, ExpirationQueue<S>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, session: &Arc<PoolSession<S>>) {
        let Some(deadline) = session.deadline() else {
            tracing::debug!(session = %session.id(), "Session has no deadline; not tracking");
            return;
        };
        self.lock_queue().insert(deadline, session);
        self.queue_changed.notify_one();
    }

    async fn run_expiry(self: Arc<Self>) {
        tracing::debug!("Expiration loop started");
        loop {
            let next = self.lock_queue().next_deadline();
            let deadline_reached = match next {
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.queue_changed.notified() => false,
                },
                Some(deadline) => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.queue_changed.notified() => false,
                    _ = tokio::time::sleep_until(deadline.into()) => true,
                },
            };

            if deadline_reached {
                self.expire_due().await;
            }
        }
        tracing::debug!("Expiration loop stopped");
    }

    async fn expire_due(&self) {
        let due = self.lock_queue().pop_due(Instant::now());
        for session in due {
            match session.expire(RestartMode::Background).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(session = %session.id(), "Stale timer entry; deadline moved");
                    self.track(&session);
                }
                Err(e) => {
                    tracing::error!(session = %session.id(), error = %e, "Failed to expire session");
                }
            }
        }
    }

    async fn run_restarts(self: Arc<Self>, mut restarts: mpsc::UnboundedReceiver<Arc<PoolSession<S>>>) {
        tracing::debug!("Restart worker started");
        loop {
            let session = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = restarts.recv() => match next {
                    Some(session) => session,
                    None => break,
                },
            };

            let id = session.id();
            if let Err(e) = self.restart(session).await {
                tracing::error!(session = %id, error = %e, "Failed to restart expired session");
            }
        }

        restarts.close();
        while let Ok(session) = restarts.try_recv() {
            tracing::error!(session = %session.id(), "Tracker stopped before restarting expired session");
        }
        tracing::debug!("Restart worker stopped");
    }

    async fn restart(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError> {
        let id = session.id();
        tracing::info!(session = %id, "Closing expired session");

        if let Err(e) = session.close(false).await {
            tracing::warn!(session = %id, error = %e, "Failed to close expired session; replacing it anyway");
        }

        let replacement = session
            .reopen(session.config().clone(), Vec::new())
            .await
            .map_err(|e| SessionError::restart(id, e))?;

        tracing::info!(session = %id, replacement = %replacement.id(), "Expired session replaced");
        Ok(())
    }
}

#[async_trait]
impl<S: RemoteSession> ExpirationTracker<S> for DeadlineTracker<S> {
    fn enqueue(&self, session: &Arc<PoolSession<S>>) {
        self.track(session);
    }

    fn dequeue(&self, session: &PoolSession<S>) {
        if self.lock_queue().remove(session.id()) {
            tracing::debug!(session = %session.id(), "Session removed from expiration queue");
        }
    }

    fn schedule_restart(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::TrackerStopped {
                session: session.id(),
            });
        }
        self.restart_tx
            .send(session)
            .map_err(|err| SessionError::TrackerStopped {
                session: err.0.id(),
            })
    }

    async fn close_and_restart(&self, session: Arc<PoolSession<S>>) -> Result<(), SessionError> {
        self.restart(session).await
    }
}
