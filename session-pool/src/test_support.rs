//! Collaborator doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::contract::{ExpirationTracker, RemoteSession, SessionConfig, SessionManager};
use crate::error::SessionError;
use crate::session::{PoolSession, SessionId};

pub(crate) fn tracker_handle<T>(tracker: &Arc<T>) -> Weak<dyn ExpirationTracker<FakeRemote>>
where
    T: ExpirationTracker<FakeRemote> + 'static,
{
    let handle: Weak<T> = Arc::downgrade(tracker);
    handle
}

/// Remote session that only counts calls.
pub(crate) struct FakeRemote {
    remote_id: String,
    fail_open: bool,
    fail_close: bool,
    stall_close: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeRemote {
    pub fn new(remote_id: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            fail_open: false,
            fail_close: false,
            stall_close: false,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn failing_open(remote_id: impl Into<String>) -> Self {
        Self {
            fail_open: true,
            ..Self::new(remote_id)
        }
    }

    pub fn failing_close(remote_id: impl Into<String>) -> Self {
        Self {
            fail_close: true,
            ..Self::new(remote_id)
        }
    }

    /// `close` never completes.
    pub fn stalling_close(remote_id: impl Into<String>) -> Self {
        Self {
            stall_close: true,
            ..Self::new(remote_id)
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSession for FakeRemote {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn open(&self, _resources: &[String]) -> Result<(), SessionError> {
        if self.fail_open {
            return Err(SessionError::remote("application master refused to start"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _keep_scratch: bool) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.stall_close {
            std::future::pending::<()>().await;
        }
        if self.fail_close {
            return Err(SessionError::remote("application master unreachable"));
        }
        Ok(())
    }
}

/// Manager that records every call and opens real replacements on reopen.
pub(crate) struct RecordingManager {
    me: Weak<RecordingManager>,
    tracker: Option<Weak<dyn ExpirationTracker<FakeRemote>>>,
    replacement_lifetime: Option<Duration>,
    open: StdMutex<HashSet<SessionId>>,
    reopened: StdMutex<Vec<SessionId>>,
    replacements: StdMutex<Vec<Arc<PoolSession<FakeRemote>>>>,
    returned: AtomicUsize,
    destroyed: AtomicUsize,
    fail_reopen: AtomicBool,
}

impl RecordingManager {
    pub fn new(tracker: Option<Weak<dyn ExpirationTracker<FakeRemote>>>) -> Arc<Self> {
        Self::build(tracker, None)
    }

    /// Replacements get a deadline `lifetime` after they are created.
    pub fn with_replacement_lifetime(
        tracker: Weak<dyn ExpirationTracker<FakeRemote>>,
        lifetime: Duration,
    ) -> Arc<Self> {
        Self::build(Some(tracker), Some(lifetime))
    }

    fn build(
        tracker: Option<Weak<dyn ExpirationTracker<FakeRemote>>>,
        replacement_lifetime: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tracker,
            replacement_lifetime,
            open: StdMutex::new(HashSet::new()),
            reopened: StdMutex::new(Vec::new()),
            replacements: StdMutex::new(Vec::new()),
            returned: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            fail_reopen: AtomicBool::new(false),
        })
    }

    pub fn session(&self, remote_id: &str) -> PoolSession<FakeRemote> {
        self.session_with(FakeRemote::new(remote_id))
    }

    pub fn session_with(&self, remote: FakeRemote) -> PoolSession<FakeRemote> {
        self.session_with_config(remote, SessionConfig::new())
    }

    fn session_with_config(
        &self,
        remote: FakeRemote,
        config: SessionConfig,
    ) -> PoolSession<FakeRemote> {
        let manager: Weak<dyn SessionManager<FakeRemote>> = self.me.clone();
        let session = PoolSession::new(remote, config, manager);
        match &self.tracker {
            Some(tracker) => session.with_tracker(tracker.clone()),
            None => session,
        }
    }

    pub fn fail_reopen(&self) {
        self.fail_reopen.store(true, Ordering::SeqCst);
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.open.lock().unwrap().contains(&id)
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    pub fn returned(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn reopened(&self) -> Vec<SessionId> {
        self.reopened.lock().unwrap().clone()
    }

    pub fn replacements(&self) -> Vec<Arc<PoolSession<FakeRemote>>> {
        self.replacements.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionManager<FakeRemote> for RecordingManager {
    fn register_open(&self, session: &Arc<PoolSession<FakeRemote>>) {
        self.open.lock().unwrap().insert(session.id());
    }

    fn unregister_open(&self, session: &PoolSession<FakeRemote>) {
        self.open.lock().unwrap().remove(&session.id());
    }

    async fn return_after_use(
        &self,
        _session: Arc<PoolSession<FakeRemote>>,
    ) -> Result<(), SessionError> {
        self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reopen(
        &self,
        session: Arc<PoolSession<FakeRemote>>,
        config: SessionConfig,
        resources: Vec<String>,
    ) -> Result<Arc<PoolSession<FakeRemote>>, SessionError> {
        self.reopened.lock().unwrap().push(session.id());
        if self.fail_reopen.load(Ordering::SeqCst) {
            return Err(SessionError::remote("no capacity for a replacement"));
        }

        let remote_id = format!("{}-r", session.inner().remote_id());
        let replacement = Arc::new(self.session_with_config(FakeRemote::new(remote_id), config));
        if let Some(lifetime) = self.replacement_lifetime {
            replacement.set_deadline(Instant::now() + lifetime);
        }
        replacement.open(&resources).await?;

        self.replacements
            .lock()
            .unwrap()
            .push(Arc::clone(&replacement));
        Ok(replacement)
    }

    async fn destroy(&self, _session: Arc<PoolSession<FakeRemote>>) -> Result<(), SessionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tracker that counts restart requests instead of acting on them.
pub(crate) struct CountingTracker {
    queued: StdMutex<HashSet<SessionId>>,
    background: AtomicUsize,
    inline: AtomicUsize,
    stopped: AtomicBool,
}

impl CountingTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queued: StdMutex::new(HashSet::new()),
            background: AtomicUsize::new(0),
            inline: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_queued(&self, id: SessionId) -> bool {
        self.queued.lock().unwrap().contains(&id)
    }

    pub fn background_restarts(&self) -> usize {
        self.background.load(Ordering::SeqCst)
    }

    pub fn inline_restarts(&self) -> usize {
        self.inline.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.background_restarts() + self.inline_restarts()
    }
}

#[async_trait]
impl ExpirationTracker<FakeRemote> for CountingTracker {
    fn enqueue(&self, session: &Arc<PoolSession<FakeRemote>>) {
        if session.deadline().is_some() {
            self.queued.lock().unwrap().insert(session.id());
        }
    }

    fn dequeue(&self, session: &PoolSession<FakeRemote>) {
        self.queued.lock().unwrap().remove(&session.id());
    }

    fn schedule_restart(&self, session: Arc<PoolSession<FakeRemote>>) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::TrackerStopped {
                session: session.id(),
            });
        }
        self.background.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_and_restart(
        &self,
        _session: Arc<PoolSession<FakeRemote>>,
    ) -> Result<(), SessionError> {
        self.inline.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
