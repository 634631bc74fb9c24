//! Time-ordered index of tracked sessions.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::contract::RemoteSession;
use crate::session::{PoolSession, SessionId};

struct Entry<S: RemoteSession> {
    deadline: Instant,
    session: Weak<PoolSession<S>>,
}

/// Sessions ordered by deadline. Holds weak handles: the queue never keeps a
/// discarded session alive.
pub(crate) struct ExpirationQueue<S: RemoteSession> {
    order: BTreeSet<(Instant, SessionId)>,
    entries: HashMap<SessionId, Entry<S>>,
}

impl<S: RemoteSession> ExpirationQueue<S> {
    pub fn new() -> Self {
        Self {
            order: BTreeSet::new(),
            entries: HashMap::new(),
        }
    }

    /// Track `session` at `deadline`, replacing any earlier entry for it.
    pub fn insert(&mut self, deadline: Instant, session: &Arc<PoolSession<S>>) {
        let id = session.id();
        self.remove(id);
        self.order.insert((deadline, id));
        self.entries.insert(
            id,
            Entry {
                deadline,
                session: Arc::downgrade(session),
            },
        );
    }

    pub fn remove(&mut self, id: SessionId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.order.remove(&(entry.deadline, id));
                true
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.first().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every live session whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Arc<PoolSession<S>>> {
        let mut due = Vec::new();
        while let Some(&(deadline, id)) = self.order.first() {
            if deadline > now {
                break;
            }
            self.order.pop_first();
            if let Some(session) = self.entries.remove(&id).and_then(|e| e.session.upgrade()) {
                due.push(session);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
