//! Tri-state lifecycle cell for pooled sessions.
//!
//! Every transition goes through a single compare-and-exchange, so concurrent
//! contenders for the same transition are ordered by the atomic itself and
//! exactly one of them wins.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    /// In the pool, unclaimed, usable.
    Idle = 0,
    /// Checked out by a caller.
    InUse = 1,
    /// Retired. Terminal: no transition ever leaves this state.
    Expired = 2,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InUse => "in_use",
            Self::Expired => "expired",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::InUse,
            2 => Self::Expired,
            other => unreachable!("invalid session state {other}"),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for a [`SessionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`. On failure returns the state actually observed.
    pub fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        debug_assert!(!from.is_terminal(), "no transition leaves {from}");
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_raw)
    }
}
