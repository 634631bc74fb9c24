//! Error type shared by the session state machine and its collaborators.

use crate::session::SessionId;

/// Failures surfaced by pooled sessions and the collaborators they call.
///
/// Invariant violations (acquiring a session twice, releasing one that is not
/// checked out) are not represented here: they are caller bugs and panic.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying remote resource failed to open, close, or reopen.
    #[error("remote session error: {message}")]
    Remote { message: String },

    /// The manager that owns the session has been dropped.
    #[error("session manager is no longer available")]
    ManagerGone,

    /// The tracker's restart worker is not running (not yet started, or shut down).
    #[error("expiration tracker not running; cannot restart session {session}")]
    TrackerStopped { session: SessionId },

    #[error("expiration tracker already started")]
    TrackerAlreadyStarted,

    /// Replacing an expired session failed.
    #[error("restart of session {session} failed: {source}")]
    Restart {
        session: SessionId,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn restart(session: SessionId, source: SessionError) -> Self {
        Self::Restart {
            session,
            source: Box::new(source),
        }
    }
}
