//! Error types for the session layer.

use taleweave_protocol::{ParticipantId, SessionId, StoryPhase};

/// Errors returned by [`SessionRegistry`](crate::SessionRegistry) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this id exists (never did, or was cleaned up).
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The session has completed and accepts no further changes.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// The session already holds its maximum number of participants.
    #[error("session {session_id} is full ({max} participants)")]
    Full { session_id: SessionId, max: usize },

    /// Text was empty after sanitizing, or too long.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The participant is already a member of a different live session.
    #[error("participant {participant_id} is already in session {session_id}")]
    AlreadyInSession {
        participant_id: ParticipantId,
        session_id: SessionId,
    },

    /// The participant is not a member of the session.
    #[error("participant {0} not found")]
    ParticipantNotFound(ParticipantId),

    /// The operation is not valid in the session's current phase.
    #[error("session {session_id} cannot do that while {phase}")]
    InvalidState {
        session_id: SessionId,
        phase: StoryPhase,
    },
}
