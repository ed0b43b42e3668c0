//! Error types for the story layer.

use taleweave_protocol::SessionId;
use taleweave_session::SessionError;

/// Errors from controlling a session's scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StoryError {
    /// No scheduler is running for this session.
    #[error("no scheduler for session {0}")]
    NotFound(SessionId),

    /// The scheduler exists but stopped answering (finished or shutting down).
    #[error("scheduler for session {0} is unavailable")]
    Unavailable(SessionId),

    /// A registry operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}
