//! Error types for generation requests.

use std::time::Duration;

/// Why a generation request produced no text.
///
/// Every variant is a generation failure. [`GenerationError::Timeout`] is the
/// specialization for calls that hit the arbiter's deadline; use
/// [`is_timeout`](GenerationError::is_timeout) rather than matching when
/// only that distinction matters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The backend reported a failure or could not be reached.
    #[error("generation backend failed: {0}")]
    Backend(String),

    /// The backend answered, but not with usable text.
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    /// The call exceeded the arbiter's per-request timeout and was aborted.
    #[error("generation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The arbiter could not admit the request.
    #[error("generation arbiter is unavailable")]
    Closed,
}

impl GenerationError {
    /// Returns `true` if the request was aborted by the timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
