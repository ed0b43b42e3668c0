//! Unified error type for Taleweave.

use taleweave_arbiter::GenerationError;
use taleweave_protocol::ProtocolError;
use taleweave_session::SessionError;
use taleweave_story::StoryError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `taleweave` crate, you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]` attribute
/// on each variant lets `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TaleweaveError {
    /// A registry error (unknown session, full, closed, bad input).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A scheduler control error (no driver, driver stopped).
    #[error(transparent)]
    Story(#[from] StoryError),

    /// A generation request failed or timed out.
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// An event could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
