//! Session state for Taleweave.
//!
//! This crate owns the canonical record of every story session:
//!
//! 1. **Lifecycle**: `seeding → active → completed`, driven from outside
//!    by the scheduler but enforced here.
//! 2. **Participants**: who joined, who is connected, who contributed what.
//! 3. **Inputs**: the pending direct/influence/seed contributions waiting
//!    for the next segment.
//! 4. **Segments**: the story so far, plus the bounded context window
//!    used to generate the next piece.
//!
//! # How it fits in the stack
//!
//! ```text
//! Story layer (above)    ← reacts to events, writes segments back
//!     ↕
//! Session layer (this crate)  ← sole mutator of session state
//!     ↕
//! Protocol layer (below) ← SessionId, Segment, StoryEvent
//! ```
//!
//! [`SessionRegistry`] does no I/O and spawns nothing. Every mutation
//! emits a [`StoryEvent`](taleweave_protocol::StoryEvent) on two paths: the
//! session's own channel (consumed by its scheduler) and a broadcast any
//! transport can subscribe to.

mod clock;
mod error;
mod naming;
mod registry;
mod sanitize;
mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SessionError;
pub use naming::generate_session_id;
pub use registry::{CleanupPolicy, JoinOutcome, SessionRegistry};
pub use sanitize::{sanitize_input, word_count};
pub use session::{
    CompetitionConfig, CompetitionState, Contribution, ContributionCounters,
    Participant, PendingInputs, SegmentDraft, Session, StoryConfig,
    StoryState, MAX_GOALS_PER_PLAYER,
};
