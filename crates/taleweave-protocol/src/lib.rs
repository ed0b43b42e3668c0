//! Shared vocabulary for Taleweave.
//!
//! This crate defines what every other layer talks about:
//!
//! - **Identifiers** ([`SessionId`], [`ParticipantId`]): newtypes so a
//!   session id can never be passed where a participant id is expected.
//! - **Records** ([`Segment`], [`Goal`], [`LeaderboardEntry`]): the pieces of
//!   a story that leave the engine and reach participants.
//! - **Events** ([`StoryEvent`]): everything the engine announces to the
//!   transport layer, tagged with who should receive it ([`Recipient`]).
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those events become
//!   bytes for whatever transport sits on top.
//!
//! # Architecture
//!
//! The protocol layer knows nothing about timers, sessions-as-state, or the
//! generation backend. It only describes data.
//!
//! ```text
//! Registry / Scheduler (state) → Protocol (StoryEvent) → Transport (bytes)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    ContributionKind, Difficulty, Goal, InputCounts, LeaderboardEntry,
    ParticipantId, Recipient, Segment, SegmentNumber, SessionId,
    SessionSummary, StoryEvent, StoryPhase,
};
