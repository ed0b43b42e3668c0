//! Core types shared by every Taleweave layer.
//!
//! Everything here either identifies something (sessions, participants),
//! records a finished piece of the story (segments, goals, leaderboards), or
//! announces a change ([`StoryEvent`]). All of it is serializable because
//! all of it eventually crosses the transport boundary.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A human-readable session identifier such as `amber-falcon-4821`.
///
/// `#[serde(transparent)]` serializes this as the bare string, so clients see
/// `"amber-falcon-4821"` rather than `{"0": "amber-falcon-4821"}`.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wraps any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A participant identifier, assigned by the transport layer.
///
/// The engine never invents participant ids: the same id presented twice is
/// the same person, which is what makes reconnection work.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Wraps any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Recipient: who should see an event?
// ---------------------------------------------------------------------------

/// Who an event is meant for.
///
/// Most events are public to the whole session. Goal assignments are private
/// to their owner; the transport layer must honor that or the competitive
/// mode stops being secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Every participant in the session.
    All,

    /// One participant only.
    Participant(ParticipantId),
}

// ---------------------------------------------------------------------------
// Contributions and phases
// ---------------------------------------------------------------------------

/// The three kinds of participant input.
///
/// - **Direct**: "this should happen next"; steers the next segment.
/// - **Influence**: softer nudges about tone, themes, or characters.
/// - **Seed**: premise material collected before the story starts. Seeds are
///   never cleared; every generation call sees them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    Direct,
    Influence,
    Seed,
}

impl fmt::Display for ContributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Influence => write!(f, "influence"),
            Self::Seed => write!(f, "seed"),
        }
    }
}

/// The lifecycle phase of a story.
///
/// Transitions are strictly ordered and never reversed:
///
/// ```text
/// Seeding → Active → Completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryPhase {
    Seeding,
    Active,
    Completed,
}

impl StoryPhase {
    /// The phase that follows this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Seeding => Some(Self::Active),
            Self::Active => Some(Self::Completed),
            Self::Completed => None,
        }
    }

    /// Returns `true` if moving to `target` is a legal single step.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == Some(target)
    }

    /// Returns `true` once nothing more can happen to the story.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for StoryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seeding => write!(f, "seeding"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// How hard competitive goals should be.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// Position of a segment in the story.
///
/// Regular segments are numbered from 1. The final segment produced at the
/// end of the time budget carries the `Conclusion` sentinel instead of a
/// number, so clients can render it differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentNumber {
    Numbered(u32),
    Conclusion,
}

impl SegmentNumber {
    pub fn is_conclusion(&self) -> bool {
        matches!(self, Self::Conclusion)
    }
}

impl fmt::Display for SegmentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numbered(n) => write!(f, "#{n}"),
            Self::Conclusion => write!(f, "conclusion"),
        }
    }
}

/// How many pending inputs of each kind went into a segment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct InputCounts {
    pub direct: usize,
    pub influence: usize,
}

/// One unit of generated narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// The generated prose.
    pub text: String,
    /// When the segment was appended to the story.
    pub timestamp: DateTime<Utc>,
    /// Position in the story, or the conclusion sentinel.
    pub sequence: SegmentNumber,
    /// Name of the generation template that produced it.
    pub template: String,
    /// Display names of everyone whose input shaped this segment.
    pub contributors: BTreeSet<String>,
    /// Counts of the inputs consumed.
    pub inputs: InputCounts,
}

// ---------------------------------------------------------------------------
// Goals and scoring
// ---------------------------------------------------------------------------

/// A private objective in competitive mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    /// Stable id, unique within a session (`<owner>-goal-<n>`).
    pub id: String,
    /// What the participant should try to make happen.
    pub text: String,
    /// Who owns this goal.
    pub owner: ParticipantId,
    /// `true` when the finished story fully satisfies the goal.
    pub achieved: bool,
    /// Rubric score (1–3). `None` until the story has been scored.
    pub score: Option<u8>,
    /// Free-text explanation returned by the scorer.
    pub evaluation: Option<String>,
    /// Set when generation failed and a canned goal was substituted.
    pub fallback: bool,
}

impl Goal {
    /// Lowest rubric score: the goal is absent from the story.
    pub const MIN_SCORE: u8 = 1;
    /// Highest rubric score: the goal happened exactly.
    pub const MAX_SCORE: u8 = 3;

    /// Creates an unscored goal. `index` is zero-based.
    pub fn new(
        owner: ParticipantId,
        index: usize,
        text: impl Into<String>,
        fallback: bool,
    ) -> Self {
        Self {
            id: format!("{owner}-goal-{}", index + 1),
            text: text.into(),
            owner,
            achieved: false,
            score: None,
            evaluation: None,
            fallback,
        }
    }

    /// Records a rubric score, clamped to 1–3. Only a full match counts as
    /// achieved; a partial match keeps its 2 points but not the flag.
    pub fn record_score(&mut self, score: u8, evaluation: impl Into<String>) {
        let score = score.clamp(Self::MIN_SCORE, Self::MAX_SCORE);
        self.score = Some(score);
        self.achieved = score == Self::MAX_SCORE;
        self.evaluation = Some(evaluation.into());
    }
}

/// One row of the final competitive ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based position.
    pub rank: usize,
    pub participant_id: ParticipantId,
    pub name: String,
    /// Sum of goal scores.
    pub total_score: u32,
    pub goals_achieved: usize,
    /// The participant's scored goals, revealed at the end.
    pub goals: Vec<Goal>,
}

/// A lightweight, public view of a session for event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub phase: StoryPhase,
    pub participant_count: usize,
    pub connected_count: usize,
    pub segment_count: usize,
    pub competitive: bool,
}

// ---------------------------------------------------------------------------
// StoryEvent: what the engine announces
// ---------------------------------------------------------------------------

/// Every domain event the engine emits.
///
/// The registry produces one of these on each mutation. Each event goes to
/// two places: the owning session's scheduler (so it can arm or park
/// timers) and the public broadcast that transports subscribe to.
///
/// `#[serde(tag = "type", rename_all = "snake_case")]` produces internally
/// tagged JSON, e.g. `{ "type": "story_started", "session_id": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoryEvent {
    SessionCreated {
        session_id: SessionId,
        host_id: ParticipantId,
        summary: SessionSummary,
    },
    PlayerJoined {
        session_id: SessionId,
        participant_id: ParticipantId,
        name: String,
        is_host: bool,
    },
    PlayerLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    PlayerReconnected {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    InputReceived {
        session_id: SessionId,
        participant_id: ParticipantId,
        kind: ContributionKind,
    },
    StoryStarted {
        session_id: SessionId,
    },
    SegmentAdded {
        session_id: SessionId,
        segment: Segment,
        /// Total number of segments in the story after this one.
        segment_number: usize,
    },
    StoryCompleted {
        session_id: SessionId,
        summary: SessionSummary,
        duration_secs: u64,
        narrative: String,
    },
    GoalsAssigned {
        session_id: SessionId,
        participant_id: ParticipantId,
        goals: Vec<Goal>,
    },
    CompetitionScored {
        session_id: SessionId,
        leaderboard: Vec<LeaderboardEntry>,
    },
    SessionRemoved {
        session_id: SessionId,
    },
}

impl StoryEvent {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::PlayerJoined { session_id, .. }
            | Self::PlayerLeft { session_id, .. }
            | Self::PlayerReconnected { session_id, .. }
            | Self::InputReceived { session_id, .. }
            | Self::StoryStarted { session_id }
            | Self::SegmentAdded { session_id, .. }
            | Self::StoryCompleted { session_id, .. }
            | Self::GoalsAssigned { session_id, .. }
            | Self::CompetitionScored { session_id, .. }
            | Self::SessionRemoved { session_id } => session_id,
        }
    }

    /// Who the transport should deliver this event to.
    pub fn recipient(&self) -> Recipient {
        match self {
            Self::GoalsAssigned { participant_id, .. } => {
                Recipient::Participant(participant_id.clone())
            }
            _ => Recipient::All,
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
