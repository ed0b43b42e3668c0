//! Session types: the state of one collaborative story.
//!
//! A session tracks:
//! - WHO is taking part ([`Participant`])
//! - WHERE the story is in its lifecycle ([`StoryState`])
//! - WHAT participants have said since the last segment ([`PendingInputs`])
//! - the story itself (a list of [`Segment`]s)

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taleweave_protocol::{
    ContributionKind, Difficulty, Goal, InputCounts, LeaderboardEntry,
    ParticipantId, Segment, SessionId, SessionSummary, StoryPhase,
};

// ---------------------------------------------------------------------------
// StoryConfig
// ---------------------------------------------------------------------------

/// Timing and limits for one session, fixed at creation.
///
/// Every field has a default. A copy is stored on each session, so changing
/// the registry's defaults never affects sessions already running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    /// How long participants have to seed the premise.
    pub seeding_duration: Duration,

    /// One-time extension when seeding ends with no seeds.
    pub seeding_grace: Duration,

    /// Time between generated segments.
    pub cadence_interval: Duration,

    /// Active story time before the conclusion is generated.
    pub total_duration: Duration,

    /// Maximum participants, connected or not.
    pub max_participants: usize,

    /// How many recent segments feed the next generation.
    pub context_segments: usize,

    /// Delay before retrying a failed generation.
    pub retry_backoff: Duration,

    /// Longest accepted input, in characters, after cleanup.
    pub max_input_chars: usize,

    /// Secret-goal competition settings.
    pub competition: CompetitionConfig,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            seeding_duration: Duration::from_secs(60),
            seeding_grace: Duration::from_secs(30),
            cadence_interval: Duration::from_secs(30),
            total_duration: Duration::from_secs(10 * 60),
            max_participants: 8,
            context_segments: 5,
            retry_backoff: Duration::from_secs(10),
            max_input_chars: 500,
            competition: CompetitionConfig::default(),
        }
    }
}

/// Most goals a participant can hold; the size of each fallback list.
pub const MAX_GOALS_PER_PLAYER: usize = 5;

/// Whether sessions get secret goals, and how many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompetitionConfig {
    pub enabled: bool,
    /// Goals each participant receives, between 1 and
    /// [`MAX_GOALS_PER_PLAYER`]. The registry clamps values outside that
    /// range when competition is turned on.
    pub goals_per_player: usize,
    pub difficulty: Difficulty,
}

impl Default for CompetitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            goals_per_player: 3,
            difficulty: Difficulty::Medium,
        }
    }
}

// ---------------------------------------------------------------------------
// StoryState
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle.
///
/// ```text
///   Seeding ──(start_story)──→ Active ──(complete_story)──→ Completed
/// ```
///
/// Phases only move forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryState {
    pub phase: StoryPhase,
    pub seeding_started_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Active story time left before the conclusion. Never increases
    /// while active.
    pub remaining_total: Duration,
    /// Time left in the current seeding or cadence window.
    pub remaining_window: Duration,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One piece of text a participant submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub participant_id: ParticipantId,
    pub name: String,
    pub text: String,
    pub kind: ContributionKind,
    pub timestamp: DateTime<Utc>,
}

/// Inputs waiting to be folded into the story.
///
/// Direct and influence inputs belong to the current round and are cleared
/// after every segment. Seeds are the premise and stay for the whole
/// session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInputs {
    pub direct: Vec<Contribution>,
    pub influence: Vec<Contribution>,
    pub seeds: Vec<Contribution>,
}

impl PendingInputs {
    pub(crate) fn push(&mut self, contribution: Contribution) {
        match contribution.kind {
            ContributionKind::Direct => self.direct.push(contribution),
            ContributionKind::Influence => self.influence.push(contribution),
            ContributionKind::Seed => self.seeds.push(contribution),
        }
    }

    /// Clears direct and influence inputs; seeds stay.
    pub(crate) fn clear_round(&mut self) {
        self.direct.clear();
        self.influence.clear();
    }

    /// `true` if no direct or influence input is waiting.
    pub fn round_is_empty(&self) -> bool {
        self.direct.is_empty() && self.influence.is_empty()
    }

    pub fn counts(&self) -> InputCounts {
        InputCounts {
            direct: self.direct.len(),
            influence: self.influence.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Per-kind tallies of what a participant contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContributionCounters {
    pub direct_inputs: usize,
    pub direct_words: usize,
    pub influence_inputs: usize,
    pub influence_words: usize,
    pub seed_inputs: usize,
    pub seed_words: usize,
}

impl ContributionCounters {
    pub(crate) fn record(&mut self, kind: ContributionKind, words: usize) {
        let (inputs, total) = match kind {
            ContributionKind::Direct => (&mut self.direct_inputs, &mut self.direct_words),
            ContributionKind::Influence => {
                (&mut self.influence_inputs, &mut self.influence_words)
            }
            ContributionKind::Seed => (&mut self.seed_inputs, &mut self.seed_words),
        };
        *inputs += 1;
        *total += words;
    }

    pub fn total_inputs(&self) -> usize {
        self.direct_inputs + self.influence_inputs + self.seed_inputs
    }
}

/// Someone taking part in a session.
///
/// Participants are never removed when they disconnect; `connected` flips
/// and they can come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// Free-form description of where the connection came from.
    pub origin: String,
    pub is_host: bool,
    pub connected: bool,
    pub joined_at: DateTime<Utc>,
    /// Position in join order, starting at 0 for the host.
    pub join_order: usize,
    pub counters: ContributionCounters,
    /// Secret goals, empty unless the session is competitive.
    pub goals: Vec<Goal>,
}

// ---------------------------------------------------------------------------
// Competition
// ---------------------------------------------------------------------------

/// Competition bookkeeping stored on a competitive session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitionState {
    pub difficulty: Difficulty,
    pub goals_per_player: usize,
    /// Set once scores are recorded.
    pub finalized: bool,
    /// Empty until finalized.
    pub leaderboard: Vec<LeaderboardEntry>,
}

// ---------------------------------------------------------------------------
// Segments
// ---------------------------------------------------------------------------

/// A generated segment before the registry stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDraft {
    pub text: String,
    pub template: String,
    pub contributors: BTreeSet<String>,
    pub inputs: InputCounts,
    /// `true` for the closing segment.
    pub conclusion: bool,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One collaborative story and everyone in it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub segments: Vec<Segment>,
    pub participants: HashMap<ParticipantId, Participant>,
    pub state: StoryState,
    pub pending: PendingInputs,
    /// `Some` when the session is competitive.
    pub competition: Option<CompetitionState>,
    /// Texts of the last `context_segments` segments, oldest first.
    pub recent_context: Vec<String>,
    pub config: StoryConfig,
    pub(crate) next_join_order: usize,
}

impl Session {
    pub fn phase(&self) -> StoryPhase {
        self.state.phase
    }

    pub fn is_competitive(&self) -> bool {
        self.competition.is_some()
    }

    pub fn connected_count(&self) -> usize {
        self.participants.values().filter(|p| p.connected).count()
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Participants ordered by when they joined, host first.
    pub fn participants_in_join_order(&self) -> Vec<&Participant> {
        let mut participants: Vec<_> = self.participants.values().collect();
        participants.sort_by_key(|p| p.join_order);
        participants
    }

    /// All seeds, one per line, in submission order.
    pub fn seed_text(&self) -> String {
        self.pending
            .seeds
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of regular (non-conclusion) segments so far.
    pub fn numbered_segment_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !s.sequence.is_conclusion())
            .count()
    }

    /// The complete story: the seed premise followed by every segment,
    /// separated by blank lines. An empty premise is left out.
    pub fn full_narrative(&self) -> String {
        let seed = self.seed_text();
        let mut parts = Vec::with_capacity(self.segments.len() + 1);
        if !seed.is_empty() {
            parts.push(seed.as_str());
        }
        parts.extend(self.segments.iter().map(|s| s.text.as_str()));
        parts.join("\n\n")
    }

    /// Seconds between the story starting and completing, 0 if not both.
    pub fn duration_secs(&self) -> u64 {
        match (self.state.started_at, self.state.completed_at) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0) as u64,
            _ => 0,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            phase: self.state.phase,
            participant_count: self.participants.len(),
            connected_count: self.connected_count(),
            segment_count: self.segments.len(),
            competitive: self.is_competitive(),
        }
    }

    pub(crate) fn refresh_context(&mut self) {
        let keep = self.config.context_segments;
        let skip = self.segments.len().saturating_sub(keep);
        self.recent_context = self.segments[skip..]
            .iter()
            .map(|s| s.text.clone())
            .collect();
    }
}
