//! The session registry: the single owner of all session state.
//!
//! Every change to a session goes through here. That gives one place to
//! enforce the lifecycle rules and one place that emits events.
//!
//! # Concurrency note
//!
//! `SessionRegistry` is NOT thread-safe by itself; it is a plain struct over
//! `HashMap`s. The engine shares it as `Arc<tokio::sync::Mutex<_>>` and
//! never holds the lock across a generation call.
//!
//! # Events
//!
//! Each session has an unbounded channel whose receiver is handed out by
//! [`create_session`](SessionRegistry::create_session); the session's
//! scheduler consumes it. The same events also go to a broadcast channel
//! for transports. Removing a session drops its sender, which ends the
//! scheduler's receive loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taleweave_protocol::{
    ContributionKind, Difficulty, Goal, LeaderboardEntry, ParticipantId,
    Segment, SegmentNumber, SessionId, StoryEvent, StoryPhase,
};
use tokio::sync::{broadcast, mpsc};

use crate::session::{
    CompetitionState, Contribution, MAX_GOALS_PER_PLAYER, Participant, PendingInputs, StoryState,
};
use crate::{
    Clock, ContributionCounters, SegmentDraft, Session, SessionError,
    StoryConfig, SystemClock, generate_session_id, sanitize_input, word_count,
};

/// Longest accepted display name, in characters.
const MAX_NAME_CHARS: usize = 40;

/// Capacity of the public event broadcast.
const BROADCAST_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// CleanupPolicy
// ---------------------------------------------------------------------------

/// When idle sessions are removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Completed sessions idle longer than this are removed.
    pub completed_retention: Duration,
    /// Unfinished sessions with nobody connected, idle longer than this,
    /// are removed.
    pub abandoned_retention: Duration,
    /// How often the engine runs the sweep.
    pub sweep_interval: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            completed_retention: Duration::from_secs(60 * 60),
            abandoned_retention: Duration::from_secs(6 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// What [`SessionRegistry::join_session`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new participant was added.
    Joined,
    /// An existing participant came back (or was already connected).
    Reconnected,
}

struct SessionEntry {
    session: Session,
    driver: mpsc::UnboundedSender<StoryEvent>,
}

/// Owns every session and the participant → session index.
///
/// ## Lifecycle
///
/// ```text
/// create_session() ──→ [Seeding] ──start_story()──→ [Active]
///                                                      │
///                          append_segment() ◄──────────┤
///                                                      ▼
///                                  complete_story() ──→ [Completed]
///                                                      │
///                          cleanup_inactive() ◄────────┘ (after retention)
/// ```
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,

    /// Which session each participant currently belongs to. A participant
    /// is mapped while connected; leaving releases the mapping.
    memberships: HashMap<ParticipantId, SessionId>,

    defaults: StoryConfig,
    cleanup: CleanupPolicy,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<StoryEvent>,
}

impl SessionRegistry {
    /// Creates an empty registry using the system clock.
    pub fn new(defaults: StoryConfig, cleanup: CleanupPolicy) -> Self {
        Self::with_clock(defaults, cleanup, Arc::new(SystemClock))
    }

    /// Creates an empty registry with a custom clock.
    pub fn with_clock(
        defaults: StoryConfig,
        cleanup: CleanupPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sessions: HashMap::new(),
            memberships: HashMap::new(),
            defaults,
            cleanup,
            clock,
            events,
        }
    }

    // =====================================================================
    // Membership
    // =====================================================================

    /// Creates a session in `Seeding` with the caller as its connected host,
    /// using the registry's default [`StoryConfig`].
    ///
    /// Returns the new id and the receiver for the session's own event
    /// channel, which the scheduler consumes.
    ///
    /// # Errors
    /// - [`SessionError::InvalidInput`] if the name is empty after cleanup
    /// - [`SessionError::AlreadyInSession`] if the host is in another live
    ///   session
    pub fn create_session(
        &mut self,
        host_id: ParticipantId,
        name: &str,
        origin: &str,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<StoryEvent>), SessionError> {
        let config = self.defaults.clone();
        self.create_session_with(host_id, name, origin, config)
    }

    /// Like [`create_session`](Self::create_session) with a custom config.
    pub fn create_session_with(
        &mut self,
        host_id: ParticipantId,
        name: &str,
        origin: &str,
        config: StoryConfig,
    ) -> Result<(SessionId, mpsc::UnboundedReceiver<StoryEvent>), SessionError> {
        let name = sanitize_input(name, MAX_NAME_CHARS)?;
        self.ensure_free(&host_id, None)?;

        let session_id = generate_session_id(|id| self.sessions.contains_key(id));
        let now = self.clock.now();

        let host = Participant {
            id: host_id.clone(),
            name: name.clone(),
            origin: origin.to_string(),
            is_host: true,
            connected: true,
            joined_at: now,
            join_order: 0,
            counters: ContributionCounters::default(),
            goals: Vec::new(),
        };

        let competition = config.competition.enabled.then(|| CompetitionState {
            difficulty: config.competition.difficulty,
            goals_per_player: clamp_goals(config.competition.goals_per_player),
            finalized: false,
            leaderboard: Vec::new(),
        });

        let session = Session {
            id: session_id.clone(),
            created_at: now,
            last_activity: now,
            segments: Vec::new(),
            participants: HashMap::from([(host_id.clone(), host)]),
            state: StoryState {
                phase: StoryPhase::Seeding,
                seeding_started_at: now,
                started_at: None,
                completed_at: None,
                remaining_total: config.total_duration,
                remaining_window: config.seeding_duration,
            },
            pending: PendingInputs::default(),
            competition,
            recent_context: Vec::new(),
            config,
            next_join_order: 1,
        };
        let summary = session.summary();

        let (driver, receiver) = mpsc::unbounded_channel();
        self.sessions
            .insert(session_id.clone(), SessionEntry { session, driver });
        self.memberships.insert(host_id.clone(), session_id.clone());

        tracing::info!(%session_id, host_id = %host_id, "session created");

        self.publish(StoryEvent::SessionCreated {
            session_id: session_id.clone(),
            host_id: host_id.clone(),
            summary,
        });
        self.publish(StoryEvent::PlayerJoined {
            session_id: session_id.clone(),
            participant_id: host_id,
            name,
            is_host: true,
        });

        Ok((session_id, receiver))
    }

    /// Adds a participant to a session, or reconnects a returning one.
    ///
    /// Rejoining is idempotent: a participant who is already a member is
    /// marked connected and never duplicated.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`]: unknown session
    /// - [`SessionError::Closed`]: the story has completed
    /// - [`SessionError::AlreadyInSession`]: member of another live session
    /// - [`SessionError::Full`]: no room for a new participant
    /// - [`SessionError::InvalidInput`]: empty display name
    pub fn join_session(
        &mut self,
        session_id: &SessionId,
        participant_id: ParticipantId,
        name: &str,
        origin: &str,
    ) -> Result<JoinOutcome, SessionError> {
        let session = self.session(session_id)?;
        if session.phase().is_terminal() {
            return Err(SessionError::Closed(session_id.clone()));
        }
        let existing = session.participants.get(&participant_id);
        let was_connected = existing.is_some_and(|p| p.connected);
        if existing.is_none() && session.participants.len() >= session.config.max_participants {
            return Err(SessionError::Full {
                session_id: session_id.clone(),
                max: session.config.max_participants,
            });
        }
        let is_member = existing.is_some();
        let name = if is_member {
            None
        } else {
            Some(sanitize_input(name, MAX_NAME_CHARS)?)
        };
        self.ensure_free(&participant_id, Some(session_id))?;

        let now = self.clock.now();
        let session = self.session_mut(session_id)?;
        session.last_activity = now;

        let outcome = match name {
            None => {
                if let Some(participant) = session.participants.get_mut(&participant_id) {
                    participant.connected = true;
                }
                JoinOutcome::Reconnected
            }
            Some(name) => {
                let join_order = session.next_join_order;
                session.next_join_order += 1;
                session.participants.insert(
                    participant_id.clone(),
                    Participant {
                        id: participant_id.clone(),
                        name: name.clone(),
                        origin: origin.to_string(),
                        is_host: false,
                        connected: true,
                        joined_at: now,
                        join_order,
                        counters: ContributionCounters::default(),
                        goals: Vec::new(),
                    },
                );
                JoinOutcome::Joined
            }
        };
        let display_name = session
            .participants
            .get(&participant_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        self.memberships
            .insert(participant_id.clone(), session_id.clone());

        match outcome {
            JoinOutcome::Joined => {
                tracing::info!(%session_id, %participant_id, "participant joined");
                self.publish(StoryEvent::PlayerJoined {
                    session_id: session_id.clone(),
                    participant_id,
                    name: display_name,
                    is_host: false,
                });
            }
            JoinOutcome::Reconnected if !was_connected => {
                tracing::info!(%session_id, %participant_id, "participant reconnected");
                self.publish(StoryEvent::PlayerReconnected {
                    session_id: session_id.clone(),
                    participant_id,
                });
            }
            JoinOutcome::Reconnected => {
                tracing::debug!(%session_id, %participant_id, "participant already connected");
            }
        }
        Ok(outcome)
    }

    /// Marks a participant disconnected and releases their membership.
    ///
    /// The participant record stays so they can reconnect. Returns the
    /// session they left, or `None` if they were not in one.
    pub fn leave_session(&mut self, participant_id: &ParticipantId) -> Option<SessionId> {
        let session_id = self.memberships.remove(participant_id)?;
        let now = self.clock.now();
        let entry = self.sessions.get_mut(&session_id)?;
        let participant = entry.session.participants.get_mut(participant_id)?;
        if !participant.connected {
            return Some(session_id);
        }
        participant.connected = false;
        entry.session.last_activity = now;

        tracing::info!(%session_id, %participant_id, "participant left");
        self.publish(StoryEvent::PlayerLeft {
            session_id: session_id.clone(),
            participant_id: participant_id.clone(),
        });
        Some(session_id)
    }

    // =====================================================================
    // Inputs
    // =====================================================================

    /// Records a participant's contribution.
    ///
    /// Returns `Ok(false)` without changing anything when the input does
    /// not apply: unknown or completed session, not a member, or a seed
    /// once seeding is over.
    ///
    /// # Errors
    /// [`SessionError::InvalidInput`] if the text is empty or too long.
    pub fn add_input(
        &mut self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        kind: ContributionKind,
        text: &str,
    ) -> Result<bool, SessionError> {
        let now = self.clock.now();
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let session = &mut entry.session;
        let phase = session.phase();
        if phase.is_terminal() {
            return Ok(false);
        }
        if kind == ContributionKind::Seed && phase != StoryPhase::Seeding {
            tracing::debug!(%session_id, %participant_id, "seed ignored after seeding");
            return Ok(false);
        }
        let Some(participant) = session.participants.get_mut(participant_id) else {
            return Ok(false);
        };

        let text = sanitize_input(text, session.config.max_input_chars)?;
        participant.counters.record(kind, word_count(&text));
        let name = participant.name.clone();

        session.pending.push(Contribution {
            participant_id: participant_id.clone(),
            name,
            text,
            kind,
            timestamp: now,
        });
        session.last_activity = now;

        tracing::debug!(%session_id, %participant_id, ?kind, "input recorded");
        self.publish(StoryEvent::InputReceived {
            session_id: session_id.clone(),
            participant_id: participant_id.clone(),
            kind,
        });
        Ok(true)
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Moves a session from `Seeding` to `Active`.
    ///
    /// Returns `Ok(false)` if the story is already active or completed.
    pub fn start_story(&mut self, session_id: &SessionId) -> Result<bool, SessionError> {
        let now = self.clock.now();
        let session = self.session_mut(session_id)?;
        if !session.phase().can_transition_to(StoryPhase::Active) {
            return Ok(false);
        }
        session.state.phase = StoryPhase::Active;
        session.state.started_at = Some(now);
        session.state.remaining_window = session.config.cadence_interval;
        session.last_activity = now;
        let seeds = session.pending.seeds.len();

        tracing::info!(%session_id, seeds, "story started");
        self.publish(StoryEvent::StoryStarted {
            session_id: session_id.clone(),
        });
        Ok(true)
    }

    /// Stamps and appends a generated segment, then clears the round's
    /// direct and influence inputs.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`]: the session is gone
    /// - [`SessionError::Closed`]: the story has completed
    /// - [`SessionError::InvalidState`]: the story has not started
    pub fn append_segment(
        &mut self,
        session_id: &SessionId,
        draft: SegmentDraft,
    ) -> Result<Segment, SessionError> {
        let now = self.clock.now();
        let session = self.session_mut(session_id)?;
        let phase = session.phase();
        if phase.is_terminal() {
            return Err(SessionError::Closed(session_id.clone()));
        }
        if phase != StoryPhase::Active {
            return Err(SessionError::InvalidState {
                session_id: session_id.clone(),
                phase,
            });
        }

        let sequence = if draft.conclusion {
            SegmentNumber::Conclusion
        } else {
            SegmentNumber::Numbered(session.numbered_segment_count() as u32 + 1)
        };
        let segment = Segment {
            text: draft.text,
            timestamp: now,
            sequence,
            template: draft.template,
            contributors: draft.contributors,
            inputs: draft.inputs,
        };
        session.segments.push(segment.clone());
        session.refresh_context();
        session.pending.clear_round();
        session.last_activity = now;
        let segment_number = session.segments.len();

        tracing::info!(%session_id, sequence = %segment.sequence, "segment added");
        self.publish(StoryEvent::SegmentAdded {
            session_id: session_id.clone(),
            segment: segment.clone(),
            segment_number,
        });
        Ok(segment)
    }

    /// Moves a session from `Active` to `Completed`.
    ///
    /// Returns `Ok(false)` if it had already completed.
    ///
    /// # Errors
    /// [`SessionError::InvalidState`] if the story never started.
    pub fn complete_story(&mut self, session_id: &SessionId) -> Result<bool, SessionError> {
        let now = self.clock.now();
        let session = self.session_mut(session_id)?;
        let phase = session.phase();
        if phase.is_terminal() {
            return Ok(false);
        }
        if !phase.can_transition_to(StoryPhase::Completed) {
            return Err(SessionError::InvalidState {
                session_id: session_id.clone(),
                phase,
            });
        }
        session.state.phase = StoryPhase::Completed;
        session.state.completed_at = Some(now);
        session.state.remaining_total = Duration::ZERO;
        session.state.remaining_window = Duration::ZERO;
        session.last_activity = now;

        let summary = session.summary();
        let duration_secs = session.duration_secs();
        let narrative = session.full_narrative();

        tracing::info!(%session_id, duration_secs, segments = summary.segment_count, "story completed");
        self.publish(StoryEvent::StoryCompleted {
            session_id: session_id.clone(),
            summary,
            duration_secs,
            narrative,
        });
        Ok(true)
    }

    /// Records the scheduler's view of remaining time.
    ///
    /// The total never increases while the story is active: a larger value
    /// than the current one is ignored.
    pub fn update_timing(
        &mut self,
        session_id: &SessionId,
        remaining_total: Duration,
        remaining_window: Duration,
    ) -> Result<(), SessionError> {
        let session = self.session_mut(session_id)?;
        if session.phase().is_terminal() {
            return Ok(());
        }
        if session.phase() == StoryPhase::Active {
            session.state.remaining_total = session.state.remaining_total.min(remaining_total);
        }
        session.state.remaining_window = remaining_window;
        Ok(())
    }

    // =====================================================================
    // Competition
    // =====================================================================

    /// Turns on secret goals for a session that is still seeding.
    pub fn enable_competition(
        &mut self,
        session_id: &SessionId,
        difficulty: Difficulty,
        goals_per_player: usize,
    ) -> Result<(), SessionError> {
        let session = self.session_mut(session_id)?;
        if session.phase() != StoryPhase::Seeding {
            return Err(SessionError::InvalidState {
                session_id: session_id.clone(),
                phase: session.phase(),
            });
        }
        let goals_per_player = clamp_goals(goals_per_player);
        session.competition = Some(CompetitionState {
            difficulty,
            goals_per_player,
            finalized: false,
            leaderboard: Vec::new(),
        });
        tracing::info!(%session_id, ?difficulty, goals_per_player, "competition enabled");
        Ok(())
    }

    /// Gives a participant their secret goals.
    ///
    /// Returns `Ok(false)` if they already have goals; assignment happens
    /// once per participant.
    pub fn assign_goals(
        &mut self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        goals: Vec<Goal>,
    ) -> Result<bool, SessionError> {
        let session = self.session_mut(session_id)?;
        if !session.is_competitive() {
            return Err(SessionError::InvalidState {
                session_id: session_id.clone(),
                phase: session.phase(),
            });
        }
        let participant = session
            .participants
            .get_mut(participant_id)
            .ok_or_else(|| SessionError::ParticipantNotFound(participant_id.clone()))?;
        if !participant.goals.is_empty() {
            return Ok(false);
        }
        participant.goals = goals.clone();

        tracing::debug!(%session_id, %participant_id, count = goals.len(), "goals assigned");
        self.publish(StoryEvent::GoalsAssigned {
            session_id: session_id.clone(),
            participant_id: participant_id.clone(),
            goals,
        });
        Ok(true)
    }

    /// Stores scored goals and the final leaderboard, and finalizes the
    /// competition.
    ///
    /// Returns `Ok(false)` if the competition was already finalized.
    pub fn record_scores(
        &mut self,
        session_id: &SessionId,
        scored: Vec<Goal>,
        leaderboard: Vec<LeaderboardEntry>,
    ) -> Result<bool, SessionError> {
        let session = self.session_mut(session_id)?;
        let phase = session.phase();
        let Some(competition) = session.competition.as_mut() else {
            return Err(SessionError::InvalidState {
                session_id: session_id.clone(),
                phase,
            });
        };
        if competition.finalized {
            return Ok(false);
        }
        competition.finalized = true;
        competition.leaderboard = leaderboard.clone();

        for goal in scored {
            let Some(participant) = session.participants.get_mut(&goal.owner) else {
                continue;
            };
            if let Some(slot) = participant.goals.iter_mut().find(|g| g.id == goal.id) {
                *slot = goal;
            }
        }

        tracing::info!(%session_id, entries = leaderboard.len(), "competition scored");
        self.publish(StoryEvent::CompetitionScored {
            session_id: session_id.clone(),
            leaderboard,
        });
        Ok(true)
    }

    // =====================================================================
    // Cleanup
    // =====================================================================

    /// Removes idle sessions according to the [`CleanupPolicy`].
    ///
    /// - completed sessions idle longer than `completed_retention`
    /// - unfinished sessions with nobody connected, idle longer than
    ///   `abandoned_retention`
    ///
    /// Removing a session releases its participants and closes its event
    /// channel. Returns the removed ids.
    pub fn cleanup_inactive(&mut self) -> Vec<SessionId> {
        let now = self.clock.now();
        let idle = |session: &Session| -> Duration {
            (now - session.last_activity).to_std().unwrap_or(Duration::ZERO)
        };

        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .map(|entry| &entry.session)
            .filter(|session| {
                if session.phase().is_terminal() {
                    idle(session) > self.cleanup.completed_retention
                } else {
                    session.connected_count() == 0
                        && idle(session) > self.cleanup.abandoned_retention
                }
            })
            .map(|session| session.id.clone())
            .collect();

        for session_id in &expired {
            self.publish(StoryEvent::SessionRemoved {
                session_id: session_id.clone(),
            });
            // Dropping the entry drops its sender, closing the channel.
            self.sessions.remove(session_id);
            self.memberships.retain(|_, mapped| mapped != session_id);
            tracing::info!(%session_id, "inactive session removed");
        }
        expired
    }

    /// The configured cleanup policy.
    pub fn cleanup_policy(&self) -> &CleanupPolicy {
        &self.cleanup
    }

    // =====================================================================
    // Queries
    // =====================================================================

    /// Subscribes to every event from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<StoryEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id).map(|entry| &entry.session)
    }

    /// A copy of a session, for use after the registry lock is released.
    pub fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.get(session_id).cloned()
    }

    /// The session a participant currently belongs to.
    pub fn session_of(&self, participant_id: &ParticipantId) -> Option<&SessionId> {
        self.memberships.get(participant_id)
    }

    /// Seed premise followed by every segment.
    pub fn full_narrative(&self, session_id: &SessionId) -> Option<String> {
        self.get(session_id).map(Session::full_narrative)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn defaults(&self) -> &StoryConfig {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // =====================================================================
    // Internals
    // =====================================================================

    fn session(&self, session_id: &SessionId) -> Result<&Session, SessionError> {
        self.get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    fn session_mut(&mut self, session_id: &SessionId) -> Result<&mut Session, SessionError> {
        self.sessions
            .get_mut(session_id)
            .map(|entry| &mut entry.session)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Checks that a participant may enter `target`.
    ///
    /// A mapping to a completed or vanished session is stale and released.
    fn ensure_free(
        &mut self,
        participant_id: &ParticipantId,
        target: Option<&SessionId>,
    ) -> Result<(), SessionError> {
        let Some(current) = self.memberships.get(participant_id) else {
            return Ok(());
        };
        if Some(current) == target {
            return Ok(());
        }
        let live = self
            .get(current)
            .is_some_and(|s| !s.phase().is_terminal());
        if live {
            return Err(SessionError::AlreadyInSession {
                participant_id: participant_id.clone(),
                session_id: current.clone(),
            });
        }
        self.memberships.remove(participant_id);
        Ok(())
    }

    /// Sends an event to the session's scheduler and to subscribers.
    fn publish(&self, event: StoryEvent) {
        if let Some(entry) = self.sessions.get(event.session_id()) {
            // The scheduler may already have exited.
            let _ = entry.driver.send(event.clone());
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// =========================================================================
// Tests
// =========================================================================

fn clamp_goals(requested: usize) -> usize {
    let goals = requested.clamp(1, MAX_GOALS_PER_PLAYER);
    if goals != requested {
        tracing::warn!(requested, goals, "goals_per_player clamped");
    }
    goals
}
