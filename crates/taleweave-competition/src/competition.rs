//! The [`Competition`] service: goal generation and end-of-story scoring.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use taleweave_arbiter::{Arbiter, GenerationBackend, TemplateVars};
use taleweave_protocol::{Difficulty, Goal, LeaderboardEntry, ParticipantId};
use taleweave_session::{Participant, Session};
use tracing::{debug, info, warn};

use crate::goals::{GOAL_TEMPLATE, MAX_GOALS_PER_PLAYER, fallback_goals, parse_goals};
use crate::scoring::{RUBRIC, SCORING_TEMPLATE, build_leaderboard, extract_score};

/// Result of scoring a finished competitive story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreOutcome {
    /// Every goal, with score and evaluation filled in.
    pub goals: Vec<Goal>,
    /// Participants ranked by total score.
    pub leaderboard: Vec<LeaderboardEntry>,
}

/// Generates and scores secret goals through a shared [`Arbiter`].
///
/// Stateless apart from the arbiter handle; every method works from a
/// [`Session`] snapshot so no registry lock is held while waiting on the
/// backend.
pub struct Competition<B> {
    arbiter: Arc<Arbiter<B>>,
}

impl<B> Clone for Competition<B> {
    fn clone(&self) -> Self {
        Self {
            arbiter: Arc::clone(&self.arbiter),
        }
    }
}

impl<B: GenerationBackend> Competition<B> {
    pub fn new(arbiter: Arc<Arbiter<B>>) -> Self {
        Self { arbiter }
    }

    /// Generates exactly `count` goals for one participant.
    ///
    /// Parsed goals come first; any shortfall is filled from the fallback
    /// list, and a failed request yields the fallback list alone. Fallback
    /// goals are flagged.
    pub async fn generate_goals(
        &self,
        owner: &ParticipantId,
        name: &str,
        premise: &str,
        difficulty: Difficulty,
        count: usize,
    ) -> Vec<Goal> {
        let count = count.clamp(1, MAX_GOALS_PER_PLAYER);
        let mut variables = TemplateVars::new();
        variables.insert("player_name".into(), json!(name));
        variables.insert("story_premise".into(), json!(premise));
        variables.insert("difficulty".into(), json!(difficulty));
        variables.insert("goal_count".into(), json!(count));

        let parsed = match self.arbiter.execute(GOAL_TEMPLATE, variables).await {
            Ok(text) => parse_goals(&text, count),
            Err(e) => {
                warn!(participant_id = %owner, error = %e, "goal generation failed, using fallback goals");
                Vec::new()
            }
        };
        if parsed.len() < count {
            debug!(
                participant_id = %owner,
                parsed = parsed.len(),
                count,
                "topping up goals from fallback list"
            );
        }

        let fillers: Vec<(String, bool)> = fallback_goals(difficulty, MAX_GOALS_PER_PLAYER)
            .into_iter()
            .filter(|f| !parsed.iter().any(|p| p.eq_ignore_ascii_case(f)))
            .map(|text| (text, true))
            .collect();

        parsed
            .into_iter()
            .map(|text| (text, false))
            .chain(fillers)
            .take(count)
            .enumerate()
            .map(|(index, (text, fallback))| Goal::new(owner.clone(), index, text, fallback))
            .collect()
    }

    /// Generates goals for every participant who has none yet.
    ///
    /// Returns nothing for a session that is not competitive. Requests run
    /// concurrently; the arbiter decides how many reach the backend at once.
    pub async fn initialize(&self, session: &Session) -> Vec<(ParticipantId, Vec<Goal>)> {
        let Some(competition) = &session.competition else {
            return Vec::new();
        };
        let premise = session.seed_text();
        let pending: Vec<&Participant> = session
            .participants_in_join_order()
            .into_iter()
            .filter(|p| p.goals.is_empty())
            .collect();

        let requests = pending.iter().map(|participant| {
            self.generate_goals(
                &participant.id,
                &participant.name,
                &premise,
                competition.difficulty,
                competition.goals_per_player,
            )
        });
        let generated = join_all(requests).await;

        info!(session_id = %session.id, participants = generated.len(), "goals generated");
        pending
            .into_iter()
            .map(|p| p.id.clone())
            .zip(generated)
            .collect()
    }

    /// Generates goals for a participant who joined after the others got
    /// theirs.
    ///
    /// Returns `None` if the session is not competitive, the participant is
    /// unknown, or they already have goals.
    pub async fn add_participant(
        &self,
        session: &Session,
        participant_id: &ParticipantId,
    ) -> Option<Vec<Goal>> {
        let competition = session.competition.as_ref()?;
        let participant = session.participant(participant_id)?;
        if !participant.goals.is_empty() {
            return None;
        }
        let goals = self
            .generate_goals(
                participant_id,
                &participant.name,
                &session.seed_text(),
                competition.difficulty,
                competition.goals_per_player,
            )
            .await;
        Some(goals)
    }

    /// Scores every goal against the full narrative and ranks participants.
    ///
    /// One backend call per goal, issued concurrently. A failed call scores
    /// that goal at the minimum with a placeholder evaluation.
    pub async fn score(&self, session: &Session) -> ScoreOutcome {
        let narrative = session.full_narrative();
        let participants = session.participants_in_join_order();
        let goals: Vec<(&Participant, &Goal)> = participants
            .iter()
            .flat_map(|p| p.goals.iter().map(move |g| (*p, g)))
            .collect();

        let requests = goals
            .iter()
            .map(|(participant, goal)| self.score_goal(participant, goal, &narrative));
        let scored = join_all(requests).await;

        let leaderboard = build_leaderboard(&participants, &scored);
        info!(
            session_id = %session.id,
            goals = scored.len(),
            leader = leaderboard.first().map(|e| e.name.as_str()).unwrap_or("-"),
            "competition scored"
        );
        ScoreOutcome {
            goals: scored,
            leaderboard,
        }
    }

    async fn score_goal(&self, participant: &Participant, goal: &Goal, narrative: &str) -> Goal {
        let mut variables = TemplateVars::new();
        variables.insert("player_name".into(), json!(participant.name));
        variables.insert("goal".into(), json!(goal.text));
        variables.insert("story".into(), json!(narrative));
        variables.insert("rubric".into(), json!(RUBRIC));

        let mut scored = goal.clone();
        match self.arbiter.execute(SCORING_TEMPLATE, variables).await {
            Ok(text) => {
                let score = extract_score(&text);
                scored.record_score(score, text.trim());
            }
            Err(e) => {
                warn!(goal_id = %goal.id, error = %e, "goal scoring failed");
                scored.record_score(Goal::MIN_SCORE, format!("Scoring unavailable: {e}"));
            }
        }
        scored
    }
}
