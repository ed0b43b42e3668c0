//! Score extraction and ranking.

use std::sync::LazyLock;

use regex::Regex;
use taleweave_protocol::{Goal, LeaderboardEntry};
use taleweave_session::Participant;

/// Template used to score one goal against the narrative.
pub const SCORING_TEMPLATE: &str = "goal_scoring";

/// The rubric handed to the backend with every scoring request.
pub(crate) const RUBRIC: &str = "Score how well the story achieved the goal. \
3 = the goal happened exactly as written. \
2 = the goal partially happened or happened in spirit. \
1 = the goal did not happen. \
Answer with a line of the form `Score: N` followed by a one-sentence explanation.";

static LABELLED_SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\s*[:=]\s*\**\s*([1-3])\b").expect("score pattern is valid")
});

static BARE_SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([1-3])\b").expect("digit pattern is valid"));

/// Pulls a 1–3 score out of a scoring response.
///
/// A `Score: N` label wins; otherwise the first standalone 1, 2 or 3;
/// otherwise the minimum.
pub fn extract_score(text: &str) -> u8 {
    LABELLED_SCORE
        .captures(text)
        .or_else(|| BARE_SCORE.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(Goal::MIN_SCORE)
}

/// Ranks participants by total goal score, highest first.
///
/// `participants` must be in join order; ties keep that order.
pub fn build_leaderboard(participants: &[&Participant], scored: &[Goal]) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = participants
        .iter()
        .map(|participant| {
            let goals: Vec<Goal> = scored
                .iter()
                .filter(|goal| goal.owner == participant.id)
                .cloned()
                .collect();
            LeaderboardEntry {
                rank: 0,
                participant_id: participant.id.clone(),
                name: participant.name.clone(),
                total_score: goals.iter().map(|g| u32::from(g.score.unwrap_or(0))).sum(),
                goals_achieved: goals.iter().filter(|g| g.achieved).count(),
                goals,
            }
        })
        .collect();

    // Stable: equal totals stay in join order.
    entries.sort_by(|a, b| b.total_score.cmp(&a.total_score));
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index + 1;
    }
    entries
}
