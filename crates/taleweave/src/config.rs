//! Engine-wide configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taleweave_arbiter::ArbiterConfig;
use taleweave_cadence::CadenceConfig;
use taleweave_competition::MAX_GOALS_PER_PLAYER;
use taleweave_session::{CleanupPolicy, StoryConfig};

/// Everything a [`StoryEngine`](crate::StoryEngine) needs, with defaults.
///
/// Deserializes from any serde format; missing fields keep their defaults.
/// Loading it from a file is left to the caller.
///
/// ```rust
/// use taleweave::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.story.max_participants, 8);
/// assert_eq!(config.arbiter.max_concurrent, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for new sessions.
    pub story: StoryConfig,
    /// Concurrency cap and timeout for backend calls.
    pub arbiter: ArbiterConfig,
    /// Retention windows and sweep interval.
    pub cleanup: CleanupPolicy,
    /// Random delay added to each cadence tick. Zero disables it.
    pub cadence_jitter: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            story: StoryConfig::default(),
            arbiter: ArbiterConfig::default(),
            cleanup: CleanupPolicy::default(),
            cadence_jitter: Duration::ZERO,
        }
    }
}

impl EngineConfig {
    /// Replaces values the engine cannot run with, logging each change.
    pub fn validated(mut self) -> Self {
        self.story = validated_story(self.story);
        self.arbiter = self.arbiter.validated();
        if self.cleanup.sweep_interval.is_zero() {
            let fallback = CleanupPolicy::default().sweep_interval;
            tracing::warn!(?fallback, "sweep_interval of 0 replaced with default");
            self.cleanup.sweep_interval = fallback;
        }
        self
    }

    pub(crate) fn cadence(&self) -> CadenceConfig {
        CadenceConfig {
            cadence_jitter: self.cadence_jitter,
            ..CadenceConfig::default()
        }
    }
}

/// Clamps a session config to values the scheduler can honor.
pub(crate) fn validated_story(mut story: StoryConfig) -> StoryConfig {
    let defaults = StoryConfig::default();
    if story.cadence_interval.is_zero() {
        tracing::warn!(fallback = ?defaults.cadence_interval, "cadence_interval of 0 replaced with default");
        story.cadence_interval = defaults.cadence_interval;
    }
    if story.retry_backoff.is_zero() {
        tracing::warn!(fallback = ?defaults.retry_backoff, "retry_backoff of 0 replaced with default");
        story.retry_backoff = defaults.retry_backoff;
    }
    if story.max_participants == 0 {
        tracing::warn!("max_participants of 0 raised to 1");
        story.max_participants = 1;
    }
    if story.context_segments == 0 {
        tracing::warn!("context_segments of 0 raised to 1");
        story.context_segments = 1;
    }
    let goals = story
        .competition
        .goals_per_player
        .clamp(1, MAX_GOALS_PER_PLAYER);
    if goals != story.competition.goals_per_player {
        tracing::warn!(
            requested = story.competition.goals_per_player,
            goals,
            "goals_per_player clamped"
        );
        story.competition.goals_per_player = goals;
    }
    story
}
