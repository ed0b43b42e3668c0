//! Competitive mode for Taleweave.
//!
//! In a competitive session every participant gets a few secret goals:
//! things they want to happen in the story. When the story ends, each goal
//! is scored against the finished narrative and a leaderboard is built.
//!
//! Both steps go through the shared [`Arbiter`](taleweave_arbiter::Arbiter),
//! and both degrade instead of failing:
//!
//! - goal generation that fails or parses badly is filled from a canned
//!   list per [`Difficulty`](taleweave_protocol::Difficulty), flagged
//!   `fallback`
//! - a scoring call that fails gives that goal the minimum score with a
//!   placeholder evaluation
//!
//! This crate never touches the registry. It reads a session snapshot and
//! returns goals or scores; the caller writes them back.

mod competition;
mod goals;
mod scoring;

pub use competition::{Competition, ScoreOutcome};
pub use goals::{GOAL_TEMPLATE, MAX_GOALS_PER_PLAYER, fallback_goals, parse_goals};
pub use scoring::{SCORING_TEMPLATE, build_leaderboard, extract_score};
