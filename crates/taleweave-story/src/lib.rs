//! The story scheduler for Taleweave.
//!
//! Each session gets one driver task (actor model) that owns its timers
//! and decides when to ask the backend for the next piece of the story:
//!
//! 1. **Seeding**: wait for the seeding window; start if anyone seeded,
//!    otherwise extend once by the grace period, then start regardless.
//! 2. **Cadence**: generate the first segment immediately, then one per
//!    cadence interval, until the active-time budget runs out.
//! 3. **Conclusion**: generate the closing segment, complete the story,
//!    and score the competition if there is one.
//!
//! # Key types
//!
//! - [`StoryDirector`]: spawns drivers and routes manual controls to them
//! - [`DriverHandle`]: send commands to a running driver
//! - [`DriverStatus`]: a driver's view of its session
//! - [`build_prompt`]: turns a session snapshot into a generation request

mod director;
mod driver;
mod error;
mod prompt;

use std::sync::Arc;

use taleweave_session::SessionRegistry;

pub use director::StoryDirector;
pub use driver::{DriverHandle, DriverStatus};
pub use error::StoryError;
pub use prompt::{
    CONCLUSION_TEMPLATE, CONTINUATION_TEMPLATE, PLAYER_INPUT_TEMPLATE,
    PromptPlan, RequestKind, build_prompt,
};

/// The registry as shared between the engine and every driver.
///
/// Locked briefly for each state change; never held across a generation
/// request.
pub type SharedRegistry = Arc<tokio::sync::Mutex<SessionRegistry>>;
