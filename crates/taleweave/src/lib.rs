//! # Taleweave
//!
//! Session orchestration for time-boxed, collaborative storytelling.
//!
//! A group of participants seeds a premise, keeps contributing while the
//! story runs, and a generative backend writes the next segment on a fixed
//! cadence until the time budget runs out and a conclusion is written.
//! Sessions can be competitive: everyone gets secret goals, scored against
//! the finished story.
//!
//! The engine owns the state machine, the scheduling and the backend
//! traffic. Transports, rendering and file handling sit outside and talk to
//! it through [`StoryEngine`] and the [`StoryEvent`](taleweave_protocol::StoryEvent)
//! stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taleweave::prelude::*;
//!
//! # async fn demo() -> Result<(), TaleweaveError> {
//! taleweave::init_tracing();
//!
//! let backend = ProcessBackend::new(ProcessBackendConfig::default());
//! let engine = StoryEngineBuilder::new().build(backend);
//! let mut events = engine.subscribe().await;
//!
//! let session_id = engine
//!     .create_session(ParticipantId::from("p1"), "Ada", "cli")
//!     .await?;
//! engine
//!     .submit_input(&session_id, &ParticipantId::from("p1"), ContributionKind::Seed, "A lighthouse")
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", String::from_utf8_lossy(&JsonCodec.encode(&event)?));
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod logging;

pub use config::EngineConfig;
pub use engine::{StoryEngine, StoryEngineBuilder};
pub use error::TaleweaveError;
pub use logging::{DEFAULT_LOG_FILTER, init_tracing};

/// Everything needed to embed the engine, in one import.
pub mod prelude {
    pub use crate::{EngineConfig, StoryEngine, StoryEngineBuilder, TaleweaveError};

    pub use taleweave_arbiter::{
        ArbiterConfig, ArbiterEvent, GenerationBackend, GenerationError, ProcessBackend,
        ProcessBackendConfig, TemplateVars,
    };
    pub use taleweave_competition::{GOAL_TEMPLATE, SCORING_TEMPLATE};
    pub use taleweave_protocol::{
        Codec, ContributionKind, Difficulty, Goal, JsonCodec, LeaderboardEntry, ParticipantId,
        Recipient, Segment, SegmentNumber, SessionId, SessionSummary, StoryEvent, StoryPhase,
    };
    pub use taleweave_session::{
        CleanupPolicy, CompetitionConfig, JoinOutcome, Session, SessionError, StoryConfig,
    };
    pub use taleweave_story::{
        CONCLUSION_TEMPLATE, CONTINUATION_TEMPLATE, DriverStatus, PLAYER_INPUT_TEMPLATE, StoryError,
    };
}
