//! Generation request arbitration for Taleweave.
//!
//! Every piece of generated text (story segments, conclusions, competitive
//! goals, goal scores) goes through one [`Arbiter`]. It enforces two things
//! across all sessions at once:
//!
//! 1. **A concurrency cap**: at most `max_concurrent` backend calls run at
//!    the same time. Everyone else waits in a FIFO queue.
//! 2. **A hard timeout**: each call is abandoned after `timeout`, its slot
//!    is released, and the next queued request is admitted.
//!
//! The arbiter knows nothing about sessions. Callers hand it a template name
//! and a bag of variables; it hands back text or a [`GenerationError`].
//!
//! # Backends
//!
//! The actual generation is behind the [`GenerationBackend`] trait. The
//! crate ships [`ProcessBackend`], which talks JSON to a bridge subprocess;
//! tests use in-memory fakes.

mod arbiter;
mod backend;
mod error;
mod process;

pub use arbiter::{Arbiter, ArbiterConfig, ArbiterEvent, ArbiterMetrics, CANCELLED};
pub use backend::{GenerationBackend, TemplateVars};
pub use error::GenerationError;
pub use process::{ProcessBackend, ProcessBackendConfig};
