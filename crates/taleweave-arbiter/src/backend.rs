//! The backend seam: where generated text actually comes from.

use std::future::Future;
use std::sync::Arc;

use crate::GenerationError;

/// Variables passed to a generation template, as a JSON object.
pub type TemplateVars = serde_json::Map<String, serde_json::Value>;

/// Produces text for a named template.
///
/// The engine does not care how this happens: a local subprocess, a remote
/// HTTP service, a canned fake in tests. Any non-success outcome, including
/// a response that cannot be interpreted, must come back as an `Err`.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → one backend instance is shared by every
///   session's scheduler task through the [`Arbiter`](crate::Arbiter).
/// - The returned future is `Send` so callers can run it inside spawned
///   Tokio tasks.
///
/// Dropping the returned future must abort the call. The arbiter relies on
/// this to enforce its timeout.
pub trait GenerationBackend: Send + Sync + 'static {
    /// Renders `template` with `variables` and returns the generated text.
    fn invoke(
        &self,
        template: &str,
        variables: &TemplateVars,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;
}

impl<B: GenerationBackend> GenerationBackend for Arc<B> {
    fn invoke(
        &self,
        template: &str,
        variables: &TemplateVars,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send {
        self.as_ref().invoke(template, variables)
    }
}
