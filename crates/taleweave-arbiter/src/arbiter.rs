//! The [`Arbiter`]: a shared, bounded gateway in front of a backend.
//!
//! # Admission
//!
//! Slots are permits of a `tokio::sync::Semaphore` sized to the cap. The
//! semaphore is fair: a released permit goes to the longest waiter, so a
//! newly arriving request can never jump the queue.
//!
//! ```text
//! execute() ──► acquire_owned() ──► permit ──► backend call (under timeout)
//!                    │
//!              cap reached: wait in FIFO order
//!
//! permit dropped ──► first waiter admitted, or the permit returns to the pool
//! ```
//!
//! Every admitted request ends in exactly one `RequestCompleted` or
//! `RequestFailed` event, including when the caller drops the future.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::{GenerationBackend, GenerationError, TemplateVars};

/// Capacity of the advisory event channel. Slow subscribers lag, they never
/// block generation.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// `error` text of the event reported when a caller drops a running request.
pub const CANCELLED: &str = "cancelled by caller";

/// Limits applied to every request through one [`Arbiter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Maximum number of backend calls running at once.
    pub max_concurrent: usize,
    /// Hard deadline for a single backend call.
    pub timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ArbiterConfig {
    /// Replaces nonsensical limits with usable ones.
    ///
    /// A cap of zero would deadlock every caller and a zero timeout would
    /// fail every call, so both fall back with a warning.
    pub fn validated(mut self) -> Self {
        if self.max_concurrent == 0 {
            warn!("arbiter max_concurrent of 0 raised to 1");
            self.max_concurrent = 1;
        }
        if self.timeout.is_zero() {
            let fallback = Self::default().timeout;
            warn!(?fallback, "arbiter timeout of 0 replaced with default");
            self.timeout = fallback;
        }
        self
    }
}

/// Advisory notifications about request traffic.
///
/// Purely observational; nothing inside the engine depends on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArbiterEvent {
    /// A request was admitted and the backend call is starting.
    RequestStarted {
        request_id: u64,
        template: String,
        in_flight: usize,
        queued: usize,
    },
    /// A backend call returned text.
    RequestCompleted {
        request_id: u64,
        template: String,
        in_flight: usize,
        elapsed_ms: u64,
    },
    /// A backend call failed or timed out.
    RequestFailed {
        request_id: u64,
        template: String,
        in_flight: usize,
        error: String,
        timed_out: bool,
    },
}

/// Cumulative request counters since the arbiter was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterMetrics {
    /// Requests admitted to the backend.
    pub requests: u64,
    /// Requests that ended in an error, timeouts included.
    pub failures: u64,
    /// Requests aborted by the timeout.
    pub timeouts: u64,
    /// Admitted requests whose caller went away before the backend answered.
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

/// Bounded-concurrency, timeout-enforcing gateway to a [`GenerationBackend`].
///
/// Share it behind an `Arc`; every method takes `&self`.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use taleweave_arbiter::{Arbiter, ArbiterConfig, ProcessBackend, ProcessBackendConfig, TemplateVars};
///
/// # async fn demo() -> Result<(), taleweave_arbiter::GenerationError> {
/// let backend = ProcessBackend::new(ProcessBackendConfig::default());
/// let arbiter = Arc::new(Arbiter::new(backend, ArbiterConfig::default()));
///
/// let text = arbiter.execute("story_continuation", TemplateVars::new()).await?;
/// println!("{text}");
/// # Ok(())
/// # }
/// ```
pub struct Arbiter<B> {
    backend: B,
    config: ArbiterConfig,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
    events: broadcast::Sender<ArbiterEvent>,
    next_request_id: AtomicU64,
    counters: Counters,
}

impl<B: GenerationBackend> Arbiter<B> {
    /// Creates an arbiter in front of `backend`.
    pub fn new(backend: B, config: ArbiterConfig) -> Self {
        let config = config.validated();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            queued: AtomicUsize::new(0),
            events,
            next_request_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Runs one generation request, waiting for a slot if the cap is reached.
    ///
    /// The slot is released on every outcome (success, failure, timeout, or
    /// the caller dropping this future), and handed to the next waiter.
    ///
    /// # Errors
    ///
    /// Whatever the backend returned, or [`GenerationError::Timeout`] if the
    /// call exceeded the configured timeout. The backend future is dropped
    /// on timeout.
    pub async fn execute(
        &self,
        template: &str,
        variables: TemplateVars,
    ) -> Result<String, GenerationError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let permit = self.acquire().await?;

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight();
        let queued = self.queued();
        debug!(request_id, template, in_flight, queued, "generation request started");
        self.emit(ArbiterEvent::RequestStarted {
            request_id,
            template: template.to_string(),
            in_flight,
            queued,
        });

        let running = Running {
            arbiter: self,
            request_id,
            template,
            started: Instant::now(),
            permit: Some(permit),
        };
        let result = match time::timeout(
            self.config.timeout,
            self.backend.invoke(template, &variables),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.config.timeout)),
        };
        running.finish(&result);
        result
    }

    /// Subscribes to advisory [`ArbiterEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.events.subscribe()
    }

    /// The limits this arbiter enforces.
    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, GenerationError> {
        let _waiting = QueueSlot::enter(&self.queued);
        if self.permits.available_permits() == 0 {
            debug!(queued = self.queued(), "generation request queued");
        }
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| GenerationError::Closed)
    }
}

impl<B> Arbiter<B> {
    /// Number of backend calls currently running.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Number of requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Cumulative request counters.
    pub fn metrics(&self) -> ArbiterMetrics {
        ArbiterMetrics {
            requests: self.counters.requests.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, event: ArbiterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Counts a request as queued until it is admitted or abandoned.
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn enter(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self(queued)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An admitted request. Holds the permit until the outcome is reported;
/// dropped without [`finish`](Self::finish), it reports a cancellation.
struct Running<'a, B> {
    arbiter: &'a Arbiter<B>,
    request_id: u64,
    template: &'a str,
    started: Instant,
    permit: Option<OwnedSemaphorePermit>,
}

impl<B> Running<'_, B> {
    fn finish(mut self, result: &Result<String, GenerationError>) {
        // Release before reporting so the event shows the freed slot.
        drop(self.permit.take());
        let arbiter = self.arbiter;
        let (request_id, template) = (self.request_id, self.template);
        let in_flight = arbiter.in_flight();
        match result {
            Ok(_) => {
                let elapsed_ms = self.started.elapsed().as_millis() as u64;
                debug!(request_id, template, elapsed_ms, "generation request completed");
                arbiter.emit(ArbiterEvent::RequestCompleted {
                    request_id,
                    template: template.to_string(),
                    in_flight,
                    elapsed_ms,
                });
            }
            Err(e) => {
                arbiter.counters.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_timeout() {
                    arbiter.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                warn!(request_id, template, error = %e, "generation request failed");
                arbiter.emit(ArbiterEvent::RequestFailed {
                    request_id,
                    template: template.to_string(),
                    in_flight,
                    error: e.to_string(),
                    timed_out: e.is_timeout(),
                });
            }
        }
    }
}

impl<B> Drop for Running<'_, B> {
    fn drop(&mut self) {
        // `finish` already reported.
        let Some(permit) = self.permit.take() else {
            return;
        };
        drop(permit);
        let arbiter = self.arbiter;
        arbiter.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(
            request_id = self.request_id,
            template = self.template,
            "generation request cancelled by caller"
        );
        arbiter.emit(ArbiterEvent::RequestFailed {
            request_id: self.request_id,
            template: self.template.to_string(),
            in_flight: arbiter.in_flight(),
            error: CANCELLED.to_string(),
            timed_out: false,
        });
    }
}
