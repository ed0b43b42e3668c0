//! Story timing for Taleweave.
//!
//! Two pieces, both owned by a session's scheduler task:
//!
//! - [`CadenceTimer`]: a single alarm. At any moment it holds at most one
//!   "next wake" and the reason for it ([`WakeReason`]). Arming replaces
//!   whatever was armed before, so there is never more than one pending
//!   timer per session.
//! - [`StoryBudget`]: how much active story time has been used. Paused
//!   time (nobody connected) does not count.
//!
//! # Integration
//!
//! The timer sits inside the scheduler's `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(event) = events.recv() => { /* may arm, park, or unpark */ }
//!         wake = timer.wait() => match wake.reason {
//!             WakeReason::SeedingExpired => { /* start or extend */ }
//!             WakeReason::CadenceTick | WakeReason::Skip => { /* generate */ }
//!             WakeReason::Retry => { /* retry the failed request */ }
//!         }
//!     }
//! }
//! ```
//!
//! `wait()` is cancel-safe: if another branch wins, the alarm stays armed.

use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Why the timer woke the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeReason {
    /// The seeding window (or its grace extension) ran out.
    SeedingExpired,
    /// Time for the next regular segment.
    CadenceTick,
    /// Retry a generation that failed.
    Retry,
    /// A participant asked to skip ahead.
    Skip,
}

impl std::fmt::Display for WakeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SeedingExpired => write!(f, "seeding_expired"),
            Self::CadenceTick => write!(f, "cadence_tick"),
            Self::Retry => write!(f, "retry"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Tuning for a [`CadenceTimer`].
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    /// Random delay (0–max) added to cadence ticks so sessions created
    /// together do not hit the backend in lockstep. Zero disables it.
    pub cadence_jitter: Duration,
    /// A wake later than this is logged as an overrun.
    pub late_warn_threshold: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            cadence_jitter: Duration::ZERO,
            late_warn_threshold: Duration::from_secs(1),
        }
    }
}

/// Returned by [`CadenceTimer::wait`] when the alarm fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub reason: WakeReason,
    /// How far past the deadline the wake happened.
    pub late_by: Duration,
    /// Number of wakes so far, this one included.
    pub count: u64,
}

// ---------------------------------------------------------------------------
// CadenceTimer
// ---------------------------------------------------------------------------

/// A single-slot alarm with park/unpark.
///
/// ```text
///         arm()/trigger_now()                 wait() resolves
/// [Idle] ───────────────────→ [Armed] ────────────────────→ [Idle]
///   ↑                            │
///   │       park()               ▼ park()
///   └──── unpark() ◄──────── [Parked]
/// ```
///
/// A parked timer remembers the reason it was parked with; `unpark` re-arms
/// that reason exactly once.
#[derive(Debug)]
pub struct CadenceTimer {
    config: CadenceConfig,
    deadline: Option<Instant>,
    reason: Option<WakeReason>,
    parked: Option<WakeReason>,
    wakes: u64,
    late_wakes: u64,
}

impl CadenceTimer {
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            config,
            deadline: None,
            reason: None,
            parked: None,
            wakes: 0,
            late_wakes: 0,
        }
    }

    /// Arms the alarm to fire `after` from now, replacing anything armed
    /// or parked.
    pub fn arm(&mut self, reason: WakeReason, after: Duration) {
        let jitter = if reason == WakeReason::CadenceTick {
            self.jitter()
        } else {
            Duration::ZERO
        };
        self.deadline = Some(Instant::now() + after + jitter);
        self.reason = Some(reason);
        self.parked = None;
        trace!(%reason, after_ms = (after + jitter).as_millis() as u64, "alarm armed");
    }

    /// Arms the alarm to fire on the next `wait()`.
    pub fn trigger_now(&mut self, reason: WakeReason) {
        self.deadline = Some(Instant::now());
        self.reason = Some(reason);
        self.parked = None;
        trace!(%reason, "alarm triggered");
    }

    /// Clears the alarm. Returns the reason that was armed, if any.
    pub fn disarm(&mut self) -> Option<WakeReason> {
        self.deadline = None;
        self.parked = None;
        self.reason.take()
    }

    /// Parks the timer: nothing fires until [`unpark`](Self::unpark).
    ///
    /// Returns `false` if it was already parked.
    pub fn park(&mut self, reason: WakeReason) -> bool {
        if self.parked.is_some() {
            return false;
        }
        self.deadline = None;
        self.reason = None;
        self.parked = Some(reason);
        debug!(%reason, "timer parked");
        true
    }

    /// Re-arms the parked reason to fire `after` from now.
    ///
    /// Returns `false` if the timer was not parked, so repeated calls
    /// re-arm only once.
    pub fn unpark(&mut self, after: Duration) -> bool {
        let Some(reason) = self.parked.take() else {
            return false;
        };
        self.arm(reason, after);
        debug!(%reason, "timer unparked");
        true
    }

    pub fn is_parked(&self) -> bool {
        self.parked.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The reason the alarm is armed with.
    pub fn armed_reason(&self) -> Option<WakeReason> {
        self.reason
    }

    /// Time until the alarm fires, `None` if not armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Total wakes delivered.
    pub fn wake_count(&self) -> u64 {
        self.wakes
    }

    /// Wakes that fired later than the warning threshold.
    pub fn late_wake_count(&self) -> u64 {
        self.late_wakes
    }

    /// Waits for the alarm.
    ///
    /// Pends forever while nothing is armed or the timer is parked, which
    /// lets `tokio::select!` service its other branches.
    pub async fn wait(&mut self) -> Wake {
        let (deadline, reason) = match (self.deadline, self.reason) {
            (Some(deadline), Some(reason)) if self.parked.is_none() => (deadline, reason),
            _ => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        time::sleep_until(deadline).await;

        self.deadline = None;
        self.reason = None;
        self.wakes += 1;

        let late_by = Instant::now().saturating_duration_since(deadline);
        if late_by > self.config.late_warn_threshold {
            self.late_wakes += 1;
            warn!(
                %reason,
                late_ms = late_by.as_millis() as u64,
                "timer fired late"
            );
        }
        trace!(%reason, wake = self.wakes, "timer fired");

        Wake {
            reason,
            late_by,
            count: self.wakes,
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.config.cadence_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }
}

impl Default for CadenceTimer {
    fn default() -> Self {
        Self::new(CadenceConfig::default())
    }
}

// ---------------------------------------------------------------------------
// StoryBudget
// ---------------------------------------------------------------------------

/// Active story time, excluding paused spans.
///
/// ```text
/// new() ─start()→ running ─pause()→ paused ─resume()→ running ...
/// ```
#[derive(Debug, Clone)]
pub struct StoryBudget {
    total: Duration,
    consumed: Duration,
    running_since: Option<Instant>,
    started: bool,
}

impl StoryBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            consumed: Duration::ZERO,
            running_since: None,
            started: false,
        }
    }

    /// Starts counting. Later calls do nothing.
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.running_since = Some(Instant::now());
        }
    }

    /// Stops counting until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.consumed += since.elapsed();
            debug!(
                consumed_secs = self.consumed.as_secs(),
                "story budget paused"
            );
        }
    }

    /// Resumes counting after a pause. Does nothing before `start`.
    pub fn resume(&mut self) {
        if self.started && self.running_since.is_none() {
            self.running_since = Some(Instant::now());
            debug!(
                consumed_secs = self.consumed.as_secs(),
                "story budget resumed"
            );
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_paused(&self) -> bool {
        self.started && self.running_since.is_none()
    }

    /// Active time used so far.
    pub fn elapsed(&self) -> Duration {
        self.consumed
            + self
                .running_since
                .map(|since| since.elapsed())
                .unwrap_or(Duration::ZERO)
    }

    /// Active time left. Never increases.
    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    /// `true` once a started budget has nothing left.
    pub fn is_exhausted(&self) -> bool {
        self.started && self.remaining().is_zero()
    }
}
