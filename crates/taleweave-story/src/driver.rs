//! Session driver: one Tokio task per session that schedules generation.
//!
//! The driver owns the session's alarm, its active-time budget, and at most
//! one in-flight generation request. All session state stays in the
//! registry; the driver reads snapshots and writes results back through it,
//! holding the lock only between awaits.
//!
//! When the session is removed, a running request is left to finish and its
//! text is dropped. Only an explicit shutdown aborts it.

use std::sync::Arc;
use std::time::Duration;

use taleweave_arbiter::{Arbiter, GenerationBackend, GenerationError};
use taleweave_cadence::{CadenceConfig, CadenceTimer, StoryBudget, Wake, WakeReason};
use taleweave_competition::Competition;
use taleweave_protocol::{ParticipantId, SessionId, StoryEvent, StoryPhase};
use taleweave_session::{SessionError, StoryConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::{PromptPlan, RequestKind, SharedRegistry, StoryError, build_prompt};

/// Commands sent to a driver through its handle.
pub(crate) enum DriverCommand {
    /// Fire the next generation now.
    Skip { reply: oneshot::Sender<bool> },

    /// End seeding now, seeds or not.
    ForceStart { reply: oneshot::Sender<bool> },

    /// Report the driver's view of the session.
    Status { reply: oneshot::Sender<DriverStatus> },

    /// Stop the driver. Any in-flight request is aborted.
    Shutdown,
}

/// A driver's view of its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub session_id: SessionId,
    pub phase: StoryPhase,
    /// A generation request is in flight.
    pub generating: bool,
    /// Nobody is connected; the story is on hold until someone returns.
    pub parked: bool,
    /// What the alarm will do next, if armed.
    pub armed: Option<WakeReason>,
    pub next_wake_in: Option<Duration>,
    /// Active story time left before the conclusion.
    pub budget_remaining: Duration,
    pub segments_generated: usize,
    /// Failed generation attempts so far, retried or not.
    pub failed_attempts: u64,
}

/// Handle to a running driver.
///
/// Cheap to clone; the [`StoryDirector`](crate::StoryDirector) keeps one per
/// session.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    session_id: SessionId,
    sender: mpsc::Sender<DriverCommand>,
}

impl DriverHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Requests the next segment immediately.
    ///
    /// Returns `false` if the story is not active or a request is already
    /// in flight.
    pub async fn skip(&self) -> Result<bool, StoryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DriverCommand::Skip { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| StoryError::Unavailable(self.session_id.clone()))
    }

    /// Ends seeding immediately.
    ///
    /// Returns `false` if the story has already started.
    pub async fn force_start(&self) -> Result<bool, StoryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DriverCommand::ForceStart { reply: reply_tx })
            .await?;
        reply_rx
            .await
            .map_err(|_| StoryError::Unavailable(self.session_id.clone()))
    }

    pub async fn status(&self) -> Result<DriverStatus, StoryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DriverCommand::Status { reply: reply_tx }).await?;
        reply_rx
            .await
            .map_err(|_| StoryError::Unavailable(self.session_id.clone()))
    }

    /// Tells the driver to stop.
    pub async fn shutdown(&self) -> Result<(), StoryError> {
        self.send(DriverCommand::Shutdown).await
    }

    /// `true` once the driver task has exited.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, command: DriverCommand) -> Result<(), StoryError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| StoryError::Unavailable(self.session_id.clone()))
    }
}

/// What every driver shares: the registry, the arbiter, and the
/// competition service built on it.
pub(crate) struct DriverContext<B> {
    pub(crate) registry: SharedRegistry,
    pub(crate) arbiter: Arc<Arbiter<B>>,
    pub(crate) competition: Competition<B>,
    pub(crate) cadence: CadenceConfig,
}

impl<B> Clone for DriverContext<B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            arbiter: Arc::clone(&self.arbiter),
            competition: self.competition.clone(),
            cadence: self.cadence.clone(),
        }
    }
}

/// The generation request currently running for a session.
struct InFlight {
    plan: PromptPlan,
    task: JoinHandle<Result<String, GenerationError>>,
}

/// The driver task's state.
struct SessionDriver<B> {
    session_id: SessionId,
    context: DriverContext<B>,
    config: StoryConfig,
    events: mpsc::UnboundedReceiver<StoryEvent>,
    commands: mpsc::Receiver<DriverCommand>,
    timer: CadenceTimer,
    budget: StoryBudget,
    in_flight: Option<InFlight>,
    /// Goal generation runs beside the cadence loop.
    background: JoinSet<()>,
    phase: StoryPhase,
    force_start: bool,
    grace_used: bool,
    /// Set when the failed request was the conclusion, so the retry asks
    /// for the conclusion again.
    retry_kind: Option<RequestKind>,
    segments_generated: usize,
    failed_attempts: u64,
    finished: bool,
    /// Set by an explicit shutdown; only then are running requests aborted.
    shutting_down: bool,
}

impl<B: GenerationBackend> SessionDriver<B> {
    async fn run(mut self) {
        tracing::info!(session_id = %self.session_id, "story driver started");
        self.timer
            .arm(WakeReason::SeedingExpired, self.config.seeding_duration);

        while !self.finished {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::debug!(session_id = %self.session_id, "session event channel closed");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Shutdown) => {
                        tracing::info!(session_id = %self.session_id, "story driver shutting down");
                        self.shutting_down = true;
                        break;
                    }
                    None => {
                        tracing::debug!(session_id = %self.session_id, "driver handles dropped");
                        break;
                    }
                    Some(command) => self.on_command(command),
                },
                result = join_in_flight(&mut self.in_flight) => {
                    if let Some(request) = self.in_flight.take() {
                        self.on_generated(request.plan, result).await;
                    }
                },
                wake = self.timer.wait() => self.on_wake(wake).await,
                Some(joined) = self.background.join_next() => {
                    self.log_background(joined);
                }
            }
        }

        if self.shutting_down {
            if let Some(request) = self.in_flight.take() {
                request.task.abort();
            }
            self.background.abort_all();
        } else {
            if let Some(request) = self.in_flight.take() {
                discard_late(self.session_id.clone(), request);
            }
            self.background.detach_all();
        }
        tracing::info!(
            session_id = %self.session_id,
            segments = self.segments_generated,
            "story driver stopped"
        );
    }

    // =====================================================================
    // Session events
    // =====================================================================

    async fn on_event(&mut self, event: StoryEvent) {
        match event {
            StoryEvent::StoryStarted { .. } => {
                self.phase = StoryPhase::Active;
                self.timer.disarm();
                self.budget.start();
                if self.is_competitive().await {
                    self.spawn_goal_assignment(None);
                }
                self.request(RequestKind::Segment).await;
            }
            StoryEvent::PlayerJoined { participant_id, .. }
            | StoryEvent::PlayerReconnected { participant_id, .. } => {
                if self.timer.unpark(Duration::ZERO) {
                    self.budget.resume();
                    tracing::info!(
                        session_id = %self.session_id,
                        %participant_id,
                        "participant back, story resumed"
                    );
                }
                if self.phase == StoryPhase::Active && self.is_competitive().await {
                    self.spawn_goal_assignment(Some(participant_id));
                }
            }
            StoryEvent::StoryCompleted { .. } => {
                self.phase = StoryPhase::Completed;
                self.timer.disarm();
                self.finished = true;
            }
            StoryEvent::SessionRemoved { .. } => {
                self.finished = true;
            }
            _ => {}
        }
    }

    // =====================================================================
    // Commands
    // =====================================================================

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Skip { reply } => {
                let accepted =
                    self.phase == StoryPhase::Active && self.in_flight.is_none();
                if accepted {
                    self.timer.trigger_now(WakeReason::Skip);
                    tracing::info!(session_id = %self.session_id, "skip requested");
                } else {
                    tracing::debug!(session_id = %self.session_id, "skip ignored");
                }
                let _ = reply.send(accepted);
            }
            DriverCommand::ForceStart { reply } => {
                let accepted = self.phase == StoryPhase::Seeding;
                if accepted {
                    self.force_start = true;
                    self.timer.trigger_now(WakeReason::SeedingExpired);
                    tracing::info!(session_id = %self.session_id, "force start requested");
                }
                let _ = reply.send(accepted);
            }
            DriverCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            DriverCommand::Shutdown => {}
        }
    }

    fn status(&self) -> DriverStatus {
        DriverStatus {
            session_id: self.session_id.clone(),
            phase: self.phase,
            generating: self.in_flight.is_some(),
            parked: self.timer.is_parked(),
            armed: self.timer.armed_reason(),
            next_wake_in: self.timer.remaining(),
            budget_remaining: self.budget.remaining(),
            segments_generated: self.segments_generated,
            failed_attempts: self.failed_attempts,
        }
    }

    // =====================================================================
    // Alarm
    // =====================================================================

    async fn on_wake(&mut self, wake: Wake) {
        tracing::debug!(session_id = %self.session_id, reason = %wake.reason, "driver woke");
        match wake.reason {
            WakeReason::SeedingExpired => self.on_seeding_expired().await,
            WakeReason::CadenceTick | WakeReason::Retry | WakeReason::Skip => {
                self.on_cadence(wake.reason).await
            }
        }
    }

    async fn on_seeding_expired(&mut self) {
        if self.phase != StoryPhase::Seeding {
            return;
        }
        let mut registry = self.context.registry.lock().await;
        let Some(session) = registry.get(&self.session_id) else {
            self.finished = true;
            return;
        };
        let seeds = session.pending.seeds.len();

        if seeds == 0 && !self.force_start && !self.grace_used {
            self.grace_used = true;
            self.timer
                .arm(WakeReason::SeedingExpired, self.config.seeding_grace);
            let _ = registry.update_timing(
                &self.session_id,
                self.budget.remaining(),
                self.config.seeding_grace,
            );
            tracing::info!(
                session_id = %self.session_id,
                grace_secs = self.config.seeding_grace.as_secs(),
                "no seeds yet, seeding extended"
            );
            return;
        }

        if seeds == 0 {
            tracing::info!(session_id = %self.session_id, "starting without seeds");
        }
        // The driver picks up the StoryStarted event on its next turn.
        if let Err(e) = registry.start_story(&self.session_id) {
            tracing::warn!(session_id = %self.session_id, error = %e, "could not start story");
            self.finished = matches!(e, SessionError::NotFound(_));
        }
    }

    async fn on_cadence(&mut self, reason: WakeReason) {
        if self.phase != StoryPhase::Active || self.in_flight.is_some() {
            return;
        }
        let connected = {
            let registry = self.context.registry.lock().await;
            match registry.get(&self.session_id) {
                Some(session) => session.connected_count(),
                None => {
                    self.finished = true;
                    return;
                }
            }
        };
        if connected == 0 && reason != WakeReason::Skip {
            if self.timer.park(reason) {
                self.budget.pause();
                tracing::info!(session_id = %self.session_id, "nobody connected, story paused");
            }
            return;
        }

        let kind = if self.budget.is_exhausted()
            || self.retry_kind == Some(RequestKind::Conclusion)
        {
            RequestKind::Conclusion
        } else {
            RequestKind::Segment
        };
        self.request(kind).await;
    }

    // =====================================================================
    // Generation
    // =====================================================================

    /// Builds the next request from a fresh snapshot and starts it.
    async fn request(&mut self, kind: RequestKind) {
        if self.in_flight.is_some() {
            return;
        }
        let plan = {
            let mut registry = self.context.registry.lock().await;
            let Some(session) = registry.get(&self.session_id) else {
                self.finished = true;
                return;
            };
            if session.phase() != StoryPhase::Active {
                return;
            }
            let plan = build_prompt(session, kind);
            let _ = registry.update_timing(
                &self.session_id,
                self.budget.remaining(),
                Duration::ZERO,
            );
            plan
        };

        tracing::debug!(
            session_id = %self.session_id,
            template = plan.template,
            direct = plan.inputs.direct,
            influence = plan.inputs.influence,
            "generation requested"
        );
        let arbiter = Arc::clone(&self.context.arbiter);
        let template = plan.template;
        let variables = plan.variables.clone();
        let task = tokio::spawn(async move { arbiter.execute(template, variables).await });
        self.in_flight = Some(InFlight { plan, task });
    }

    async fn on_generated(&mut self, plan: PromptPlan, result: Result<String, GenerationError>) {
        let result = result.and_then(|text| {
            let text = text.trim();
            if text.is_empty() {
                Err(GenerationError::MalformedResponse("empty text".into()))
            } else {
                Ok(text.to_string())
            }
        });

        match result {
            Ok(text) => self.on_segment(plan, text).await,
            Err(e) => {
                self.failed_attempts += 1;
                self.retry_kind = Some(plan.kind);
                self.timer
                    .arm(WakeReason::Retry, self.config.retry_backoff);
                tracing::warn!(
                    session_id = %self.session_id,
                    template = plan.template,
                    error = %e,
                    retry_secs = self.config.retry_backoff.as_secs(),
                    "generation failed, will retry"
                );
                let mut registry = self.context.registry.lock().await;
                let _ = registry.update_timing(
                    &self.session_id,
                    self.budget.remaining(),
                    self.config.retry_backoff,
                );
            }
        }
    }

    async fn on_segment(&mut self, plan: PromptPlan, text: String) {
        let appended = {
            let mut registry = self.context.registry.lock().await;
            registry.append_segment(&self.session_id, plan.draft(text))
        };
        if let Err(e) = appended {
            tracing::debug!(session_id = %self.session_id, error = %e, "generated segment discarded");
            self.finished = matches!(e, SessionError::NotFound(_) | SessionError::Closed(_));
            return;
        }
        self.retry_kind = None;
        self.segments_generated += 1;

        if plan.kind == RequestKind::Conclusion {
            self.conclude().await;
            return;
        }
        if self.budget.is_exhausted() {
            tracing::info!(session_id = %self.session_id, "story time spent, concluding");
            self.request(RequestKind::Conclusion).await;
            return;
        }

        self.timer
            .arm(WakeReason::CadenceTick, self.config.cadence_interval);
        let mut registry = self.context.registry.lock().await;
        let _ = registry.update_timing(
            &self.session_id,
            self.budget.remaining(),
            self.config.cadence_interval,
        );
    }

    /// Completes the story, then scores the competition if there is one.
    async fn conclude(&mut self) {
        self.phase = StoryPhase::Completed;
        self.timer.disarm();
        if let Err(e) = self
            .context
            .registry
            .lock()
            .await
            .complete_story(&self.session_id)
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "could not complete story");
        }

        // Goals still being generated must land before scoring.
        while let Some(joined) = self.background.join_next().await {
            self.log_background(joined);
        }

        let snapshot = self
            .context
            .registry
            .lock()
            .await
            .snapshot(&self.session_id);
        if let Some(session) = snapshot.filter(|s| s.is_competitive()) {
            let outcome = self.context.competition.score(&session).await;
            let mut registry = self.context.registry.lock().await;
            if let Err(e) =
                registry.record_scores(&self.session_id, outcome.goals, outcome.leaderboard)
            {
                tracing::warn!(session_id = %self.session_id, error = %e, "could not record scores");
            }
        }
        self.finished = true;
    }

    // =====================================================================
    // Competition
    // =====================================================================

    async fn is_competitive(&self) -> bool {
        self.context
            .registry
            .lock()
            .await
            .get(&self.session_id)
            .is_some_and(|s| s.is_competitive())
    }

    /// Generates and assigns goals in the background: for everyone without
    /// goals, or for one late joiner.
    fn spawn_goal_assignment(&mut self, participant: Option<ParticipantId>) {
        let context = self.context.clone();
        let session_id = self.session_id.clone();
        self.background.spawn(async move {
            let snapshot = context.registry.lock().await.snapshot(&session_id);
            let Some(snapshot) = snapshot else {
                return;
            };
            let assigned = match participant {
                None => context.competition.initialize(&snapshot).await,
                Some(participant_id) => context
                    .competition
                    .add_participant(&snapshot, &participant_id)
                    .await
                    .map(|goals| vec![(participant_id, goals)])
                    .unwrap_or_default(),
            };

            let mut registry = context.registry.lock().await;
            for (participant_id, goals) in assigned {
                match registry.assign_goals(&session_id, &participant_id, goals) {
                    Ok(_) => {}
                    Err(SessionError::NotFound(_)) => {
                        tracing::debug!(%session_id, "session gone, goals discarded");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(%session_id, %participant_id, error = %e, "could not assign goals");
                    }
                }
            }
        });
    }

    fn log_background(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                tracing::warn!(session_id = %self.session_id, error = %e, "goal task failed");
            }
        }
    }
}

/// Resolves with the in-flight request's result; pends while there is none.
async fn join_in_flight(in_flight: &mut Option<InFlight>) -> Result<String, GenerationError> {
    let Some(request) = in_flight else {
        std::future::pending::<()>().await;
        unreachable!()
    };
    match (&mut request.task).await {
        Ok(result) => result,
        Err(e) => Err(GenerationError::Backend(format!("generation task failed: {e}"))),
    }
}

/// Lets a request whose session is gone run to completion, then drops the
/// text. The arbiter still sees the call finish normally.
fn discard_late(session_id: SessionId, request: InFlight) {
    tracing::debug!(%session_id, template = request.plan.template, "session gone, request left to finish");
    tokio::spawn(async move {
        let outcome = match request.task.await {
            Ok(Ok(_)) => "completed",
            Ok(Err(_)) => "failed",
            Err(_) => "panicked",
        };
        tracing::debug!(%session_id, outcome, "late generation discarded");
    });
}

/// Spawns a driver task and returns a handle to it.
///
/// `channel_size` bounds the command channel; senders wait when it is full.
pub(crate) fn spawn_driver<B: GenerationBackend>(
    session_id: SessionId,
    config: StoryConfig,
    events: mpsc::UnboundedReceiver<StoryEvent>,
    context: DriverContext<B>,
    channel_size: usize,
) -> DriverHandle {
    let (tx, rx) = mpsc::channel(channel_size);

    let driver = SessionDriver {
        session_id: session_id.clone(),
        timer: CadenceTimer::new(context.cadence.clone()),
        budget: StoryBudget::new(config.total_duration),
        context,
        config,
        events,
        commands: rx,
        in_flight: None,
        background: JoinSet::new(),
        phase: StoryPhase::Seeding,
        force_start: false,
        grace_used: false,
        retry_kind: None,
        segments_generated: 0,
        failed_attempts: 0,
        finished: false,
        shutting_down: false,
    };

    tokio::spawn(driver.run());

    DriverHandle {
        session_id,
        sender: tx,
    }
}
