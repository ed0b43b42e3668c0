//! `StoryEngine` builder and facade.
//!
//! This is the entry point for embedding Taleweave. It ties together the
//! layers: registry → story drivers → arbiter → backend, plus the periodic
//! cleanup sweep. Transports call the methods here and subscribe to the
//! event stream; they never touch drivers directly.

use std::sync::Arc;

use taleweave_arbiter::{Arbiter, ArbiterEvent, ArbiterMetrics, GenerationBackend};
use taleweave_competition::MAX_GOALS_PER_PLAYER;
use taleweave_protocol::{
    ContributionKind, Difficulty, ParticipantId, SessionId, SessionSummary, StoryEvent,
};
use taleweave_session::{Clock, JoinOutcome, Session, SessionRegistry, StoryConfig, SystemClock};
use taleweave_story::{DriverStatus, SharedRegistry, StoryDirector};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::config::validated_story;
use crate::{EngineConfig, TaleweaveError};

type SharedDirector<B> = Arc<Mutex<StoryDirector<B>>>;

/// Builder for configuring and starting a [`StoryEngine`].
///
/// # Example
///
/// ```rust,ignore
/// use taleweave::prelude::*;
///
/// let engine = StoryEngineBuilder::new()
///     .config(EngineConfig::default())
///     .build(ProcessBackend::new(ProcessBackendConfig::default()));
/// let session_id = engine.create_session(ParticipantId::from("p1"), "Ada", "cli").await?;
/// ```
pub struct StoryEngineBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sweep: bool,
}

impl StoryEngineBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            sweep: true,
        }
    }

    /// Sets the whole engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the defaults for new sessions.
    pub fn story_config(mut self, story: StoryConfig) -> Self {
        self.config.story = story;
        self
    }

    /// Sets the wall clock used for recorded timestamps and cleanup.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Turns the background cleanup sweep on or off. On by default; with
    /// it off, call [`StoryEngine::sweep`] yourself.
    pub fn sweep(mut self, enabled: bool) -> Self {
        self.sweep = enabled;
        self
    }

    /// Builds the engine around `backend`.
    ///
    /// Must be called inside a Tokio runtime: session drivers and the sweep
    /// task are spawned on it.
    pub fn build<B: GenerationBackend>(self, backend: B) -> StoryEngine<B> {
        let config = self.config.validated();
        let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::with_clock(
            config.story.clone(),
            config.cleanup.clone(),
            self.clock,
        )));
        let arbiter = Arc::new(Arbiter::new(backend, config.arbiter.clone()));
        let director = Arc::new(Mutex::new(StoryDirector::new(
            Arc::clone(&registry),
            Arc::clone(&arbiter),
            config.cadence(),
        )));

        let sweeper = self.sweep.then(|| {
            spawn_sweeper(
                Arc::clone(&registry),
                Arc::clone(&director),
                config.cleanup.sweep_interval,
            )
        });

        tracing::info!(
            max_concurrent = config.arbiter.max_concurrent,
            timeout_ms = config.arbiter.timeout.as_millis() as u64,
            sweep = self.sweep,
            "story engine ready"
        );

        StoryEngine {
            registry,
            director,
            arbiter,
            config,
            sweeper,
        }
    }
}

impl Default for StoryEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running Taleweave engine.
///
/// All methods take `&self`, so the engine can be shared behind an `Arc`
/// by every connection task. Dropping it stops the cleanup sweep; call
/// [`shutdown`](Self::shutdown) to also stop the session drivers.
pub struct StoryEngine<B: GenerationBackend> {
    registry: SharedRegistry,
    director: SharedDirector<B>,
    arbiter: Arc<Arbiter<B>>,
    config: EngineConfig,
    sweeper: Option<JoinHandle<()>>,
}

impl<B: GenerationBackend> StoryEngine<B> {
    // =====================================================================
    // Sessions
    // =====================================================================

    /// Creates a session with the engine's default story settings and
    /// starts its driver.
    pub async fn create_session(
        &self,
        host_id: ParticipantId,
        name: &str,
        origin: &str,
    ) -> Result<SessionId, TaleweaveError> {
        self.create_session_with(host_id, name, origin, self.config.story.clone())
            .await
    }

    /// Like [`create_session`](Self::create_session) with custom settings.
    pub async fn create_session_with(
        &self,
        host_id: ParticipantId,
        name: &str,
        origin: &str,
        config: StoryConfig,
    ) -> Result<SessionId, TaleweaveError> {
        let config = validated_story(config);
        let (session_id, events) = self
            .registry
            .lock()
            .await
            .create_session_with(host_id, name, origin, config.clone())?;
        self.director
            .lock()
            .await
            .spawn(session_id.clone(), config, events);
        Ok(session_id)
    }

    pub async fn join_session(
        &self,
        session_id: &SessionId,
        participant_id: ParticipantId,
        name: &str,
        origin: &str,
    ) -> Result<JoinOutcome, TaleweaveError> {
        let outcome = self
            .registry
            .lock()
            .await
            .join_session(session_id, participant_id, name, origin)?;
        Ok(outcome)
    }

    /// Marks a participant disconnected. Returns the session they left.
    pub async fn leave_session(&self, participant_id: &ParticipantId) -> Option<SessionId> {
        self.registry.lock().await.leave_session(participant_id)
    }

    /// Records a contribution. `Ok(false)` means it did not apply (see
    /// [`SessionRegistry::add_input`]).
    pub async fn submit_input(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        kind: ContributionKind,
        text: &str,
    ) -> Result<bool, TaleweaveError> {
        let accepted = self
            .registry
            .lock()
            .await
            .add_input(session_id, participant_id, kind, text)?;
        Ok(accepted)
    }

    /// Turns on secret goals for a session that is still seeding.
    pub async fn enable_competition(
        &self,
        session_id: &SessionId,
        difficulty: Difficulty,
        goals_per_player: usize,
    ) -> Result<(), TaleweaveError> {
        let goals_per_player = goals_per_player.clamp(1, MAX_GOALS_PER_PLAYER);
        self.registry
            .lock()
            .await
            .enable_competition(session_id, difficulty, goals_per_player)?;
        Ok(())
    }

    // =====================================================================
    // Manual controls
    // =====================================================================

    /// Generates the next segment now. `Ok(false)` if the story is not
    /// active or a request is already running.
    pub async fn skip(&self, session_id: &SessionId) -> Result<bool, TaleweaveError> {
        let handle = self.director.lock().await.handle(session_id)?;
        Ok(handle.skip().await?)
    }

    /// Ends seeding now. `Ok(false)` if the story already started.
    pub async fn force_start(&self, session_id: &SessionId) -> Result<bool, TaleweaveError> {
        let handle = self.director.lock().await.handle(session_id)?;
        Ok(handle.force_start().await?)
    }

    /// The driver's view of a session: alarm, budget, in-flight request.
    pub async fn status(&self, session_id: &SessionId) -> Result<DriverStatus, TaleweaveError> {
        let handle = self.director.lock().await.handle(session_id)?;
        Ok(handle.status().await?)
    }

    // =====================================================================
    // Queries
    // =====================================================================

    /// A snapshot of a session.
    pub async fn session(&self, session_id: &SessionId) -> Option<Session> {
        self.registry.lock().await.snapshot(session_id)
    }

    pub async fn summary(&self, session_id: &SessionId) -> Option<SessionSummary> {
        self.registry
            .lock()
            .await
            .get(session_id)
            .map(Session::summary)
    }

    /// Seed premise followed by every segment.
    pub async fn full_narrative(&self, session_id: &SessionId) -> Option<String> {
        self.registry.lock().await.full_narrative(session_id)
    }

    pub async fn session_of(&self, participant_id: &ParticipantId) -> Option<SessionId> {
        self.registry.lock().await.session_of(participant_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.registry.lock().await.session_ids()
    }

    /// Subscribes to every [`StoryEvent`] from every session.
    pub async fn subscribe(&self) -> broadcast::Receiver<StoryEvent> {
        self.registry.lock().await.subscribe()
    }

    /// Subscribes to backend traffic notifications.
    pub fn subscribe_generation(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.arbiter.subscribe()
    }

    pub fn generation_metrics(&self) -> ArbiterMetrics {
        self.arbiter.metrics()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Runs one cleanup pass now. Returns the removed session ids.
    pub async fn sweep(&self) -> Vec<SessionId> {
        sweep_once(&self.registry, &self.director).await
    }

    /// Stops the sweep and every session driver.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.director.lock().await.shutdown_all().await;
        tracing::info!("story engine stopped");
    }
}

impl<B: GenerationBackend> Drop for StoryEngine<B> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Removes inactive sessions and forgets drivers that have exited.
async fn sweep_once<B: GenerationBackend>(
    registry: &SharedRegistry,
    director: &SharedDirector<B>,
) -> Vec<SessionId> {
    let removed = registry.lock().await.cleanup_inactive();
    let mut director = director.lock().await;
    for session_id in &removed {
        // The driver exits on its own once its channel closes.
        director.remove(session_id);
    }
    let finished = director.prune();
    if !removed.is_empty() || !finished.is_empty() {
        tracing::info!(
            removed = removed.len(),
            finished = finished.len(),
            remaining = director.len(),
            "cleanup sweep"
        );
    }
    removed
}

fn spawn_sweeper<B: GenerationBackend>(
    registry: SharedRegistry,
    director: SharedDirector<B>,
    every: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_once(&registry, &director).await;
        }
    })
}
