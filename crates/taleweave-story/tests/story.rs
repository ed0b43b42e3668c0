//! Integration tests for session drivers, run on a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taleweave_arbiter::{
    Arbiter, ArbiterConfig, ArbiterEvent, GenerationBackend, GenerationError, TemplateVars,
};
use taleweave_cadence::{CadenceConfig, WakeReason};
use taleweave_competition::{GOAL_TEMPLATE, SCORING_TEMPLATE};
use taleweave_protocol::{ContributionKind, ParticipantId, SegmentNumber, SessionId, StoryPhase};
use taleweave_session::{
    CleanupPolicy, ManualClock, Session, SessionRegistry, StoryConfig,
};
use taleweave_story::{
    CONCLUSION_TEMPLATE, CONTINUATION_TEMPLATE, PLAYER_INPUT_TEMPLATE, SharedRegistry,
    StoryDirector, StoryError,
};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::TryRecvError;

// =============================================================================
// Fake backend
// =============================================================================

/// Answers every template with canned text, optionally after a delay or
/// behind a gate, and fails the first `fail_next` calls.
#[derive(Default)]
struct StoryBackend {
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    fail_next: AtomicUsize,
    calls: Mutex<Vec<(String, TemplateVars)>>,
    /// Calls that ran to the end.
    finished: AtomicUsize,
}

impl StoryBackend {
    fn failing(times: usize) -> Self {
        Self {
            fail_next: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Each call waits for one permit on `gate`.
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Story templates called so far, in order. Goal and scoring calls are
    /// left out.
    fn story_templates(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .filter(|t| t != GOAL_TEMPLATE && t != SCORING_TEMPLATE)
            .collect()
    }

    fn first_call(&self) -> TemplateVars {
        self.calls.lock().unwrap()[0].1.clone()
    }
}

impl GenerationBackend for StoryBackend {
    async fn invoke(&self, template: &str, variables: &TemplateVars) -> Result<String, GenerationError> {
        self.calls
            .lock()
            .unwrap()
            .push((template.to_string(), variables.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GenerationError::Backend("model overloaded".into()));
        }
        Ok(match template {
            GOAL_TEMPLATE => "1. The keeper hides a letter\n2. A ship runs aground in fog".into(),
            SCORING_TEMPLATE => "Score: 3\nIt happened just like that.".into(),
            CONCLUSION_TEMPLATE => "And so the lamp burned on.".into(),
            _ => format!("Segment {} continues.", variables["segment_number"]),
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct World {
    registry: SharedRegistry,
    director: StoryDirector<Arc<StoryBackend>>,
    backend: Arc<StoryBackend>,
}

fn world(backend: StoryBackend) -> World {
    world_with_registry(
        backend,
        SessionRegistry::new(StoryConfig::default(), CleanupPolicy::default()),
    )
}

fn world_with_registry(backend: StoryBackend, registry: SessionRegistry) -> World {
    let backend = Arc::new(backend);
    let arbiter = Arc::new(Arbiter::new(
        Arc::clone(&backend),
        ArbiterConfig {
            max_concurrent: 2,
            timeout: Duration::from_secs(60),
        },
    ));
    let registry = Arc::new(tokio::sync::Mutex::new(registry));
    let director = StoryDirector::new(Arc::clone(&registry), arbiter, CadenceConfig::default());
    World {
        registry,
        director,
        backend,
    }
}

/// Seeding 10s, grace 5s, a segment every 5s, 12s of story, retry after 2s.
fn story_config() -> StoryConfig {
    StoryConfig {
        seeding_duration: Duration::from_secs(10),
        seeding_grace: Duration::from_secs(5),
        cadence_interval: Duration::from_secs(5),
        total_duration: Duration::from_secs(12),
        retry_backoff: Duration::from_secs(2),
        ..StoryConfig::default()
    }
}

fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

/// Creates a session hosted by "host" and starts its driver.
async fn create(world: &mut World, config: StoryConfig) -> SessionId {
    let (id, events) = world
        .registry
        .lock()
        .await
        .create_session_with(pid("host"), "Host", "test", config.clone())
        .unwrap();
    world.director.spawn(id.clone(), config, events);
    id
}

async fn seed(world: &World, id: &SessionId, text: &str) {
    let accepted = world
        .registry
        .lock()
        .await
        .add_input(id, &pid("host"), ContributionKind::Seed, text)
        .unwrap();
    assert!(accepted);
}

async fn session(world: &World, id: &SessionId) -> Session {
    world.registry.lock().await.snapshot(id).unwrap()
}

/// Lets drivers and their requests run without reaching the next alarm.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_story_runs_from_seeding_to_conclusion() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;
    seed(&world, &id, "A lighthouse on a cliff").await;

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(session(&world, &id).await.phase(), StoryPhase::Seeding);

    tokio::time::sleep(Duration::from_secs(30)).await;

    let session = session(&world, &id).await;
    assert_eq!(session.phase(), StoryPhase::Completed);
    let sequence: Vec<SegmentNumber> = session.segments.iter().map(|s| s.sequence).collect();
    assert_eq!(
        sequence,
        vec![
            SegmentNumber::Numbered(1),
            SegmentNumber::Numbered(2),
            SegmentNumber::Numbered(3),
            SegmentNumber::Conclusion,
        ]
    );
    assert_eq!(
        world.backend.story_templates(),
        vec![
            CONTINUATION_TEMPLATE,
            CONTINUATION_TEMPLATE,
            CONTINUATION_TEMPLATE,
            CONCLUSION_TEMPLATE,
        ]
    );
    assert_eq!(world.backend.first_call()["seed_text"], "A lighthouse on a cliff");
    assert!(session.state.remaining_total.is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_driver_exits_after_completion() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;
    seed(&world, &id, "A lighthouse").await;

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(world.director.handle(&id).unwrap().is_closed());
    assert_eq!(world.director.prune(), vec![id.clone()]);
    assert!(matches!(
        world.director.skip(&id).await,
        Err(StoryError::NotFound(_))
    ));
}

// =============================================================================
// Seeding
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_seeding_without_seeds_waits_for_grace() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(session(&world, &id).await.phase(), StoryPhase::Seeding);
    let status = world.director.status(&id).await.unwrap();
    assert_eq!(status.armed, Some(WakeReason::SeedingExpired));
    assert!(world.backend.story_templates().is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let session = session(&world, &id).await;
    assert_eq!(session.phase(), StoryPhase::Active);
    assert_eq!(session.segments.len(), 1);
    assert_eq!(world.backend.first_call()["seed_text"], "");
}

#[tokio::test(start_paused = true)]
async fn test_seed_during_grace_starts_when_grace_ends() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    seed(&world, &id, "A storm at sea").await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(session(&world, &id).await.phase(), StoryPhase::Seeding);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(session(&world, &id).await.phase(), StoryPhase::Active);
    assert_eq!(world.backend.first_call()["seed_text"], "A storm at sea");
}

#[tokio::test(start_paused = true)]
async fn test_force_start_ends_seeding_immediately() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;

    assert!(world.director.force_start(&id).await.unwrap());
    settle().await;

    let session = session(&world, &id).await;
    assert_eq!(session.phase(), StoryPhase::Active);
    assert_eq!(session.segments.len(), 1);
    assert!(!world.director.force_start(&id).await.unwrap());
}

// =============================================================================
// Cadence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_direct_inputs_are_attributed_then_cleared() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    world
        .registry
        .lock()
        .await
        .add_input(&id, &pid("host"), ContributionKind::Direct, "The lamp flickers")
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let session = session(&world, &id).await;
    let second = &session.segments[1];
    assert_eq!(second.template, PLAYER_INPUT_TEMPLATE);
    assert!(second.contributors.contains("Host"));
    assert_eq!(second.inputs.direct, 1);
    assert!(session.pending.direct.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_generation_is_retried_without_advancing_sequence() {
    let mut world = world(StoryBackend::failing(1));
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    assert!(session(&world, &id).await.segments.is_empty());
    let status = world.director.status(&id).await.unwrap();
    assert_eq!(status.failed_attempts, 1);
    assert_eq!(status.armed, Some(WakeReason::Retry));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let session = session(&world, &id).await;
    assert_eq!(session.segments.len(), 1);
    assert_eq!(session.segments[0].sequence, SegmentNumber::Numbered(1));
}

#[tokio::test(start_paused = true)]
async fn test_skip_generates_before_the_cadence() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    assert!(world.director.skip(&id).await.unwrap());
    settle().await;

    assert_eq!(session(&world, &id).await.segments.len(), 2);
    let status = world.director.status(&id).await.unwrap();
    assert_eq!(status.armed, Some(WakeReason::CadenceTick));
}

#[tokio::test(start_paused = true)]
async fn test_skip_while_generating_is_ignored() {
    let mut world = world(StoryBackend::slow(Duration::from_secs(3)));
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    assert!(world.director.status(&id).await.unwrap().generating);
    assert!(!world.director.skip(&id).await.unwrap());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(session(&world, &id).await.segments.len(), 1);
    assert_eq!(world.backend.story_templates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_skip_during_seeding_is_ignored() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;

    assert!(!world.director.skip(&id).await.unwrap());
}

// =============================================================================
// Pause and resume
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_nobody_connected_pauses_until_rejoin() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;
    world.registry.lock().await.leave_session(&pid("host"));

    tokio::time::sleep(Duration::from_secs(6)).await;
    let status = world.director.status(&id).await.unwrap();
    assert!(status.parked);
    assert_eq!(status.armed, None);
    let paused_at = status.budget_remaining;
    assert!(paused_at <= Duration::from_secs(7) && paused_at >= Duration::from_secs(6));

    tokio::time::sleep(Duration::from_secs(120)).await;
    let status = world.director.status(&id).await.unwrap();
    assert_eq!(status.budget_remaining, paused_at);
    assert_eq!(session(&world, &id).await.segments.len(), 1);

    world
        .registry
        .lock()
        .await
        .join_session(&id, pid("host"), "Host", "test")
        .unwrap();
    settle().await;

    let status = world.director.status(&id).await.unwrap();
    assert!(!status.parked);
    assert_eq!(session(&world, &id).await.segments.len(), 2);
}

// =============================================================================
// Competition
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_competitive_story_assigns_goals_and_scores_them() {
    let mut world = world(StoryBackend::default());
    let mut config = story_config();
    config.competition.enabled = true;
    config.competition.goals_per_player = 2;
    let id = create(&mut world, config).await;
    world
        .registry
        .lock()
        .await
        .join_session(&id, pid("ada"), "Ada", "test")
        .unwrap();
    seed(&world, &id, "A haunted lighthouse").await;

    world.director.force_start(&id).await.unwrap();
    settle().await;
    world
        .registry
        .lock()
        .await
        .join_session(&id, pid("cy"), "Cy", "test")
        .unwrap();
    settle().await;

    let mid = session(&world, &id).await;
    for participant in mid.participants.values() {
        assert_eq!(participant.goals.len(), 2, "{} has goals", participant.name);
        assert!(participant.goals.iter().all(|g| !g.fallback && g.score.is_none()));
    }

    tokio::time::sleep(Duration::from_secs(60)).await;

    let done = session(&world, &id).await;
    assert_eq!(done.phase(), StoryPhase::Completed);
    let competition = done.competition.as_ref().unwrap();
    assert!(competition.finalized);
    assert_eq!(competition.leaderboard.len(), 3);
    assert_eq!(competition.leaderboard[0].participant_id, pid("host"));
    assert!(competition.leaderboard.iter().all(|e| e.total_score == 6));
    for participant in done.participants.values() {
        assert!(participant.goals.iter().all(|g| g.achieved && g.score == Some(3)));
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// A registry on a manual clock, so sessions can be aged past cleanup.
fn aging_world(backend: StoryBackend) -> (World, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let registry = SessionRegistry::with_clock(
        StoryConfig::default(),
        CleanupPolicy::default(),
        clock.clone(),
    );
    (world_with_registry(backend, registry), clock)
}

/// Abandons the host's session and sweeps it away.
async fn abandon(world: &World, clock: &ManualClock, id: &SessionId) {
    let mut registry = world.registry.lock().await;
    registry.leave_session(&pid("host"));
    clock.advance(Duration::from_secs(7 * 60 * 60));
    assert_eq!(registry.cleanup_inactive(), vec![id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_driver_exits_when_session_is_removed() {
    let (mut world, clock) = aging_world(StoryBackend::slow(Duration::from_secs(3)));
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    abandon(&world, &clock, &id).await;
    settle().await;

    let handle = world.director.handle(&id).unwrap();
    assert!(handle.is_closed());
    assert!(matches!(handle.status().await, Err(StoryError::Unavailable(_))));

    // The request still runs out, and nothing comes back to life.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(world.backend.finished(), 1);
    assert_eq!(world.director.arbiter().metrics().cancelled, 0);
    assert!(world.registry.lock().await.get(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_removed_session_request_completes_and_result_is_dropped() {
    let gate = Arc::new(Semaphore::new(0));
    let (mut world, clock) = aging_world(StoryBackend::gated(Arc::clone(&gate)));
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;
    assert!(world.director.status(&id).await.unwrap().generating);
    let mut traffic = world.director.arbiter().subscribe();

    abandon(&world, &clock, &id).await;
    let mut published = world.registry.lock().await.subscribe();
    settle().await;
    assert!(world.director.handle(&id).unwrap().is_closed());
    assert_eq!(world.backend.finished(), 0);
    assert_eq!(world.director.arbiter().in_flight(), 1);

    gate.add_permits(1);
    settle().await;

    assert_eq!(world.backend.finished(), 1);
    let arbiter = world.director.arbiter();
    assert_eq!(arbiter.in_flight(), 0);
    let metrics = arbiter.metrics();
    assert_eq!(metrics.requests, 1);
    assert_eq!(metrics.failures, 0);
    assert_eq!(metrics.cancelled, 0);
    assert!(matches!(
        traffic.try_recv(),
        Ok(ArbiterEvent::RequestCompleted { .. })
    ));

    let registry = world.registry.lock().await;
    assert!(registry.get(&id).is_none());
    assert!(registry.session_ids().is_empty());
    assert!(matches!(published.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_driver() {
    let mut world = world(StoryBackend::default());
    let id = create(&mut world, story_config()).await;

    let handle = world.director.handle(&id).unwrap();
    world.director.shutdown(&id).await.unwrap();
    settle().await;

    assert!(handle.is_closed());
    assert!(world.director.is_empty());
    assert!(matches!(
        world.director.shutdown(&id).await,
        Err(StoryError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_in_flight_request() {
    let gate = Arc::new(Semaphore::new(0));
    let mut world = world(StoryBackend::gated(Arc::clone(&gate)));
    let id = create(&mut world, story_config()).await;
    world.director.force_start(&id).await.unwrap();
    settle().await;

    world.director.shutdown(&id).await.unwrap();
    settle().await;
    gate.add_permits(1);
    settle().await;

    assert_eq!(world.backend.finished(), 0);
    let metrics = world.director.arbiter().metrics();
    assert_eq!(metrics.requests, 1);
    assert_eq!(metrics.cancelled, 1);
    assert!(session(&world, &id).await.segments.is_empty());
}
