//! Integration tests for the engine facade: full sessions over a fake
//! backend, the global concurrency cap, and cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taleweave::prelude::*;
use taleweave_session::ManualClock;
use tokio::sync::broadcast::error::TryRecvError;

// =========================================================================
// Fake backend
// =========================================================================

/// Takes `delay` per call, tracks peak concurrency, and optionally refuses
/// goal requests.
#[derive(Default)]
struct PacedBackend {
    delay: Duration,
    refuse_goals: bool,
    current: AtomicUsize,
    peak: AtomicUsize,
    seeds: Mutex<Vec<String>>,
}

impl PacedBackend {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl GenerationBackend for PacedBackend {
    async fn invoke(
        &self,
        template: &str,
        variables: &TemplateVars,
    ) -> Result<String, GenerationError> {
        if template == "goal_generation" && self.refuse_goals {
            return Err(GenerationError::Backend("goal model offline".into()));
        }
        if let Some(seed) = variables.get("seed_text").and_then(|v| v.as_str()) {
            self.seeds.lock().unwrap().push(seed.to_string());
        }
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("A new turn in the tale ({template})."))
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

fn quick_story() -> StoryConfig {
    StoryConfig {
        seeding_duration: Duration::from_secs(10),
        seeding_grace: Duration::from_secs(5),
        cadence_interval: Duration::from_secs(5),
        total_duration: Duration::from_secs(12),
        retry_backoff: Duration::from_secs(2),
        ..StoryConfig::default()
    }
}

fn engine<B: GenerationBackend>(backend: B, config: EngineConfig) -> StoryEngine<B> {
    StoryEngineBuilder::new().config(config).sweep(false).build(backend)
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<StoryEvent>) -> Vec<StoryEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

fn type_tag(event: &StoryEvent) -> String {
    let value = serde_json::to_value(event).unwrap();
    value["type"].as_str().unwrap().to_string()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// =========================================================================
// Full session
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_engine_runs_story_and_publishes_events() {
    let engine = engine(
        PacedBackend::default(),
        EngineConfig {
            story: quick_story(),
            ..EngineConfig::default()
        },
    );
    let mut events = engine.subscribe().await;

    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine
        .join_session(&id, pid("p2"), "Grace", "web")
        .await
        .unwrap();
    let premise = "A lighthouse at the end of the world";
    assert!(engine
        .submit_input(&id, &pid("p2"), ContributionKind::Seed, premise)
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_secs(60)).await;

    let tags: Vec<String> = drain(&mut events).iter().map(type_tag).collect();
    assert_eq!(
        tags,
        vec![
            "session_created",
            "player_joined",
            "player_joined",
            "input_received",
            "story_started",
            "segment_added",
            "segment_added",
            "segment_added",
            "segment_added",
            "story_completed",
        ]
    );

    let narrative = engine.full_narrative(&id).await.unwrap();
    assert!(narrative.starts_with("A lighthouse at the end of the world\n\n"));
    let summary = engine.summary(&id).await.unwrap();
    assert_eq!(summary.phase, StoryPhase::Completed);
    assert_eq!(summary.segment_count, 4);
    assert_eq!(summary.participant_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_engine_inputs_after_completion_are_ignored() {
    let engine = engine(
        PacedBackend::default(),
        EngineConfig {
            story: quick_story(),
            ..EngineConfig::default()
        },
    );
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine.force_start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let accepted = engine
        .submit_input(&id, &pid("p1"), ContributionKind::Direct, "One more thing")
        .await
        .unwrap();

    assert!(!accepted);
    let err = engine
        .join_session(&id, pid("p9"), "Late", "web")
        .await
        .unwrap_err();
    assert!(matches!(err, TaleweaveError::Session(SessionError::Closed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_engine_participant_cannot_host_two_live_sessions() {
    let engine = engine(PacedBackend::default(), EngineConfig::default());
    engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();

    let err = engine
        .create_session(pid("p1"), "Ada", "cli")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaleweaveError::Session(SessionError::AlreadyInSession { .. })
    ));
}

// =========================================================================
// Concurrency cap
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_engine_cap_one_serializes_sessions_in_arrival_order() {
    let backend = Arc::new(PacedBackend::new(Duration::from_secs(1)));
    let engine = engine(
        Arc::clone(&backend),
        EngineConfig {
            story: StoryConfig {
                cadence_interval: Duration::from_secs(30),
                ..StoryConfig::default()
            },
            arbiter: ArbiterConfig {
                max_concurrent: 1,
                timeout: Duration::from_secs(60),
            },
            ..EngineConfig::default()
        },
    );
    let mut traffic = engine.subscribe_generation();

    let mut ids = Vec::new();
    for n in 1..=3 {
        let host = pid(&format!("p{n}"));
        let id = engine.create_session(host.clone(), "Host", "cli").await.unwrap();
        engine
            .submit_input(&id, &host, ContributionKind::Seed, &format!("seed {n}"))
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        engine.force_start(id).await.unwrap();
        settle().await;
    }

    assert_eq!(engine.generation_metrics().requests, 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(engine.generation_metrics().requests, 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    for id in &ids {
        assert_eq!(engine.session(id).await.unwrap().segments.len(), 1);
    }
    assert_eq!(backend.peak(), 1);
    assert_eq!(
        *backend.seeds.lock().unwrap(),
        vec!["seed 1", "seed 2", "seed 3"]
    );

    while let Ok(event) = traffic.try_recv() {
        if let ArbiterEvent::RequestStarted { in_flight, .. } = event {
            assert_eq!(in_flight, 1);
        }
    }
}

// =========================================================================
// Competition
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_engine_goal_failure_gives_fallback_goals() {
    let backend = PacedBackend {
        refuse_goals: true,
        ..Default::default()
    };
    let engine = engine(backend, EngineConfig::default());
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine.join_session(&id, pid("p2"), "Grace", "web").await.unwrap();
    engine
        .enable_competition(&id, Difficulty::Easy, 3)
        .await
        .unwrap();

    engine.force_start(&id).await.unwrap();
    settle().await;

    let session = engine.session(&id).await.unwrap();
    assert_eq!(session.participants.len(), 2);
    for participant in session.participants.values() {
        assert_eq!(participant.goals.len(), 3);
        assert!(participant.goals.iter().all(|g| g.fallback));
    }
}

#[tokio::test(start_paused = true)]
async fn test_engine_enable_competition_after_start_is_rejected() {
    let engine = engine(PacedBackend::default(), EngineConfig::default());
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine.force_start(&id).await.unwrap();
    settle().await;

    let err = engine
        .enable_competition(&id, Difficulty::Hard, 2)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TaleweaveError::Session(SessionError::InvalidState { .. })
    ));
}

// =========================================================================
// Cleanup and shutdown
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_engine_sweep_removes_abandoned_session() {
    let clock = Arc::new(ManualClock::default());
    let engine = StoryEngineBuilder::new()
        .clock(clock.clone())
        .sweep(false)
        .build(PacedBackend::default());
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine.leave_session(&pid("p1")).await;

    clock.advance(Duration::from_secs(5 * 60 * 60));
    assert!(engine.sweep().await.is_empty());

    clock.advance(Duration::from_secs(2 * 60 * 60));
    assert_eq!(engine.sweep().await, vec![id.clone()]);

    assert!(engine.session(&id).await.is_none());
    assert!(matches!(
        engine.status(&id).await,
        Err(TaleweaveError::Story(StoryError::NotFound(_)))
    ));
    // The host is free to start over.
    engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_engine_background_sweep_runs_on_interval() {
    let clock = Arc::new(ManualClock::default());
    let engine = StoryEngineBuilder::new()
        .clock(clock.clone())
        .config(EngineConfig {
            cleanup: CleanupPolicy {
                sweep_interval: Duration::from_secs(60),
                ..CleanupPolicy::default()
            },
            ..EngineConfig::default()
        })
        .build(PacedBackend::default());
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine.leave_session(&pid("p1")).await;
    clock.advance(Duration::from_secs(7 * 60 * 60));

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(engine.session(&id).await.is_none());
    assert!(engine.session_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_engine_default_builder_serves_sessions() {
    let engine = StoryEngineBuilder::default().build(PacedBackend::default());

    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();

    assert_eq!(engine.session_ids().await, vec![id]);
    assert_eq!(
        engine.config().arbiter.max_concurrent,
        ArbiterConfig::default().max_concurrent
    );
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_engine_shutdown_stops_drivers() {
    let engine = engine(
        PacedBackend::default(),
        EngineConfig {
            story: quick_story(),
            ..EngineConfig::default()
        },
    );
    let id = engine.create_session(pid("p1"), "Ada", "cli").await.unwrap();
    engine
        .submit_input(&id, &pid("p1"), ContributionKind::Seed, "A lighthouse")
        .await
        .unwrap();
    let registry = Arc::clone(engine.registry());

    engine.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let registry = registry.lock().await;
    assert_eq!(registry.get(&id).unwrap().phase(), StoryPhase::Seeding);
}

#[tokio::test(start_paused = true)]
async fn test_engine_skip_unknown_session_is_story_error() {
    let engine = engine(PacedBackend::default(), EngineConfig::default());

    let err = engine
        .skip(&SessionId::from("no-such-session"))
        .await
        .unwrap_err();

    assert!(matches!(err, TaleweaveError::Story(StoryError::NotFound(_))));
}
