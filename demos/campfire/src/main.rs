use std::time::Duration;

use taleweave::prelude::*;
use tokio::sync::broadcast::error::RecvError;

// ---------------------------------------------------------------------------
// Narrator: a canned backend
// ---------------------------------------------------------------------------

/// Goals the narrator hands out, each with the word that proves it happened.
const GOAL_POOL: [(&str, &str); 5] = [
    ("Find the brass lantern", "lantern"),
    ("Make the fog speak a name", "fog"),
    ("Have a ship finally reach the shore", "ship"),
    ("Reveal who built the lighthouse", "built"),
    ("End the night with a bargain", "bargain"),
];

const BEATS: [&str; 4] = [
    "The keeper climbed the spiral stair and trimmed the wick, as every night.",
    "Far out, something blinked back. Once, then twice, then not at all.",
    "Salt crusted the logbook. The last entry was in a hand the keeper did not know.",
    "The tide turned early, and the rocks below began to hum.",
];

/// Answers every template from fixed text, after a short pause.
struct Narrator {
    pause: Duration,
}

impl Narrator {
    fn new(pause: Duration) -> Self {
        Self { pause }
    }

    fn reply(template: &str, variables: &TemplateVars) -> String {
        let text = |key: &str| variables.get(key).and_then(|v| v.as_str()).unwrap_or("");
        match template {
            GOAL_TEMPLATE => {
                let count = variables
                    .get("goal_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as usize;
                let offset = text("player_name").len();
                (0..count)
                    .map(|i| format!("{}. {}", i + 1, GOAL_POOL[(offset + i) % GOAL_POOL.len()].0))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            SCORING_TEMPLATE => {
                let goal = text("goal");
                let story = text("story").to_lowercase();
                let keyword = GOAL_POOL
                    .iter()
                    .find(|(g, _)| g.eq_ignore_ascii_case(goal))
                    .map(|(_, k)| *k);
                match keyword {
                    Some(word) if story.contains(word) => {
                        format!("Score: 3\nEvaluation: the story has its {word}.")
                    }
                    _ => "Score: 1\nEvaluation: it never came up.".to_string(),
                }
            }
            PLAYER_INPUT_TEMPLATE => {
                let voices: Vec<&str> = text("direct_inputs")
                    .lines()
                    .filter_map(|line| line.split_once("]: ").map(|(_, said)| said))
                    .collect();
                format!("Out of the dark came the watchers' will: {}.", voices.join(", then "))
            }
            CONCLUSION_TEMPLATE => {
                "By dawn the lantern was dark again, the fog had lifted, and the keeper slept."
                    .to_string()
            }
            _ => {
                let number = variables
                    .get("segment_number")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1) as usize;
                BEATS[number.saturating_sub(1) % BEATS.len()].to_string()
            }
        }
    }
}

impl GenerationBackend for Narrator {
    async fn invoke(
        &self,
        template: &str,
        variables: &TemplateVars,
    ) -> Result<String, GenerationError> {
        tokio::time::sleep(self.pause).await;
        Ok(Self::reply(template, variables))
    }
}

// ---------------------------------------------------------------------------
// The scripted evening
// ---------------------------------------------------------------------------

fn campfire_config() -> EngineConfig {
    EngineConfig {
        story: StoryConfig {
            seeding_duration: Duration::from_secs(5),
            seeding_grace: Duration::from_secs(5),
            cadence_interval: Duration::from_secs(4),
            total_duration: Duration::from_secs(12),
            ..StoryConfig::default()
        },
        ..EngineConfig::default()
    }
}

struct Ending {
    narrative: String,
    leaderboard: Vec<LeaderboardEntry>,
}

/// Two friends seed a story, nudge it once it starts, and wait for the
/// scores. Every event of the session is passed to `emit` as a JSON line.
async fn play<B: GenerationBackend>(
    engine: &StoryEngine<B>,
    mut emit: impl FnMut(&str),
) -> Result<Ending, TaleweaveError> {
    let mut events = engine.subscribe().await;
    let ada = ParticipantId::from("ada");
    let grace = ParticipantId::from("grace");

    let session_id = engine.create_session(ada.clone(), "Ada", "campfire").await?;
    engine
        .join_session(&session_id, grace.clone(), "Grace", "campfire")
        .await?;
    engine
        .enable_competition(&session_id, Difficulty::Easy, 2)
        .await?;
    engine
        .submit_input(
            &session_id,
            &ada,
            ContributionKind::Seed,
            "A keeper tends a lighthouse no ship has visited in a century",
        )
        .await?;
    engine
        .submit_input(
            &session_id,
            &grace,
            ContributionKind::Seed,
            "One night, a lantern answers from the sea",
        )
        .await?;

    let codec = JsonCodec;
    let mut nudged = false;
    let mut leaderboard = Vec::new();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.session_id() != &session_id {
            continue;
        }
        emit(&String::from_utf8_lossy(&codec.encode(&event)?));

        match event {
            StoryEvent::SegmentAdded { .. } if !nudged => {
                nudged = true;
                engine
                    .submit_input(
                        &session_id,
                        &grace,
                        ContributionKind::Direct,
                        "Grace rows out toward the brass lantern",
                    )
                    .await?;
                engine
                    .submit_input(
                        &session_id,
                        &ada,
                        ContributionKind::Influence,
                        "Let the fog thicken",
                    )
                    .await?;
            }
            StoryEvent::CompetitionScored {
                leaderboard: board, ..
            } => {
                leaderboard = board;
                break;
            }
            _ => {}
        }
    }

    let narrative = engine
        .full_narrative(&session_id)
        .await
        .unwrap_or_default();
    Ok(Ending {
        narrative,
        leaderboard,
    })
}

#[tokio::main]
async fn main() -> Result<(), TaleweaveError> {
    taleweave::init_tracing();
    eprintln!("lighting the campfire");

    let engine = StoryEngineBuilder::new()
        .config(campfire_config())
        .build(Narrator::new(Duration::from_millis(300)));

    let ending = play(&engine, |line| println!("{line}")).await?;

    println!("\n{}\n", ending.narrative);
    for entry in &ending.leaderboard {
        println!(
            "#{} {}: {} points, {} goal(s) achieved",
            entry.rank, entry.name, entry.total_score, entry.goals_achieved
        );
    }

    engine.shutdown().await;
    Ok(())
}
