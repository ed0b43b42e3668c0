//! Human-readable session identifiers like `amber-falcon-4821`.

use rand::Rng;
use rand::seq::IndexedRandom;
use taleweave_protocol::SessionId;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "crimson", "dusky", "eager", "fabled", "gentle",
    "golden", "hidden", "ivory", "jolly", "lunar", "misty", "noble", "quiet",
    "rustic", "silver", "swift", "velvet", "wild", "woven",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "comet", "falcon", "fern", "harbor", "heron", "lantern",
    "maple", "meadow", "otter", "quill", "raven", "river", "sparrow", "summit",
    "thistle", "tide", "willow", "wren",
];

/// Attempts with a four-digit suffix before widening it.
const SHORT_ATTEMPTS: usize = 32;

/// Generates an unused id of the form `adjective-noun-NNNN`.
///
/// `taken` reports whether an id is already in use. After a run of
/// collisions the numeric suffix widens, so this always terminates.
pub fn generate_session_id(taken: impl Fn(&SessionId) -> bool) -> SessionId {
    let mut rng = rand::rng();
    let mut attempt = 0usize;
    loop {
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("quill");
        let number: u32 = if attempt < SHORT_ATTEMPTS {
            rng.random_range(1000..10000)
        } else {
            rng.random_range(10000..1_000_000)
        };
        let id = SessionId::new(format!("{adjective}-{noun}-{number}"));
        if !taken(&id) {
            return id;
        }
        attempt += 1;
    }
}
