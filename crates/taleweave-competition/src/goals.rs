//! Turning backend text into a list of goals.

use std::sync::LazyLock;

use regex::Regex;
use taleweave_protocol::Difficulty;
pub use taleweave_session::MAX_GOALS_PER_PLAYER;

/// Template used to ask the backend for goals.
pub const GOAL_TEMPLATE: &str = "goal_generation";

/// Shortest text accepted as a goal; anything shorter is a fragment.
const MIN_GOAL_CHARS: usize = 10;

/// A line starting with `1.`, `2)`, `-`, `*`, `•` or `Goal 3:`.
static MARKED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:\d+\s*[.):]|[-*•]|goal\s*\d*\s*:)\s*(.+)$")
        .expect("goal line pattern is valid")
});

const EASY: &[&str] = &[
    "A character shares a meal with a stranger",
    "Someone finds an object they thought was lost",
    "The weather changes suddenly",
    "An animal helps one of the characters",
    "Someone laughs at exactly the wrong moment",
];

const MEDIUM: &[&str] = &[
    "A trusted character reveals a hidden motive",
    "Two rivals are forced to work together",
    "A message arrives too late to change anything",
    "Someone gives up something valuable to help another",
    "A map or set of directions turns out to be wrong",
];

const HARD: &[&str] = &[
    "The story ends in the same place it began",
    "A minor character from early on saves the day",
    "A prophecy comes true in an unexpected way",
    "The villain is revealed to be someone already present",
    "A lie told at the start becomes the truth by the end",
];

/// The canned goals for a difficulty, at most `count`.
pub fn fallback_goals(difficulty: Difficulty, count: usize) -> Vec<String> {
    let pool = match difficulty {
        Difficulty::Easy => EASY,
        Difficulty::Medium => MEDIUM,
        Difficulty::Hard => HARD,
    };
    pool.iter().take(count).map(|s| s.to_string()).collect()
}

/// Extracts up to `count` goals from free-form backend text.
///
/// Numbered, bulleted and `Goal N:` lines are preferred. If there are none,
/// every non-empty line is a candidate. Surrounding quotes are stripped;
/// headers (ending in `:`) and fragments under ten characters are dropped,
/// as are duplicates.
pub fn parse_goals(text: &str, count: usize) -> Vec<String> {
    let marked: Vec<&str> = text
        .lines()
        .filter_map(|line| MARKED_LINE.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    let candidates: Vec<&str> = if marked.is_empty() {
        text.lines().collect()
    } else {
        marked
    };

    let mut goals: Vec<String> = Vec::with_capacity(count);
    for candidate in candidates {
        if goals.len() == count {
            break;
        }
        let cleaned = candidate
            .trim()
            .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'))
            .trim();
        if cleaned.ends_with(':') || cleaned.chars().count() < MIN_GOAL_CHARS {
            continue;
        }
        if goals.iter().any(|g| g.eq_ignore_ascii_case(cleaned)) {
            continue;
        }
        goals.push(cleaned.to_string());
    }
    goals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_goals_numbered_list() {
        let text = "Here are your goals:\n1. The dragon befriends a child\n2) A storm destroys the bridge\n3. Someone betrays the captain";
        assert_eq!(
            parse_goals(text, 3),
            vec![
                "The dragon befriends a child",
                "A storm destroys the bridge",
                "Someone betrays the captain",
            ]
        );
    }

    #[test]
    fn test_parse_goals_bullets_and_quotes() {
        let text = "- \"The lighthouse goes dark\"\n* 'A letter is burned unread'\n• Short";
        assert_eq!(
            parse_goals(text, 3),
            vec!["The lighthouse goes dark", "A letter is burned unread"]
        );
    }

    #[test]
    fn test_parse_goals_goal_prefix() {
        let text = "Goal 1: A secret door is discovered\nGoal 2: The mayor resigns in shame";
        assert_eq!(parse_goals(text, 5).len(), 2);
    }

    #[test]
    fn test_parse_goals_unmarked_lines_used_when_nothing_marked() {
        let text = "A ghost appears at dinner\n\nThe river floods the town";
        assert_eq!(
            parse_goals(text, 3),
            vec!["A ghost appears at dinner", "The river floods the town"]
        );
    }

    #[test]
    fn test_parse_goals_drops_headers_fragments_and_duplicates() {
        let text = "1. Goals for you:\n2. ok\n3. A knight loses her sword\n4. a knight loses her sword";
        assert_eq!(parse_goals(text, 3), vec!["A knight loses her sword"]);
    }

    #[test]
    fn test_parse_goals_respects_count() {
        let text = "1. First goal text here\n2. Second goal text here\n3. Third goal text here";
        assert_eq!(parse_goals(text, 2).len(), 2);
    }

    #[test]
    fn test_fallback_goals_per_difficulty() {
        assert_eq!(fallback_goals(Difficulty::Hard, 3).len(), 3);
        assert_ne!(
            fallback_goals(Difficulty::Easy, 1),
            fallback_goals(Difficulty::Hard, 1)
        );
    }
}
