//! Input cleanup applied to everything participants type.

use std::sync::LazyLock;

use regex::Regex;

use crate::SessionError;

/// An opening or closing tag such as `<b>`, `</i>` or `<a href="x">`.
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("tag pattern is valid"));

/// Cleans participant text before it is stored.
///
/// - Control characters are removed; whitespace survives until the
///   collapse step.
/// - Markup tags are removed whole, and any stray angle brackets left
///   over are dropped, so text cannot smuggle markup into whatever
///   renders it.
/// - Runs of spaces and tabs collapse to one space; blank lines are dropped.
///
/// # Errors
/// [`SessionError::InvalidInput`] if nothing is left, or if the cleaned
/// text is longer than `max_chars` characters.
pub fn sanitize_input(raw: &str, max_chars: usize) -> Result<String, SessionError> {
    let untagged = TAG.replace_all(raw, "");
    let stripped: String = untagged
        .chars()
        .filter(|c| c.is_whitespace() || !c.is_control())
        .filter(|c| !matches!(c, '<' | '>'))
        .collect();

    let cleaned = stripped
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if cleaned.is_empty() {
        return Err(SessionError::InvalidInput("input is empty".into()));
    }
    let len = cleaned.chars().count();
    if len > max_chars {
        return Err(SessionError::InvalidInput(format!(
            "input is {len} characters, limit is {max_chars}"
        )));
    }
    Ok(cleaned)
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
