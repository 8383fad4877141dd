//! Text helpers shared by the memory store, quality metrics and providers.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}']+").expect("word pattern is valid"));

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?\n]+[.!?]*").expect("sentence pattern is valid"));

/// Lowercased words of `text`, in order.
#[must_use]
pub fn words(text: &str) -> Vec<String> {
    WORD
        .find_iter(text)
        .map(|m| m.as_str().trim_matches('\'').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Number of words in `text`.
#[must_use]
pub fn word_count(text: &str) -> usize {
    WORD.find_iter(text).count()
}

/// Distinct lowercased words of `text` that are at least `min_len` long.
#[must_use]
pub fn vocabulary(text: &str, min_len: usize) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() >= min_len)
        .collect()
}

/// Non-empty sentences of `text`, trimmed.
#[must_use]
pub fn sentences(text: &str) -> Vec<String> {
    SENTENCE
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .collect()
}

/// Paragraphs of `text`, separated by blank lines.
#[must_use]
pub fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Rough token count: one token per four characters, at least one per
/// non-empty text.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    if chars == 0 {
        0
    } else {
        chars.div_ceil(4)
    }
}
