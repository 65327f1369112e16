//! # Sentence Normalizer
//!
//! Turns a card's fulltext into the canonical ordered sequence of
//! normalized sentences that everything downstream fingerprints and
//! indexes.

use regex::Regex;
use std::sync::OnceLock;

/// A run of terminal punctuation.
fn terminator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.?!]+").expect("terminator regex"))
}

/// What must follow a terminator for it to be a sentence boundary: optional
/// footnote numerals, whitespace, then a capital letter. Checked separately
/// because the `regex` crate has no lookahead; the trailing context is left
/// in place so it stays part of the next fragment.
fn boundary_context() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]*\s+[A-Z]").expect("boundary regex"))
}

/// Split `fulltext` into normalized sentences, in positional order.
///
/// Boundaries are runs of `.?!` immediately followed by optional digits,
/// whitespace, and a capital letter, so the punctuation survives footnote
/// numerals. Each fragment keeps only its alphabetic characters, lowercased;
/// fragments shorter than `cutoff` characters are dropped.
pub fn sentences(fulltext: &str, cutoff: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in terminator().find_iter(fulltext) {
        if boundary_context().is_match(&fulltext[m.end()..]) {
            push_normalized(&mut out, &fulltext[start..m.start()], cutoff);
            start = m.end();
        }
    }
    push_normalized(&mut out, &fulltext[start..], cutoff);
    out
}

fn push_normalized(out: &mut Vec<String>, fragment: &str, cutoff: usize) {
    let normalized: String = fragment
        .chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_lowercase)
        .collect();
    if normalized.chars().count() >= cutoff {
        out.push(normalized);
    }
}
