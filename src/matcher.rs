//! # Matcher
//!
//! Candidate generation and the match decision for one card: probe the
//! sentence index for every fingerprint, fold occurrences into per-candidate
//! position ranges, and accept candidates by the inside/edge overlap test.

use crate::context::Context;
use crate::error::Result;
use crate::model::{CardId, Fingerprint};
use crate::normalize;
use std::collections::BTreeMap;
use tracing::warn;

/// What the matcher learned about one card.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Cards that pass the overlap test, ascending.
    pub matches: Vec<CardId>,
    /// Whether this card's own occurrences were already in the index.
    pub existing_sentences: bool,
    /// The normalized sentences the decision was made over.
    pub sentences: Vec<String>,
}

/// Index positions of the shared sentences, one side per card.
#[derive(Debug, Clone, Copy)]
struct Side {
    card_len: u32,
    min: u16,
    max: u16,
}

#[derive(Debug, Clone, Copy)]
struct PositionRange {
    a_min: u16,
    a_max: u16,
    b_min: u16,
    b_max: u16,
}

impl PositionRange {
    fn new(a: u16, b: u16) -> Self {
        Self {
            a_min: a,
            a_max: a,
            b_min: b,
            b_max: b,
        }
    }

    fn update(&mut self, a: u16, b: u16) {
        self.a_min = self.a_min.min(a);
        self.a_max = self.a_max.max(a);
        self.b_min = self.b_min.min(b);
        self.b_max = self.b_max.max(b);
    }
}

/// Derive the match list for `card`.
///
/// When `sentences` is `None` the card's fulltext is pulled from the
/// evidence store and normalized; a card the evidence store does not know
/// is a `MissingCard` error.
pub(crate) async fn match_card(
    ctx: &mut Context,
    card: CardId,
    sentences: Option<&[String]>,
) -> Result<MatchOutcome> {
    let sentences: Vec<String> = match sentences {
        Some(sentences) => sentences.to_vec(),
        None => {
            let fulltext = ctx.fulltext(card).await?;
            normalize::sentences(&fulltext, ctx.tuning().sentence_cutoff)
        }
    };
    let fingerprints: Vec<Fingerprint> = sentences.iter().map(|s| Fingerprint::of(s)).collect();

    let mut existing = false;
    let mut ranges: BTreeMap<CardId, PositionRange> = BTreeMap::new();
    for (position, fingerprint) in fingerprints.iter().enumerate() {
        let position = position as u16;
        let occurrences: Vec<(CardId, u16)> = {
            let shard = ctx.shard(fingerprint.bucket).await?;
            shard.occurrences(fingerprint.sub_key).collect()
        };
        for (other, other_position) in occurrences {
            if other == card {
                existing = true;
                continue;
            }
            ranges
                .entry(other)
                .and_modify(|range| range.update(position, other_position))
                .or_insert_with(|| PositionRange::new(position, other_position));
        }
    }

    let own_len = sentences.len() as u32;
    let mut matches = Vec::new();
    for (other, range) in ranges {
        let Some(other_len) = ctx.card_length(other).await? else {
            warn!(card = %other, "indexed card has no recorded length, skipping");
            continue;
        };
        let a = Side {
            card_len: own_len,
            min: range.a_min,
            max: range.a_max,
        };
        let b = Side {
            card_len: other_len,
            min: range.b_min,
            max: range.b_max,
        };
        if is_match(ctx, a, b) {
            matches.push(other);
        }
    }

    Ok(MatchOutcome {
        matches,
        existing_sentences: existing,
        sentences,
    })
}

fn is_match(ctx: &Context, a: Side, b: Side) -> bool {
    check_match(ctx, a, b) || check_match(ctx, b, a)
}

/// One direction of the overlap test: either `x` sits almost entirely
/// inside the shared span ("inside"), or `x`'s head lines up with `y`'s
/// tail ("edge").
fn check_match(ctx: &Context, x: Side, y: Side) -> bool {
    let tuning = ctx.tuning();
    let span = x.max as i64 + 1 - x.min as i64;
    let inside = x.card_len > 3 && x.card_len as i64 - span <= tuning.inside_tolerance as i64;
    let edge = x.min as i64 <= tuning.edge_tolerance as i64
        && y.card_len as i64 - y.max as i64 <= tuning.edge_tolerance as i64;
    inside || edge
}
