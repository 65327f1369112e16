//! # Processor
//!
//! The single-card workflow: match, place, stabilize, index, commit. A card
//! that already owns a bucket is only walked and reported; reprocessing
//! makes no structural change.

use crate::context::{CommitSummary, Context};
use crate::error::Result;
use crate::matcher;
use crate::model::{BucketSetKey, CardId, Fingerprint, SubBucketKey};
use crate::subbucket::{self, SubBucket};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

/// One touched BucketSet and its final card membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketUpdate {
    pub bucket: BucketSetKey,
    pub cards: Vec<CardId>,
}

/// What one committed card changed, for the downstream driver.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub updates: Vec<BucketUpdate>,
    pub deletes: Vec<BucketSetKey>,
}

impl From<CommitSummary> for ProcessReport {
    fn from(summary: CommitSummary) -> Self {
        Self {
            updates: summary
                .updates
                .into_iter()
                .map(|(bucket, cards)| BucketUpdate { bucket, cards })
                .collect(),
            deletes: summary.deletes,
        }
    }
}

enum Flow {
    /// Read-only pass over an already-clustered card.
    Walked(ProcessReport),
    /// Structural work done; the context must commit.
    Placed,
}

/// Run one card through the engine inside the given Context.
pub(crate) async fn run(
    mut ctx: Context,
    card: CardId,
    sentences: Option<&[String]>,
) -> Result<ProcessReport> {
    match run_inner(&mut ctx, card, sentences).await {
        Ok(Flow::Walked(report)) => {
            ctx.abort().await;
            Ok(report)
        }
        Ok(Flow::Placed) => Ok(ctx.finish().await?.into()),
        Err(e) => {
            ctx.abort().await;
            Err(e)
        }
    }
}

async fn run_inner(
    ctx: &mut Context,
    card: CardId,
    sentences: Option<&[String]>,
) -> Result<Flow> {
    if let Some(existing) = ctx.card_sub_bucket(card).await? {
        debug!(card = %card, bucket = %existing, "card already clustered, walking component");
        return Ok(Flow::Walked(walk_component(ctx, existing).await?));
    }

    let outcome = matcher::match_card(ctx, card, sentences).await?;
    ctx.set_card_length(card, outcome.sentences.len() as u32)
        .await?;

    // Candidate buckets, in discovery order, each refreshed with the new
    // card's visibility before the placement decision.
    let mut candidates: Vec<SubBucketKey> = Vec::new();
    for m in &outcome.matches {
        if let Some(key) = ctx.card_sub_bucket(*m).await? {
            if !candidates.contains(&key) {
                candidates.push(key);
            }
        }
    }
    for &key in &candidates {
        subbucket::set_matches(ctx, key, card, &outcome.matches).await?;
    }

    let mut best: Option<(SubBucketKey, usize)> = None;
    for &key in &candidates {
        let sb = ctx.sub_bucket(key).await?;
        if sb.does_bucket_match(&outcome.matches, ctx.tuning())
            && best.map_or(true, |(_, size)| sb.cards.len() > size)
        {
            best = Some((key, sb.cards.len()));
        }
    }

    let target = match best {
        Some((key, _)) => subbucket::add_card(ctx, key, card, &outcome.matches).await?,
        None => {
            let seed = SubBucket::seed(card, &outcome.matches);
            let key = seed.key;
            ctx.put_sub_bucket(seed);
            ctx.set_card_bucket(card, Some(key)).await?;
            debug!(card = %card, "no bucket matched, seeding a new one");
            key
        }
    };

    subbucket::resolve(ctx, target, &outcome.matches).await?;

    if !outcome.existing_sentences {
        for (index, sentence) in outcome.sentences.iter().enumerate() {
            ctx.add_occurrence(Fingerprint::of(sentence), card, index as u16)
                .await?;
        }
    }
    Ok(Flow::Placed)
}

/// Walk the connected component of SubBuckets reachable from `start`
/// through `matching` edges and shared BucketSets, and summarize every
/// BucketSet seen.
async fn walk_component(ctx: &mut Context, start: SubBucketKey) -> Result<ProcessReport> {
    let mut seen_buckets = BTreeSet::new();
    let mut seen_sets = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(key) = stack.pop() {
        if !seen_buckets.insert(key) {
            continue;
        }
        let sb = ctx.sub_bucket(key).await?;
        if seen_sets.insert(sb.bucket_set) {
            let bs = ctx.bucket_set(sb.bucket_set).await?;
            stack.extend(bs.sub_buckets.iter().copied());
        }
        for m in sb.matching.keys() {
            if let Some(other) = ctx.card_sub_bucket(*m).await? {
                stack.push(other);
            }
        }
    }

    let mut updates = Vec::new();
    for set_key in seen_sets {
        let bs = ctx.bucket_set(set_key).await?;
        let mut cards = BTreeSet::new();
        for key in &bs.sub_buckets {
            cards.extend(ctx.sub_bucket(*key).await?.cards.keys().copied());
        }
        updates.push(BucketUpdate {
            bucket: set_key,
            cards: cards.into_iter().collect(),
        });
    }
    Ok(ProcessReport {
        updates,
        deletes: Vec::new(),
    })
}
