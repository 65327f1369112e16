//! # BucketSet
//!
//! The loose family: a set of SubBucket keys held together by the
//! SHOULD_MERGE predicate, with merge/split/rename maintenance. Aggregate
//! decisions go through a card-set view that unions members and sums
//! external match counts across the constituent SubBuckets.

use crate::context::Context;
use crate::error::{DedupError, Result};
use crate::model::{BucketSetKey, CardId, SubBucketKey};
use crate::subbucket;
use crate::config::DedupTuning;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A loose family of SubBuckets. `key` is the minimum member key; a set
/// with fewer than two members is implicit and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSet {
    pub key: BucketSetKey,
    pub sub_buckets: BTreeSet<SubBucketKey>,
}

impl BucketSet {
    /// The implicit singleton for a lone SubBucket.
    pub fn singleton(key: BucketSetKey) -> Self {
        let mut sub_buckets = BTreeSet::new();
        sub_buckets.insert(SubBucketKey(key.0));
        Self { key, sub_buckets }
    }

    /// Parse the `BS:<key>` set of decimal SubBucket keys.
    pub fn parse(key: BucketSetKey, kv_key: &str, members: &[String]) -> Result<Self> {
        let mut sub_buckets = BTreeSet::new();
        for member in members {
            let parsed = member.parse().map_err(|_| DedupError::InvalidHashKey {
                key: kv_key.to_string(),
                field: member.clone(),
            })?;
            sub_buckets.insert(SubBucketKey(parsed));
        }
        Ok(Self { key, sub_buckets })
    }

    pub fn to_members(&self) -> Vec<String> {
        self.sub_buckets.iter().map(|k| k.to_string()).collect()
    }

    pub fn min_member(&self) -> Option<SubBucketKey> {
        self.sub_buckets.iter().next().copied()
    }
}

/// Aggregate view of a collection of SubBuckets: the union of their members
/// and the per-card sums of their external match counts.
#[derive(Debug, Default)]
struct CardSetView {
    members: BTreeSet<CardId>,
    matching: BTreeMap<CardId, u32>,
}

impl CardSetView {
    fn size(&self) -> u32 {
        self.members.len() as u32
    }
}

async fn card_set_view(ctx: &mut Context, keys: &[SubBucketKey]) -> Result<CardSetView> {
    let mut view = CardSetView::default();
    for key in keys {
        let sb = ctx.sub_bucket(*key).await?;
        view.members.extend(sb.cards.keys().copied());
        for (card, count) in sb.matching {
            *view.matching.entry(card).or_insert(0) += count;
        }
    }
    Ok(view)
}

/// The asymmetric, recursive merge predicate: count B's members that A
/// bridges strongly enough, then apply SHOULD_MERGE again to that count
/// against B's size.
fn should_merge_views(tuning: &DedupTuning, a: &CardSetView, b: &CardSetView) -> bool {
    let bridged = b
        .members
        .iter()
        .filter(|m| tuning.should_merge(a.matching.get(*m).copied().unwrap_or(0), a.size()))
        .count() as u32;
    tuning.should_merge(bridged, b.size())
}

/// SHOULD_MERGE between two whole BucketSets.
pub(crate) async fn should_merge_sets(
    ctx: &mut Context,
    a: BucketSetKey,
    b: BucketSetKey,
) -> Result<bool> {
    let a_members: Vec<SubBucketKey> = ctx.bucket_set(a).await?.sub_buckets.into_iter().collect();
    let b_members: Vec<SubBucketKey> = ctx.bucket_set(b).await?.sub_buckets.into_iter().collect();
    let a_view = card_set_view(ctx, &a_members).await?;
    let b_view = card_set_view(ctx, &b_members).await?;
    Ok(should_merge_views(ctx.tuning(), &a_view, &b_view))
}

/// Absorb `from` into `into`, re-pointing every moved SubBucket.
pub(crate) async fn merge(
    ctx: &mut Context,
    into: BucketSetKey,
    from: BucketSetKey,
) -> Result<BucketSetKey> {
    if into == from {
        return Ok(into);
    }
    let moved: Vec<SubBucketKey> = ctx.bucket_set(from).await?.sub_buckets.into_iter().collect();
    ctx.delete_bucket_set(from);
    let mut dst = ctx.bucket_set(into).await?;
    dst.sub_buckets.extend(moved.iter().copied());
    ctx.put_bucket_set(dst);
    for key in moved {
        let mut sb = ctx.sub_bucket(key).await?;
        sb.bucket_set = into;
        ctx.put_sub_bucket(sb);
    }
    debug!(into = %into, from = %from, "bucket sets merged");
    propagate_key(ctx, into).await
}

/// Remove a member on the SubBucket-deletion path. No fresh singleton, no
/// re-attach; an emptied set is deleted.
pub(crate) async fn drop_member(
    ctx: &mut Context,
    key: BucketSetKey,
    member: SubBucketKey,
) -> Result<()> {
    let mut bs = ctx.bucket_set(key).await?;
    bs.sub_buckets.remove(&member);
    let emptied = bs.sub_buckets.is_empty();
    ctx.put_bucket_set(bs);
    if emptied {
        ctx.delete_bucket_set(key);
        return Ok(());
    }
    propagate_key(ctx, key).await?;
    Ok(())
}

/// Swap a renamed member key, then re-derive the set key.
pub(crate) async fn rename_member(
    ctx: &mut Context,
    key: BucketSetKey,
    old: SubBucketKey,
    new: SubBucketKey,
) -> Result<()> {
    let mut bs = ctx.bucket_set(key).await?;
    bs.sub_buckets.remove(&old);
    bs.sub_buckets.insert(new);
    ctx.put_bucket_set(bs);
    propagate_key(ctx, key).await?;
    Ok(())
}

/// Evict a live SubBucket into its own fresh singleton set and let it
/// re-attach wherever it still fits.
pub(crate) async fn remove_sub_bucket(
    ctx: &mut Context,
    key: BucketSetKey,
    member: SubBucketKey,
) -> Result<BucketSetKey> {
    let mut bs = ctx.bucket_set(key).await?;
    bs.sub_buckets.remove(&member);
    ctx.put_bucket_set(bs);
    let remaining_key = propagate_key(ctx, key).await?;

    let fresh = BucketSetKey::from(member);
    ctx.put_bucket_set(BucketSet::singleton(fresh));

    let mut sb = ctx.sub_bucket(member).await?;
    sb.bucket_set = fresh;
    let candidates: Vec<CardId> = sb.matching.keys().copied().collect();
    ctx.put_sub_bucket(sb);
    debug!(set = %key, bucket = %member, "sub bucket split out");

    subbucket::resolve_updates(ctx, member, candidates).await?;
    Ok(remaining_key)
}

/// Recompute `key = min(sub_buckets)`; rename the set and update every
/// member's back-reference when it changed.
pub(crate) async fn propagate_key(ctx: &mut Context, key: BucketSetKey) -> Result<BucketSetKey> {
    let bs = ctx.bucket_set(key).await?;
    let Some(min) = bs.min_member() else {
        ctx.delete_bucket_set(key);
        return Ok(key);
    };
    let new_key = BucketSetKey::from(min);
    if new_key == key {
        return Ok(key);
    }
    let members: Vec<SubBucketKey> = bs.sub_buckets.iter().copied().collect();
    ctx.rename_bucket_set(key, new_key);
    for member in members {
        let mut sb = ctx.sub_bucket(member).await?;
        sb.bucket_set = new_key;
        ctx.put_sub_bucket(sb);
    }
    debug!(old = %key, new = %new_key, "bucket set renamed");
    Ok(new_key)
}

/// Split out members that no longer cohere with the rest of the set.
///
/// Each evicted member may immediately re-attach elsewhere; a membership
/// state seen before means the predicate is oscillating between the two
/// directions of the asymmetric test, and the loop stops rather than cycle.
pub(crate) async fn resolve(ctx: &mut Context, key: BucketSetKey) -> Result<bool> {
    let mut changed = false;
    let mut key = key;
    let mut seen: BTreeSet<Vec<SubBucketKey>> = BTreeSet::new();
    'outer: loop {
        let bs = ctx.bucket_set(key).await?;
        if bs.sub_buckets.len() <= 1 {
            break;
        }
        let ids: Vec<SubBucketKey> = bs.sub_buckets.iter().copied().collect();
        if !seen.insert(ids.clone()) {
            break;
        }
        for id in &ids {
            let rest: Vec<SubBucketKey> =
                ids.iter().copied().filter(|k| k != id).collect();
            let rest_view = card_set_view(ctx, &rest).await?;
            let member_view = card_set_view(ctx, std::slice::from_ref(id)).await?;
            if !should_merge_views(ctx.tuning(), &rest_view, &member_view) {
                key = remove_sub_bucket(ctx, key, *id).await?;
                changed = true;
                continue 'outer;
            }
        }
        break;
    }
    Ok(changed)
}
