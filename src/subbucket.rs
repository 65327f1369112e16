//! # SubBucket
//!
//! The tight cluster: member cards with internal match counts, plus
//! external match counts for nearby non-members, and the add/remove/resolve
//! algorithms that keep the majority-match invariant true.

use crate::bucketset;
use crate::config::DedupTuning;
use crate::context::Context;
use crate::error::{DedupError, Result};
use crate::matcher;
use crate::model::{BucketSetKey, CardId, SubBucketKey};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const FIELD_BUCKET_SET: &str = "bs";
const FIELD_CARD_PREFIX: char = 'c';
const FIELD_MATCHING_PREFIX: char = 'm';

/// A tight near-duplicate cluster.
///
/// `cards` maps each member to the number of *other* members it matches;
/// `matching` maps each non-member to the number of members it matches.
/// The two maps are disjoint, `cards` is non-empty while the bucket exists,
/// and `key` is always the minimum member id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBucket {
    pub key: SubBucketKey,
    pub bucket_set: BucketSetKey,
    pub cards: BTreeMap<CardId, u32>,
    pub matching: BTreeMap<CardId, u32>,
}

impl SubBucket {
    /// A brand-new bucket rooted at `card`, carrying its match list as
    /// external counts.
    pub fn seed(card: CardId, matches: &[CardId]) -> Self {
        let key = SubBucketKey::from(card);
        let mut matching = BTreeMap::new();
        for &m in matches {
            if m != card {
                *matching.entry(m).or_insert(0) += 1;
            }
        }
        let mut cards = BTreeMap::new();
        cards.insert(card, 1);
        Self {
            key,
            bucket_set: BucketSetKey::from(key),
            cards,
            matching,
        }
    }

    /// Parse the `SB:<key>` hash: `bs` plus `c<id>`/`m<id>` counter fields.
    pub fn parse(key: SubBucketKey, kv_key: &str, fields: &[(String, String)]) -> Result<Self> {
        let mut bucket_set = None;
        let mut cards = BTreeMap::new();
        let mut matching = BTreeMap::new();
        for (field, value) in fields {
            if field == FIELD_BUCKET_SET {
                bucket_set = Some(BucketSetKey(parse_u32(kv_key, field, value)?));
                continue;
            }
            let mut chars = field.chars();
            let (prefix, id) = match chars.next() {
                Some(prefix) => (prefix, chars.as_str()),
                None => {
                    return Err(invalid_field(kv_key, field));
                }
            };
            let id = CardId(
                id.parse()
                    .map_err(|_| invalid_field(kv_key, field))?,
            );
            let count = parse_u32(kv_key, field, value)?;
            match prefix {
                FIELD_CARD_PREFIX => {
                    cards.insert(id, count);
                }
                FIELD_MATCHING_PREFIX => {
                    matching.insert(id, count);
                }
                _ => return Err(invalid_field(kv_key, field)),
            }
        }
        let bucket_set = bucket_set.ok_or_else(|| invalid_field(kv_key, FIELD_BUCKET_SET))?;
        Ok(Self {
            key,
            bucket_set,
            cards,
            matching,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(1 + self.cards.len() + self.matching.len());
        fields.push((FIELD_BUCKET_SET.to_string(), self.bucket_set.to_string()));
        for (id, count) in &self.cards {
            fields.push((format!("{FIELD_CARD_PREFIX}{id}"), count.to_string()));
        }
        for (id, count) in &self.matching {
            fields.push((format!("{FIELD_MATCHING_PREFIX}{id}"), count.to_string()));
        }
        fields
    }

    pub fn min_card(&self) -> Option<CardId> {
        self.cards.keys().next().copied()
    }

    /// How many members appear in `matches`.
    pub fn intersection_count(&self, matches: &[CardId]) -> u32 {
        matches
            .iter()
            .filter(|m| self.cards.contains_key(*m))
            .count() as u32
    }

    /// SHOULD_MATCH over this bucket: would a card with the given match
    /// list belong here?
    pub fn does_bucket_match(&self, matches: &[CardId], tuning: &DedupTuning) -> bool {
        tuning.should_match(self.intersection_count(matches), self.cards.len() as u32)
    }

    /// The first member whose internal count no longer clears the majority
    /// threshold.
    fn violating_member(&self, tuning: &DedupTuning) -> Option<CardId> {
        let total = self.cards.len() as u32;
        self.cards
            .iter()
            .find(|(_, &count)| !tuning.should_match(count, total))
            .map(|(&id, _)| id)
    }
}

fn parse_u32(kv_key: &str, field: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| invalid_field(kv_key, field))
}

fn invalid_field(kv_key: &str, field: &str) -> DedupError {
    DedupError::InvalidHashKey {
        key: kv_key.to_string(),
        field: field.to_string(),
    }
}

/// Add `id` to the bucket, crediting every member it matches.
///
/// Returns the bucket's key, which may change when the new card becomes the
/// minimum member.
pub(crate) async fn add_card(
    ctx: &mut Context,
    key: SubBucketKey,
    id: CardId,
    matches: &[CardId],
) -> Result<SubBucketKey> {
    let mut sb = ctx.sub_bucket(key).await?;
    if sb.cards.contains_key(&id) {
        warn!(card = %id, bucket = %key, "card already in bucket");
        return Ok(key);
    }
    sb.matching.remove(&id);
    sb.cards.insert(id, 1);
    for &m in matches {
        if m == id {
            continue;
        }
        if sb.cards.contains_key(&m) {
            if let Some(count) = sb.cards.get_mut(&id) {
                *count += 1;
            }
            if let Some(count) = sb.cards.get_mut(&m) {
                *count += 1;
            }
        } else {
            *sb.matching.entry(m).or_insert(0) += 1;
        }
    }
    ctx.put_sub_bucket(sb);
    ctx.set_card_bucket(id, Some(key)).await?;
    Ok(propagate_key(ctx, key).await?.unwrap_or(key))
}

/// Refresh the external count for a non-member before an add decision.
pub(crate) async fn set_matches(
    ctx: &mut Context,
    key: SubBucketKey,
    id: CardId,
    matches: &[CardId],
) -> Result<()> {
    let mut sb = ctx.sub_bucket(key).await?;
    if sb.cards.contains_key(&id) {
        return Ok(());
    }
    let count = sb.intersection_count(matches);
    if count > 0 {
        sb.matching.insert(id, count);
    } else {
        sb.matching.remove(&id);
    }
    ctx.put_sub_bucket(sb);
    Ok(())
}

/// Evict `id`: clear its back-reference, withdraw its credit from every
/// counter it contributed to, and push it back onto the ingestion queue.
///
/// Returns the bucket's current key, or `None` when the bucket emptied and
/// was deleted.
pub(crate) async fn remove_card(
    ctx: &mut Context,
    key: SubBucketKey,
    id: CardId,
) -> Result<Option<SubBucketKey>> {
    let mut sb = ctx.sub_bucket(key).await?;
    sb.cards.remove(&id);
    ctx.put_sub_bucket(sb);
    ctx.set_card_bucket(id, None).await?;

    // The card's matches are re-derived rather than remembered; its credit
    // comes off whichever side each match sits on today. A member drained
    // to zero is left for the removal sweep, which evicts it through this
    // same path.
    let outcome = matcher::match_card(ctx, id, None).await?;
    let mut sb = ctx.sub_bucket(key).await?;
    for m in outcome.matches {
        if let Some(count) = sb.cards.get_mut(&m) {
            *count = count.saturating_sub(1);
        } else if let Some(count) = sb.matching.get_mut(&m) {
            *count -= 1;
            if *count == 0 {
                sb.matching.remove(&m);
            }
        }
    }
    ctx.put_sub_bucket(sb);
    ctx.enqueue_card(id);
    debug!(card = %id, bucket = %key, "card evicted for reprocessing");
    propagate_key(ctx, key).await
}

/// Recompute `key = min(cards)`; rename the bucket and every back-reference
/// when it changed, or tear the bucket down when it emptied.
pub(crate) async fn propagate_key(
    ctx: &mut Context,
    key: SubBucketKey,
) -> Result<Option<SubBucketKey>> {
    let sb = ctx.sub_bucket(key).await?;
    let Some(min) = sb.min_card() else {
        let bucket_set = sb.bucket_set;
        ctx.delete_sub_bucket(key);
        bucketset::drop_member(ctx, bucket_set, key).await?;
        return Ok(None);
    };
    let new_key = SubBucketKey::from(min);
    if new_key == key {
        return Ok(Some(key));
    }
    let members: Vec<CardId> = sb.cards.keys().copied().collect();
    let bucket_set = sb.bucket_set;
    for member in members {
        ctx.set_card_bucket(member, Some(new_key)).await?;
    }
    ctx.rename_sub_bucket(key, new_key);
    bucketset::rename_member(ctx, bucket_set, key, new_key).await?;
    debug!(old = %key, new = %new_key, "sub bucket renamed");
    Ok(Some(new_key))
}

/// Sweep out members that fell below the majority threshold. Each eviction
/// shrinks the bucket, so the sweep terminates.
pub(crate) async fn resolve_removes(
    ctx: &mut Context,
    key: SubBucketKey,
) -> Result<(bool, Option<SubBucketKey>)> {
    let mut removed = false;
    let mut key = key;
    loop {
        let Some(sb) = ctx.try_sub_bucket(key).await? else {
            return Ok((removed, None));
        };
        let Some(victim) = sb.violating_member(ctx.tuning()) else {
            return Ok((removed, Some(key)));
        };
        removed = true;
        match remove_card(ctx, key, victim).await? {
            Some(next) => key = next,
            None => return Ok((removed, None)),
        }
    }
}

/// Try to pull foreign BucketSets into ours through the candidate cards.
/// After every merge the candidate set widens back to everything in
/// `matching`; the loop ends on the first round with no merge.
pub(crate) async fn resolve_updates(
    ctx: &mut Context,
    key: SubBucketKey,
    mut candidates: Vec<CardId>,
) -> Result<()> {
    loop {
        let sb = ctx.sub_bucket(key).await?;
        let my_set = sb.bucket_set;
        let mut foreign = std::collections::BTreeSet::new();
        for candidate in &candidates {
            if sb.cards.contains_key(candidate) {
                continue;
            }
            let Some(other_key) = ctx.card_sub_bucket(*candidate).await? else {
                continue;
            };
            let other_set = ctx.sub_bucket(other_key).await?.bucket_set;
            if other_set != my_set {
                foreign.insert(other_set);
            }
        }
        let mut merged = false;
        for other_set in foreign {
            if bucketset::should_merge_sets(ctx, my_set, other_set).await? {
                bucketset::merge(ctx, my_set, other_set).await?;
                merged = true;
                break;
            }
        }
        if !merged {
            return Ok(());
        }
        candidates = ctx.sub_bucket(key).await?.matching.keys().copied().collect();
    }
}

/// Stabilize this bucket after a membership change: sweep removals, let the
/// BucketSet split what no longer coheres (even when the sweep emptied this
/// bucket), then chase merges through whatever can still match.
pub(crate) async fn resolve(
    ctx: &mut Context,
    key: SubBucketKey,
    updates: &[CardId],
) -> Result<()> {
    let bucket_set = ctx.sub_bucket(key).await?.bucket_set;
    let siblings: Vec<SubBucketKey> = ctx
        .bucket_set(bucket_set)
        .await?
        .sub_buckets
        .iter()
        .copied()
        .collect();
    let (removed_any, key) = resolve_removes(ctx, key).await?;

    // The set key may have moved while members were evicted: chase it
    // through this bucket, or through a surviving sibling when the sweep
    // emptied this bucket. The siblings may have relied on the dead bucket
    // as their only bridge, so the set is re-checked either way.
    let live_set = match key {
        Some(key) => Some(ctx.sub_bucket(key).await?.bucket_set),
        None => {
            let mut found = None;
            for sibling in siblings {
                if let Some(sb) = ctx.try_sub_bucket(sibling).await? {
                    found = Some(sb.bucket_set);
                    break;
                }
            }
            found
        }
    };
    let set_changed = match live_set {
        Some(set) => bucketset::resolve(ctx, set).await?,
        None => false,
    };
    let Some(key) = key else {
        return Ok(());
    };

    let sb = ctx.sub_bucket(key).await?;
    let candidates: Vec<CardId> = if removed_any || set_changed {
        sb.matching.keys().copied().collect()
    } else {
        updates
            .iter()
            .copied()
            .filter(|c| sb.matching.contains_key(c))
            .collect()
    };
    resolve_updates(ctx, key, candidates).await?;
    propagate_key(ctx, key).await?;
    Ok(())
}
