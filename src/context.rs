//! # Context (Unit of Work)
//!
//! One Context wraps one card's pass through the engine: an isolated KV
//! connection, per-entity caches with dirty and deleted sets, WATCH
//! tracking, and the ordered save that commits everything in a single
//! MULTI/EXEC.
//!
//! Cross-entity references are logical keys resolved through these caches;
//! an entity is loaded at most once per Context and every key is WATCHed
//! before its first read, so a concurrent writer anywhere in the graph
//! aborts the commit instead of corrupting it.

use crate::bucketset::BucketSet;
use crate::cards::CardInfo;
use crate::config::DedupTuning;
use crate::error::{DedupError, Result};
use crate::evidence::EvidenceStore;
use crate::keys::KeySpace;
use crate::kv::{KvConnection, KvOp};
use crate::model::{BucketSetKey, CardId, Fingerprint, ShardKey, SubBucketKey};
use crate::sentences::SentenceShard;
use crate::subbucket::SubBucket;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

/// Per-entity cache with dirty/deleted bookkeeping.
struct Repo<K, V> {
    cache: FxHashMap<K, V>,
    dirty: FxHashSet<K>,
    deleted: FxHashSet<K>,
}

impl<K: Eq + Hash + Copy, V> Repo<K, V> {
    fn new() -> Self {
        Self {
            cache: FxHashMap::default(),
            dirty: FxHashSet::default(),
            deleted: FxHashSet::default(),
        }
    }

    fn put(&mut self, key: K, value: V) {
        self.cache.insert(key, value);
        self.dirty.insert(key);
        self.deleted.remove(&key);
    }

    fn load(&mut self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    fn delete(&mut self, key: K) {
        self.cache.remove(&key);
        self.dirty.remove(&key);
        self.deleted.insert(key);
    }
}

/// What a committed unit of work changed, for the driver.
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    /// Touched BucketSets with their final card membership.
    pub updates: Vec<(BucketSetKey, Vec<CardId>)>,
    /// BucketSet keys removed by this unit of work.
    pub deletes: Vec<BucketSetKey>,
}

/// The unit of work around a single card's ingestion.
pub struct Context {
    conn: Box<dyn KvConnection>,
    tuning: DedupTuning,
    keys: KeySpace,
    evidence: Arc<dyn EvidenceStore>,
    watched: FxHashSet<String>,
    cards: Repo<CardId, CardInfo>,
    sub_buckets: Repo<SubBucketKey, SubBucket>,
    bucket_sets: Repo<BucketSetKey, BucketSet>,
    shards: FxHashMap<ShardKey, SentenceShard>,
    requeue: Vec<CardId>,
}

impl Context {
    pub fn new(
        conn: Box<dyn KvConnection>,
        evidence: Arc<dyn EvidenceStore>,
        tuning: DedupTuning,
    ) -> Self {
        let keys = KeySpace::new(tuning.key_prefix.clone());
        Self {
            conn,
            tuning,
            keys,
            evidence,
            watched: FxHashSet::default(),
            cards: Repo::new(),
            sub_buckets: Repo::new(),
            bucket_sets: Repo::new(),
            shards: FxHashMap::default(),
            requeue: Vec::new(),
        }
    }

    pub fn tuning(&self) -> &DedupTuning {
        &self.tuning
    }

    /// WATCH a key before its first read within this Context.
    async fn watch(&mut self, key: &str) -> Result<()> {
        if self.watched.insert(key.to_string()) {
            self.conn.watch(key).await?;
        }
        Ok(())
    }

    // ----- cards -----

    /// Load a card's persistent state. Absent cards read as empty.
    pub async fn card(&mut self, id: CardId) -> Result<CardInfo> {
        if let Some(info) = self.cards.cache.get(&id) {
            return Ok(*info);
        }
        let key = self.keys.card(id);
        self.watch(&key).await?;
        let fields = self.conn.hash_get_all(&key).await?;
        let info = match fields {
            Some(fields) => CardInfo::parse(&key, &fields)?,
            None => CardInfo::default(),
        };
        self.cards.load(id, info);
        Ok(info)
    }

    pub async fn card_length(&mut self, id: CardId) -> Result<Option<u32>> {
        Ok(self.card(id).await?.length)
    }

    pub async fn card_sub_bucket(&mut self, id: CardId) -> Result<Option<SubBucketKey>> {
        Ok(self.card(id).await?.sub_bucket)
    }

    /// Record a card's normalized sentence count. Written once; later calls
    /// with the same value are no-ops.
    pub async fn set_card_length(&mut self, id: CardId, length: u32) -> Result<()> {
        let mut info = self.card(id).await?;
        if info.length == Some(length) {
            return Ok(());
        }
        info.length = Some(length);
        self.cards.put(id, info);
        Ok(())
    }

    pub async fn set_card_bucket(&mut self, id: CardId, bucket: Option<SubBucketKey>) -> Result<()> {
        let mut info = self.card(id).await?;
        if info.sub_bucket == bucket {
            // A propagated rename still has to re-serialize the reference.
            self.cards.dirty.insert(id);
            return Ok(());
        }
        info.sub_bucket = bucket;
        self.cards.put(id, info);
        Ok(())
    }

    // ----- sub buckets -----

    pub async fn try_sub_bucket(&mut self, key: SubBucketKey) -> Result<Option<SubBucket>> {
        if let Some(sb) = self.sub_buckets.cache.get(&key) {
            return Ok(Some(sb.clone()));
        }
        if self.sub_buckets.deleted.contains(&key) {
            return Ok(None);
        }
        let kv_key = self.keys.sub_bucket(key);
        self.watch(&kv_key).await?;
        let fields = self.conn.hash_get_all(&kv_key).await?;
        match fields {
            Some(fields) => {
                let sb = SubBucket::parse(key, &kv_key, &fields)?;
                self.sub_buckets.load(key, sb.clone());
                Ok(Some(sb))
            }
            None => Ok(None),
        }
    }

    pub async fn sub_bucket(&mut self, key: SubBucketKey) -> Result<SubBucket> {
        self.try_sub_bucket(key).await?.ok_or_else(|| {
            DedupError::Infrastructure(format!("dangling sub bucket reference {key}"))
        })
    }

    pub fn put_sub_bucket(&mut self, sb: SubBucket) {
        self.sub_buckets.put(sb.key, sb);
    }

    pub fn delete_sub_bucket(&mut self, key: SubBucketKey) {
        self.sub_buckets.delete(key);
    }

    /// Move a SubBucket to a new key: the old KV key is deleted at save
    /// time, the entity re-serializes under the new one.
    pub fn rename_sub_bucket(&mut self, old: SubBucketKey, new: SubBucketKey) {
        if old == new {
            return;
        }
        if let Some(mut sb) = self.sub_buckets.cache.remove(&old) {
            sb.key = new;
            self.sub_buckets.delete(old);
            self.sub_buckets.put(new, sb);
        }
    }

    // ----- bucket sets -----

    /// Load a BucketSet. Singletons are never persisted, so a missing key
    /// reconstitutes as the singleton containing the same-numbered
    /// SubBucket.
    pub async fn bucket_set(&mut self, key: BucketSetKey) -> Result<BucketSet> {
        if let Some(bs) = self.bucket_sets.cache.get(&key) {
            return Ok(bs.clone());
        }
        if self.bucket_sets.deleted.contains(&key) {
            // Deleted in this unit of work; the stale persisted members must
            // not resurface.
            let bs = BucketSet::singleton(key);
            self.bucket_sets.load(key, bs.clone());
            return Ok(bs);
        }
        let kv_key = self.keys.bucket_set(key);
        self.watch(&kv_key).await?;
        let members = self.conn.set_members(&kv_key).await?;
        let bs = match members {
            Some(members) => BucketSet::parse(key, &kv_key, &members)?,
            None => BucketSet::singleton(key),
        };
        self.bucket_sets.load(key, bs.clone());
        Ok(bs)
    }

    pub fn put_bucket_set(&mut self, bs: BucketSet) {
        self.bucket_sets.put(bs.key, bs);
    }

    pub fn delete_bucket_set(&mut self, key: BucketSetKey) {
        self.bucket_sets.delete(key);
    }

    pub fn rename_bucket_set(&mut self, old: BucketSetKey, new: BucketSetKey) {
        if old == new {
            return;
        }
        if let Some(mut bs) = self.bucket_sets.cache.remove(&old) {
            bs.key = new;
            self.bucket_sets.delete(old);
            self.bucket_sets.put(new, bs);
        }
    }

    // ----- sentence shards -----

    pub async fn shard(&mut self, bucket: ShardKey) -> Result<&SentenceShard> {
        if !self.shards.contains_key(&bucket) {
            let kv_key = self.keys.shard(bucket);
            self.watch(&kv_key).await?;
            let bytes = self.conn.get(&kv_key).await?;
            let shard = match bytes {
                Some(bytes) => SentenceShard::parse(bucket, &bytes)?,
                None => SentenceShard::empty(bucket),
            };
            self.shards.insert(bucket, shard);
        }
        Ok(&self.shards[&bucket])
    }

    /// Append one occurrence to the owning shard's pending writes.
    pub async fn add_occurrence(
        &mut self,
        fingerprint: Fingerprint,
        card: CardId,
        index: u16,
    ) -> Result<()> {
        self.shard(fingerprint.bucket).await?;
        if let Some(shard) = self.shards.get_mut(&fingerprint.bucket) {
            shard.add_occurrence(fingerprint, card, index);
        }
        Ok(())
    }

    // ----- evidence and queue -----

    /// A card's fulltext from the evidence store.
    pub async fn fulltext(&mut self, card: CardId) -> Result<String> {
        self.evidence
            .lookup_fulltext(card)
            .await?
            .ok_or(DedupError::MissingCard(card))
    }

    /// Schedule a card for reprocessing; pushed onto the ingestion queue in
    /// the same EXEC as the removal that displaced it.
    pub fn enqueue_card(&mut self, card: CardId) {
        self.requeue.push(card);
    }

    // ----- commit -----

    /// Save every dirty entity in dependency order and EXEC.
    ///
    /// Order: SubBucket → Card → Sentence shards → BucketSet → queue, so no
    /// committed reference dangles. A WATCH failure surfaces as
    /// `OptimisticConflict` and the caller re-runs the whole unit of work.
    pub async fn finish(mut self) -> Result<CommitSummary> {
        let mut touched: BTreeSet<BucketSetKey> =
            self.bucket_sets.dirty.iter().copied().collect();
        for key in self.sub_buckets.dirty.iter() {
            if let Some(sb) = self.sub_buckets.cache.get(key) {
                touched.insert(sb.bucket_set);
            }
        }
        touched.retain(|key| !self.bucket_sets.deleted.contains(key));

        let mut updates = Vec::new();
        for bs_key in touched {
            let members = self.bucket_set(bs_key).await?.sub_buckets;
            let mut cards = BTreeSet::new();
            for sb_key in members {
                let sb = self.sub_bucket(sb_key).await?;
                cards.extend(sb.cards.keys().copied());
            }
            updates.push((bs_key, cards.into_iter().collect()));
        }
        let mut deletes: Vec<BucketSetKey> =
            self.bucket_sets.deleted.iter().copied().collect();
        deletes.sort();

        let mut ops = Vec::new();

        let mut deleted_sbs: Vec<SubBucketKey> =
            self.sub_buckets.deleted.iter().copied().collect();
        deleted_sbs.sort();
        for key in deleted_sbs {
            ops.push(KvOp::Delete {
                key: self.keys.sub_bucket(key),
            });
        }
        let mut dirty_sbs: Vec<SubBucketKey> = self.sub_buckets.dirty.iter().copied().collect();
        dirty_sbs.sort();
        for key in dirty_sbs {
            if let Some(sb) = self.sub_buckets.cache.get(&key) {
                ops.push(KvOp::WriteHash {
                    key: self.keys.sub_bucket(key),
                    fields: sb.to_fields(),
                });
            }
        }

        let mut dirty_cards: Vec<CardId> = self.cards.dirty.iter().copied().collect();
        dirty_cards.sort();
        for id in dirty_cards {
            if let Some(info) = self.cards.cache.get(&id) {
                let fields = info.to_fields();
                if fields.is_empty() {
                    ops.push(KvOp::Delete {
                        key: self.keys.card(id),
                    });
                } else {
                    ops.push(KvOp::WriteHash {
                        key: self.keys.card(id),
                        fields,
                    });
                }
            }
        }

        let mut shard_keys: Vec<ShardKey> = self
            .shards
            .iter()
            .filter(|(_, shard)| shard.has_pending())
            .map(|(key, _)| *key)
            .collect();
        shard_keys.sort();
        for key in shard_keys {
            ops.push(KvOp::Append {
                key: self.keys.shard(key),
                data: self.shards[&key].pending_bytes(),
            });
        }

        for key in &deletes {
            ops.push(KvOp::Delete {
                key: self.keys.bucket_set(*key),
            });
        }
        let mut dirty_sets: Vec<BucketSetKey> = self.bucket_sets.dirty.iter().copied().collect();
        dirty_sets.sort();
        for key in dirty_sets {
            if let Some(bs) = self.bucket_sets.cache.get(&key) {
                // Single-member sets are implicit; their key must not stay
                // behind in the store.
                if bs.sub_buckets.len() < 2 {
                    ops.push(KvOp::Delete {
                        key: self.keys.bucket_set(key),
                    });
                } else {
                    ops.push(KvOp::WriteSet {
                        key: self.keys.bucket_set(key),
                        members: bs.to_members(),
                    });
                }
            }
        }

        for card in &self.requeue {
            ops.push(KvOp::ListPush {
                key: self.keys.queue(),
                value: card.to_string(),
            });
        }

        let committed = match self.conn.exec(ops).await {
            Ok(committed) => committed,
            Err(e) => {
                let _ = self.conn.quit().await;
                return Err(e.into());
            }
        };
        if !committed {
            let _ = self.conn.quit().await;
            return Err(DedupError::OptimisticConflict);
        }
        Ok(CommitSummary { updates, deletes })
    }

    /// Drop the unit of work, releasing any watches it holds.
    pub async fn abort(mut self) {
        let _ = self.conn.quit().await;
    }
}
