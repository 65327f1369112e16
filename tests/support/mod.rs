//! Shared fixture for the integration suites: an in-memory KV + evidence
//! pair behind a `Deduper`, corpus helpers, and an invariant checker that
//! audits the raw committed state after every scenario.

#![allow(dead_code)]

use neardup::bucketset::BucketSet;
use neardup::cards::CardInfo;
use neardup::kv::Value;
use neardup::model::SENTENCE_RECORD_LEN;
use neardup::subbucket::SubBucket;
use neardup::{
    BucketSetKey, CardId, DedupTuning, Deduper, KvStore, MemoryEvidence, MemoryKv, ProcessReport,
    SubBucketKey,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct Fixture {
    pub kv: Arc<MemoryKv>,
    pub evidence: Arc<MemoryEvidence>,
    pub engine: Deduper,
    prefix: String,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_tuning(DedupTuning::default())
    }

    pub fn with_tuning(tuning: DedupTuning) -> Self {
        let prefix = tuning.key_prefix.clone();
        let kv = Arc::new(MemoryKv::new());
        let evidence = Arc::new(MemoryEvidence::new());
        let engine = Deduper::with_tuning(
            kv.clone() as Arc<dyn KvStore>,
            evidence.clone(),
            tuning,
        );
        Self {
            kv,
            evidence,
            engine,
            prefix,
        }
    }

    /// Register a card's fulltext, built from the given sentence phrases.
    pub fn add_card(&self, id: u32, sentences: &[String]) {
        self.evidence.insert(CardId(id), fulltext(sentences));
    }

    pub async fn ingest(&self, id: u32) -> ProcessReport {
        self.engine
            .process_card(CardId(id), None)
            .await
            .expect("process card")
    }

    // ----- raw state readers -----

    pub fn sub_bucket(&self, key: u32) -> Option<SubBucket> {
        let kv_key = format!("{}:SB:{key}", self.prefix);
        match self.kv.value(&kv_key)? {
            Value::Hash(fields) => {
                let mut fields: Vec<(String, String)> = fields.into_iter().collect();
                fields.sort();
                Some(SubBucket::parse(SubBucketKey(key), &kv_key, &fields).expect("parse SB"))
            }
            other => panic!("{kv_key} is not a hash: {other:?}"),
        }
    }

    /// Internal match counts of a persisted SubBucket, keyed by raw card id.
    pub fn cards_of(&self, key: u32) -> BTreeMap<u32, u32> {
        self.sub_bucket(key)
            .map(|sb| sb.cards.iter().map(|(c, n)| (c.0, *n)).collect())
            .unwrap_or_default()
    }

    pub fn matching_of(&self, key: u32) -> BTreeMap<u32, u32> {
        self.sub_bucket(key)
            .map(|sb| sb.matching.iter().map(|(c, n)| (c.0, *n)).collect())
            .unwrap_or_default()
    }

    pub fn bucket_set(&self, key: u32) -> Option<BTreeSet<u32>> {
        let kv_key = format!("{}:BS:{key}", self.prefix);
        match self.kv.value(&kv_key)? {
            Value::Set(members) => Some(
                members
                    .iter()
                    .map(|m| m.parse().expect("numeric member"))
                    .collect(),
            ),
            other => panic!("{kv_key} is not a set: {other:?}"),
        }
    }

    pub fn card_info(&self, id: u32) -> CardInfo {
        let kv_key = format!("{}:C:{id}", self.prefix);
        match self.kv.value(&kv_key) {
            None => CardInfo::default(),
            Some(Value::Hash(fields)) => {
                let mut fields: Vec<(String, String)> = fields.into_iter().collect();
                fields.sort();
                CardInfo::parse(&kv_key, &fields).expect("parse card")
            }
            Some(other) => panic!("{kv_key} is not a hash: {other:?}"),
        }
    }

    pub fn shard_len(&self, bucket: neardup::ShardKey) -> usize {
        let kv_key = format!("{}:S:{bucket}", self.prefix);
        match self.kv.value(&kv_key) {
            None => 0,
            Some(Value::Str(bytes)) => bytes.len(),
            Some(other) => panic!("{kv_key} is not a string: {other:?}"),
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.kv
            .keys()
            .into_iter()
            .filter_map(|k| self.kv.value(&k).map(|v| (k, v)))
            .collect()
    }

    /// Audit every structural invariant of the committed state.
    pub fn assert_invariants(&self) {
        check_invariants(&self.kv, &self.prefix);
    }
}

/// A deterministic, digit-free sentence long enough to clear the cutoff.
pub fn phrase(tag: &str) -> String {
    format!("synthetic sentence {tag} padded with shared filler words")
}

pub fn phrases(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| phrase(t)).collect()
}

/// Join sentences into a fulltext whose boundaries survive normalization:
/// each sentence capitalized, terminated, followed by whitespace.
pub fn fulltext(sentences: &[String]) -> String {
    let mut out = String::new();
    for sentence in sentences {
        let mut chars = sentence.chars();
        if let Some(first) = chars.next() {
            out.push_str(&first.to_uppercase().to_string());
            out.push_str(chars.as_str());
        }
        out.push_str(". ");
    }
    out.trim_end().to_string()
}

struct RawState {
    sub_buckets: BTreeMap<u32, SubBucket>,
    bucket_sets: BTreeMap<u32, BTreeSet<u32>>,
    cards: BTreeMap<u32, CardInfo>,
}

fn load_state(kv: &MemoryKv, prefix: &str) -> RawState {
    let mut state = RawState {
        sub_buckets: BTreeMap::new(),
        bucket_sets: BTreeMap::new(),
        cards: BTreeMap::new(),
    };
    for key in kv.keys() {
        let Some(suffix) = key.strip_prefix(&format!("{prefix}:")) else {
            continue;
        };
        let value = kv.value(&key).expect("value for listed key");
        if let Some(id) = suffix.strip_prefix("SB:") {
            let id: u32 = id.parse().expect("numeric SB key");
            let Value::Hash(fields) = value else {
                panic!("{key} is not a hash");
            };
            let mut fields: Vec<(String, String)> = fields.into_iter().collect();
            fields.sort();
            state.sub_buckets.insert(
                id,
                SubBucket::parse(SubBucketKey(id), &key, &fields).expect("parse SB"),
            );
        } else if let Some(id) = suffix.strip_prefix("BS:") {
            let id: u32 = id.parse().expect("numeric BS key");
            let Value::Set(members) = value else {
                panic!("{key} is not a set");
            };
            state.bucket_sets.insert(
                id,
                members.iter().map(|m| m.parse().expect("numeric")).collect(),
            );
        } else if let Some(id) = suffix.strip_prefix("C:") {
            let id: u32 = id.parse().expect("numeric card key");
            let Value::Hash(fields) = value else {
                panic!("{key} is not a hash");
            };
            let mut fields: Vec<(String, String)> = fields.into_iter().collect();
            fields.sort();
            state
                .cards
                .insert(id, CardInfo::parse(&key, &fields).expect("parse card"));
        } else if suffix.strip_prefix("S:").is_some() {
            let Value::Str(bytes) = value else {
                panic!("{key} is not a string");
            };
            // Shards must hold only whole 11-byte records.
            assert_eq!(
                bytes.len() % SENTENCE_RECORD_LEN,
                0,
                "shard {key} is not a whole number of records: {} bytes",
                bytes.len()
            );
        }
    }
    state
}

fn aggregate(
    sub_buckets: &BTreeMap<u32, SubBucket>,
    keys: &[u32],
) -> (BTreeSet<CardId>, BTreeMap<CardId, u32>) {
    let mut members = BTreeSet::new();
    let mut matching: BTreeMap<CardId, u32> = BTreeMap::new();
    for key in keys {
        let sb = &sub_buckets[key];
        members.extend(sb.cards.keys().copied());
        for (card, count) in &sb.matching {
            *matching.entry(*card).or_insert(0) += count;
        }
    }
    (members, matching)
}

fn aggregate_should_merge(
    tuning: &DedupTuning,
    sub_buckets: &BTreeMap<u32, SubBucket>,
    a: &[u32],
    b: &[u32],
) -> bool {
    let (a_members, a_matching) = aggregate(sub_buckets, a);
    let (b_members, _) = aggregate(sub_buckets, b);
    let bridged = b_members
        .iter()
        .filter(|m| {
            tuning.should_merge(
                a_matching.get(*m).copied().unwrap_or(0),
                a_members.len() as u32,
            )
        })
        .count() as u32;
    tuning.should_merge(bridged, b_members.len() as u32)
}

/// Assert every structural invariant over the raw committed state.
pub fn check_invariants(kv: &MemoryKv, prefix: &str) {
    let tuning = DedupTuning::default();
    let state = load_state(kv, prefix);

    let mut owner: BTreeMap<CardId, u32> = BTreeMap::new();
    for (key, sb) in &state.sub_buckets {
        assert!(!sb.cards.is_empty(), "empty SubBucket {key} persisted");
        let total = sb.cards.len() as u32;
        for (card, count) in &sb.cards {
            // Every member must clear the majority threshold.
            assert!(
                tuning.should_match(*count, total),
                "member {card} below majority: {count}/{total} in SB {key}"
            );
            assert!(
                !sb.matching.contains_key(card),
                "cards and matching overlap on {card} in SB {key}"
            );
            // A card belongs to at most one bucket.
            assert!(
                owner.insert(*card, *key).is_none(),
                "card {card} is in two SubBuckets"
            );
        }
        // The key is the minimum member.
        assert_eq!(
            sb.cards.keys().next().map(|c| c.0),
            Some(*key),
            "SB {key} is not keyed by its minimum member"
        );
        // The back-reference must resolve to a set containing this bucket.
        match state.bucket_sets.get(&sb.bucket_set.0) {
            Some(members) => assert!(
                members.contains(key),
                "BS {} does not list SB {key}",
                sb.bucket_set
            ),
            None => assert_eq!(
                sb.bucket_set.0, *key,
                "SB {key} names absent BS {} without being its own singleton",
                sb.bucket_set
            ),
        }
    }

    // Other direction: stored pointers agree with membership.
    for (card, key) in &owner {
        assert_eq!(
            state.cards.get(&card.0).and_then(|info| info.sub_bucket),
            Some(SubBucketKey(*key)),
            "card {card} in SB {key} but its pointer disagrees"
        );
    }
    for (id, info) in &state.cards {
        if let Some(sub_bucket) = info.sub_bucket {
            let sb = state
                .sub_buckets
                .get(&sub_bucket.0)
                .unwrap_or_else(|| panic!("card {id} points at absent SB {sub_bucket}"));
            assert!(
                sb.cards.contains_key(&CardId(*id)),
                "card {id} points at SB {sub_bucket} that does not contain it"
            );
        }
    }

    for (key, members) in &state.bucket_sets {
        // Persisted sets have at least two members and carry the min key.
        assert!(
            members.len() >= 2,
            "singleton BS {key} persisted"
        );
        assert_eq!(
            members.iter().next(),
            Some(key),
            "BS {key} is not its own minimum"
        );
        let ids: Vec<u32> = members.iter().copied().collect();
        for member in &ids {
            let sb = state
                .sub_buckets
                .get(member)
                .unwrap_or_else(|| panic!("BS {key} lists absent SB {member}"));
            assert_eq!(
                sb.bucket_set,
                BucketSetKey(*key),
                "BS {key} member {member} points elsewhere"
            );
            let rest: Vec<u32> = ids.iter().copied().filter(|k| k != member).collect();
            assert!(
                aggregate_should_merge(&tuning, &state.sub_buckets, &rest, &[*member]),
                "SB {member} no longer coheres with BS {key}"
            );
        }
    }
}
