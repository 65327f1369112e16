//! Tuning knobs for matching, merging, and ingestion concurrency.

/// Tunables for the deduplication engine.
///
/// The defaults are the production values; the match predicates live here so
/// every caller applies the same arithmetic.
#[derive(Debug, Clone)]
pub struct DedupTuning {
    /// Slack allowed at the aligned edge of an edge-overlap match.
    pub edge_tolerance: u16,
    /// Sentences of the shorter card allowed to fall outside the overlap in
    /// an inside match.
    pub inside_tolerance: u16,
    /// Minimum normalized sentence length; shorter fragments are dropped.
    pub sentence_cutoff: usize,
    /// A card belongs in a bucket when it matches more than this fraction of
    /// the members.
    pub match_threshold: f64,
    /// SHOULD_MERGE ratio: fraction of one side's members bridged to the
    /// other.
    pub merge_ratio: f64,
    /// SHOULD_MERGE absolute floor: this many bridges always merge.
    pub merge_absolute: u32,
    /// Upper bound on cards processed in parallel by the worker loop.
    pub concurrent_deduplication: usize,
    /// Prefix shared by every KV key this engine touches.
    pub key_prefix: String,
}

impl Default for DedupTuning {
    fn default() -> Self {
        Self {
            edge_tolerance: 1,
            inside_tolerance: 2,
            sentence_cutoff: 20,
            match_threshold: 0.5,
            merge_ratio: 0.2,
            merge_absolute: 5,
            concurrent_deduplication: 10,
            key_prefix: "dedup".to_string(),
        }
    }
}

impl DedupTuning {
    /// Tuning for high-parallelism ingestion. The false-positive retry
    /// budget still holds at 25-way concurrency with ~30 sentences per card
    /// over 2^20 shards.
    pub fn high_concurrency() -> Self {
        Self {
            concurrent_deduplication: 25,
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// SHOULD_MATCH: does a card with `matched` hits belong among `total`
    /// members?
    pub fn should_match(&self, matched: u32, total: u32) -> bool {
        total > 0 && (matched as f64) / (total as f64) > self.match_threshold
    }

    /// SHOULD_MERGE: do `bridged` bridges out of `total` members hold two
    /// collections together? Loose on purpose: many weak bridges unify
    /// distant clusters.
    pub fn should_merge(&self, bridged: u32, total: u32) -> bool {
        bridged > self.merge_absolute
            || (total > 0 && (bridged as f64) / (total as f64) >= self.merge_ratio)
    }
}
