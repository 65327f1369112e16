//! KV key layout.
//!
//! Every key the engine touches shares one configurable prefix:
//! `{prefix}:S:{shard}` (binary append string), `{prefix}:C:{card}` (hash),
//! `{prefix}:SB:{key}` (hash), `{prefix}:BS:{key}` (set) and the ingestion
//! queue list `{prefix}:Q`.

use crate::model::{BucketSetKey, CardId, ShardKey, SubBucketKey};

/// Builder for the engine's KV key namespace.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Sentence shard key: `{prefix}:S:{shard as 5 hex chars}`.
    pub fn shard(&self, shard: ShardKey) -> String {
        format!("{}:S:{}", self.prefix, shard)
    }

    /// Card hash key: `{prefix}:C:{card_id}`.
    pub fn card(&self, card: CardId) -> String {
        format!("{}:C:{}", self.prefix, card)
    }

    /// SubBucket hash key: `{prefix}:SB:{key}`.
    pub fn sub_bucket(&self, key: SubBucketKey) -> String {
        format!("{}:SB:{}", self.prefix, key)
    }

    /// BucketSet set key: `{prefix}:BS:{key}`.
    pub fn bucket_set(&self, key: BucketSetKey) -> String {
        format!("{}:BS:{}", self.prefix, key)
    }

    /// Ingestion queue list key: `{prefix}:Q`.
    pub fn queue(&self) -> String {
        format!("{}:Q", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_carry_prefix_and_hex_shard() {
        let keys = KeySpace::new("dedup");
        assert_eq!(keys.shard(ShardKey(0xab12c)), "dedup:S:ab12c");
        assert_eq!(keys.shard(ShardKey(0x1)), "dedup:S:00001");
        assert_eq!(keys.card(CardId(7)), "dedup:C:7");
        assert_eq!(keys.sub_bucket(SubBucketKey(3)), "dedup:SB:3");
        assert_eq!(keys.bucket_set(BucketSetKey(3)), "dedup:BS:3");
        assert_eq!(keys.queue(), "dedup:Q");
    }
}
