//! Engine error kinds and their propagation contract.
//!
//! Everything below the processor surfaces errors upward untouched; only
//! `OptimisticConflict` is recovered (by re-running the unit of work with a
//! fresh context). All other kinds escape to the driver.

use crate::model::{CardId, ShardKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DedupError {
    /// EXEC detected a concurrent write to a watched key. The whole unit of
    /// work is retried from scratch.
    #[error("dedup: optimistic lock conflict, transaction aborted")]
    OptimisticConflict,

    /// The evidence store has no fulltext for the card.
    #[error("dedup: no fulltext for card {0}")]
    MissingCard(CardId),

    /// A sentence shard's byte length is not a multiple of the record size.
    #[error("dedup: corrupt sentence shard {bucket}: {len} bytes")]
    CorruptShard { bucket: ShardKey, len: usize },

    /// An unknown field prefix appeared while parsing a SubBucket hash.
    #[error("dedup: invalid field {field:?} in hash {key}")]
    InvalidHashKey { key: String, field: String },

    /// Connection or transport failure in the KV layer.
    #[error("dedup: infrastructure error: {0}")]
    Infrastructure(String),
}

impl DedupError {
    /// Whether this error is recovered by retrying the unit of work.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DedupError::OptimisticConflict)
    }
}

impl From<crate::kv::KvError> for DedupError {
    fn from(e: crate::kv::KvError) -> Self {
        DedupError::Infrastructure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DedupError>;
