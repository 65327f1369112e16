//! Sentence shard entity: the append-only occurrence log for one 20-bit
//! fingerprint bucket.

use crate::error::{DedupError, Result};
use crate::model::{CardId, Fingerprint, SentenceRecord, ShardKey, SENTENCE_RECORD_LEN};

/// All sentence occurrences in one shard, plus the appends pending in the
/// current unit of work.
#[derive(Debug, Clone)]
pub struct SentenceShard {
    pub bucket: ShardKey,
    records: Vec<SentenceRecord>,
    pending: Vec<SentenceRecord>,
}

impl SentenceShard {
    pub fn empty(bucket: ShardKey) -> Self {
        Self {
            bucket,
            records: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Parse a shard payload. The payload is a plain concatenation of
    /// 11-byte records; any other length means the shard is corrupt.
    pub fn parse(bucket: ShardKey, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % SENTENCE_RECORD_LEN != 0 {
            return Err(DedupError::CorruptShard {
                bucket,
                len: bytes.len(),
            });
        }
        let records = bytes
            .chunks_exact(SENTENCE_RECORD_LEN)
            .map(|chunk| {
                let mut buf = [0u8; SENTENCE_RECORD_LEN];
                buf.copy_from_slice(chunk);
                SentenceRecord::decode(&buf)
            })
            .collect();
        Ok(Self {
            bucket,
            records,
            pending: Vec::new(),
        })
    }

    /// Record one occurrence. Visible to readers of this shard immediately;
    /// persisted as an append at save time.
    pub fn add_occurrence(&mut self, fingerprint: Fingerprint, card: CardId, index: u16) {
        let record = SentenceRecord {
            sub_key: fingerprint.sub_key,
            card,
            index,
        };
        self.records.push(record);
        self.pending.push(record);
    }

    /// Occurrences whose sub key matches the queried fingerprint.
    pub fn occurrences(&self, sub_key: u64) -> impl Iterator<Item = (CardId, u16)> + '_ {
        self.records
            .iter()
            .filter(move |r| r.sub_key == sub_key)
            .map(|r| (r.card, r.index))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The concatenated bytes of all pending appends.
    pub fn pending_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending.len() * SENTENCE_RECORD_LEN);
        for record in &self.pending {
            out.extend_from_slice(&record.encode());
        }
        out
    }
}
