//! # Neardup
//!
//! Online, incremental near-duplicate clustering of long text records
//! ("cards") over a shared transactional key-value store.
//!
//! Each card's fulltext is normalized into sentences, fingerprinted, and
//! probed against a sharded sentence index; cards that overlap positionally
//! are clustered into tight SubBuckets, which in turn are grouped into
//! looser BucketSets. All coordination between concurrent ingesters happens
//! through the KV store's WATCH/MULTI/EXEC optimistic locking; a conflicted
//! commit re-runs the whole unit of work against fresh state.

pub mod bucketset;
pub mod cards;
pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod keys;
pub mod kv;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod processor;
pub mod sentences;
pub mod subbucket;

// Re-export main types for convenience
pub use config::DedupTuning;
pub use error::{DedupError, Result};
pub use evidence::{EvidenceStore, MemoryEvidence};
pub use keys::KeySpace;
pub use kv::{KvConnection, KvError, KvOp, KvStore, MemoryKv};
pub use matcher::MatchOutcome;
pub use model::{BucketSetKey, CardId, Fingerprint, ShardKey, SubBucketKey};
pub use processor::{BucketUpdate, ProcessReport};

use crate::context::Context;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Main API for near-duplicate clustering.
///
/// Owns the KV-store and evidence-store handles plus the tuning; each
/// processed card gets its own isolated connection and unit of work.
#[derive(Clone)]
pub struct Deduper {
    kv: Arc<dyn KvStore>,
    evidence: Arc<dyn EvidenceStore>,
    tuning: DedupTuning,
}

impl Deduper {
    pub fn new(kv: Arc<dyn KvStore>, evidence: Arc<dyn EvidenceStore>) -> Self {
        Self::with_tuning(kv, evidence, DedupTuning::default())
    }

    pub fn with_tuning(
        kv: Arc<dyn KvStore>,
        evidence: Arc<dyn EvidenceStore>,
        tuning: DedupTuning,
    ) -> Self {
        Self {
            kv,
            evidence,
            tuning,
        }
    }

    pub fn tuning(&self) -> &DedupTuning {
        &self.tuning
    }

    /// Process one card to completion, retrying on optimistic-lock
    /// conflicts until a unit of work commits cleanly.
    ///
    /// `sentences`, when given, must be the card's normalized sentences;
    /// otherwise the fulltext is fetched from the evidence store and
    /// normalized here.
    pub async fn process_card(
        &self,
        card: CardId,
        sentences: Option<&[String]>,
    ) -> Result<ProcessReport> {
        loop {
            let conn = self.kv.connection().await?;
            let ctx = Context::new(conn, self.evidence.clone(), self.tuning.clone());
            match processor::run(ctx, card, sentences).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_conflict() => {
                    debug!(card = %card, "optimistic conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Normalize a fulltext and process the card with it.
    pub async fn process_fulltext(&self, card: CardId, fulltext: &str) -> Result<ProcessReport> {
        let sentences = normalize::sentences(fulltext, self.tuning.sentence_cutoff);
        self.process_card(card, Some(&sentences)).await
    }

    /// Append a card to the shared ingestion queue.
    pub async fn enqueue(&self, card: CardId) -> Result<()> {
        let keys = KeySpace::new(self.tuning.key_prefix.clone());
        let mut conn = self.kv.connection().await?;
        // No watches are held, so the push cannot conflict.
        conn.exec(vec![KvOp::ListPush {
            key: keys.queue(),
            value: card.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Drain the ingestion queue, processing up to
    /// `concurrent_deduplication` cards in parallel, until the queue stays
    /// empty, including cards re-queued by evictions along the way.
    ///
    /// Returns the number of cards processed. A `MissingCard` is logged and
    /// dropped; any other error aborts the drain.
    pub async fn drain_queue(&self) -> Result<usize> {
        let keys = KeySpace::new(self.tuning.key_prefix.clone());
        let queue_key = keys.queue();
        let semaphore = Arc::new(Semaphore::new(self.tuning.concurrent_deduplication.max(1)));
        let mut conn = self.kv.connection().await?;
        let mut processed = 0usize;

        loop {
            let mut handles = Vec::new();
            while let Some(raw) = conn.list_pop(&queue_key).await? {
                let card = raw
                    .parse::<u32>()
                    .map(CardId)
                    .map_err(|_| {
                        DedupError::Infrastructure(format!("malformed queue entry {raw:?}"))
                    })?;
                processed += 1;
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| DedupError::Infrastructure(e.to_string()))?;
                let engine = self.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    (card, engine.process_card(card, None).await)
                }));
            }
            if handles.is_empty() {
                break;
            }
            // In-flight cards may push evictions back onto the queue; the
            // outer loop picks those up after this batch settles.
            for handle in handles {
                let (card, result) = handle
                    .await
                    .map_err(|e| DedupError::Infrastructure(e.to_string()))?;
                match result {
                    Ok(_) => {}
                    Err(DedupError::MissingCard(_)) => {
                        warn!(card = %card, "card has no fulltext, dropped");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        let _ = conn.quit().await;
        Ok(processed)
    }
}
