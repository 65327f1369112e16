//! A concurrent append to a watched shard aborts the first EXEC; the
//! processor retries against fresh state and converges.

mod support;

use async_trait::async_trait;
use neardup::kv::{KvConnection, KvOp, KvResult, KvStore, Value};
use neardup::model::SentenceRecord;
use neardup::{CardId, DedupTuning, Deduper, Fingerprint, MemoryEvidence, MemoryKv};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use support::{fulltext, phrases};

/// Wraps [`MemoryKv`]; just before the first EXEC it lets a rival
/// connection append to one shard key, as a parallel ingester would.
struct InterferingKv {
    inner: MemoryKv,
    victim: String,
    rival: Vec<u8>,
    fired: Arc<AtomicBool>,
    execs: Arc<AtomicUsize>,
}

struct InterferingConn {
    inner: Box<dyn KvConnection>,
    store: MemoryKv,
    victim: String,
    rival: Vec<u8>,
    fired: Arc<AtomicBool>,
    execs: Arc<AtomicUsize>,
}

#[async_trait]
impl KvStore for InterferingKv {
    async fn connection(&self) -> KvResult<Box<dyn KvConnection>> {
        Ok(Box::new(InterferingConn {
            inner: self.inner.connection().await?,
            store: self.inner.clone(),
            victim: self.victim.clone(),
            rival: self.rival.clone(),
            fired: self.fired.clone(),
            execs: self.execs.clone(),
        }))
    }
}

#[async_trait]
impl KvConnection for InterferingConn {
    async fn watch(&mut self, key: &str) -> KvResult<()> {
        self.inner.watch(key).await
    }

    async fn get(&mut self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn hash_get_all(&mut self, key: &str) -> KvResult<Option<Vec<(String, String)>>> {
        self.inner.hash_get_all(key).await
    }

    async fn set_members(&mut self, key: &str) -> KvResult<Option<Vec<String>>> {
        self.inner.set_members(key).await
    }

    async fn list_pop(&mut self, key: &str) -> KvResult<Option<String>> {
        self.inner.list_pop(key).await
    }

    async fn exec(&mut self, ops: Vec<KvOp>) -> KvResult<bool> {
        if !ops.is_empty() && !self.fired.swap(true, Ordering::SeqCst) {
            let mut rival = self.store.connection().await?;
            rival
                .exec(vec![KvOp::Append {
                    key: self.victim.clone(),
                    data: self.rival.clone(),
                }])
                .await?;
        }
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.inner.exec(ops).await
    }

    async fn quit(&mut self) -> KvResult<()> {
        self.inner.quit().await
    }
}

#[tokio::test]
async fn watch_conflict_retries_and_converges() {
    let sentences = phrases(&["aa", "ab", "ac"]);
    let first_normalized: String = sentences[0].chars().filter(|c| c.is_alphabetic()).collect();
    let fp = Fingerprint::of(&first_normalized);
    let victim = format!("dedup:S:{}", fp.bucket);
    // The rival writes a well-formed record under a different sub key, so
    // the retry parses the shard but finds no new candidate.
    let rival = SentenceRecord {
        sub_key: fp.sub_key ^ 1,
        card: CardId(999),
        index: 0,
    }
    .encode()
    .to_vec();

    let inner = MemoryKv::new();
    let execs = Arc::new(AtomicUsize::new(0));
    let kv = Arc::new(InterferingKv {
        inner: inner.clone(),
        victim: victim.clone(),
        rival,
        fired: Arc::new(AtomicBool::new(false)),
        execs: execs.clone(),
    });
    let evidence = Arc::new(MemoryEvidence::new());
    evidence.insert(CardId(1), fulltext(&sentences));

    let engine = Deduper::with_tuning(kv, evidence, DedupTuning::default());
    let report = engine.process_card(CardId(1), None).await.expect("converges");

    // First unit of work aborted, second committed.
    assert!(execs.load(Ordering::SeqCst) >= 2);
    assert_eq!(report.updates.len(), 1);

    // Both appends landed: the rival's record plus ours.
    match inner.value(&victim) {
        Some(Value::Str(bytes)) => assert_eq!(bytes.len(), 22),
        other => panic!("victim shard missing: {other:?}"),
    }
    match inner.value("dedup:SB:1") {
        Some(Value::Hash(fields)) => {
            assert_eq!(fields.get("c1").map(String::as_str), Some("1"));
        }
        other => panic!("SB:1 missing: {other:?}"),
    }
    support::check_invariants(&inner, "dedup");
}

#[tokio::test]
async fn corrupt_shard_is_fatal() {
    let inner = MemoryKv::new();
    let sentences = phrases(&["qa", "qb", "qc"]);
    let first_normalized: String = sentences[0].chars().filter(|c| c.is_alphabetic()).collect();
    let fp = Fingerprint::of(&first_normalized);

    // Seed a shard whose length is not a multiple of the record size.
    {
        let mut conn = inner.connection().await.unwrap();
        conn.exec(vec![KvOp::Append {
            key: format!("dedup:S:{}", fp.bucket),
            data: vec![0u8; 7],
        }])
        .await
        .unwrap();
    }

    let evidence = Arc::new(MemoryEvidence::new());
    evidence.insert(CardId(1), fulltext(&sentences));
    let engine = Deduper::new(Arc::new(inner), evidence);

    let err = engine.process_card(CardId(1), None).await.unwrap_err();
    assert!(matches!(err, neardup::DedupError::CorruptShard { len: 7, .. }));
}
