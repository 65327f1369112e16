use std::collections::BTreeMap;
use std::sync::Arc;

use neardup::kv::Value;
use neardup::{CardId, DedupTuning, Deduper, KvStore, MemoryEvidence, MemoryKv};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct CardRow {
    id: u32,
    fulltext: String,
}

#[derive(Debug, Serialize)]
struct BucketRow {
    key: u32,
    cards: Vec<u32>,
}

#[derive(Debug, Serialize)]
struct FamilyRow {
    bucket_set: u32,
    sub_buckets: Vec<BucketRow>,
}

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"neardup_cluster - cluster a JSONL batch of cards in memory

USAGE:
    neardup_cluster --input <FILE> [OPTIONS]

OPTIONS:
    -i, --input <FILE>       JSONL file, one {{"id", "fulltext"}} object per line
    -p, --prefix <PREFIX>    KV key prefix [default: dedup]
    -j, --concurrency <N>    Cards processed in parallel [default: 10]
    -h, --help               Print help

OUTPUT:
    A JSON array of bucket-set families with their sub buckets and card ids,
    on stdout.
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt::init();

    let input = parse_arg("--input")
        .or_else(|| parse_arg("-i"))
        .ok_or_else(|| anyhow::anyhow!("--input <FILE> is required (see --help)"))?;
    let prefix = parse_arg("--prefix")
        .or_else(|| parse_arg("-p"))
        .unwrap_or_else(|| "dedup".to_string());
    let mut tuning = DedupTuning::default().with_prefix(prefix.clone());
    if let Some(concurrency) = parse_arg("--concurrency").or_else(|| parse_arg("-j")) {
        tuning.concurrent_deduplication = concurrency.parse()?;
    }

    let raw = std::fs::read_to_string(&input)?;
    let mut rows = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: CardRow = serde_json::from_str(line)?;
        rows.push(row);
    }
    tracing::info!(cards = rows.len(), input = %input, "loaded batch");

    let kv = Arc::new(MemoryKv::new());
    let evidence = Arc::new(MemoryEvidence::new());
    for row in &rows {
        evidence.insert(CardId(row.id), row.fulltext.clone());
    }

    let deduper = Deduper::with_tuning(kv.clone() as Arc<dyn KvStore>, evidence, tuning);
    for row in &rows {
        deduper.enqueue(CardId(row.id)).await?;
    }
    let processed = deduper.drain_queue().await?;
    tracing::info!(processed, "queue drained");

    // Summarize the committed cluster graph straight from the store.
    let sb_prefix = format!("{prefix}:SB:");
    let mut families: BTreeMap<u32, Vec<BucketRow>> = BTreeMap::new();
    for key in kv.keys() {
        let Some(suffix) = key.strip_prefix(&sb_prefix) else {
            continue;
        };
        let Some(Value::Hash(fields)) = kv.value(&key) else {
            continue;
        };
        let bucket_set: u32 = fields
            .get("bs")
            .ok_or_else(|| anyhow::anyhow!("sub bucket {key} has no bucket set"))?
            .parse()?;
        let mut cards: Vec<u32> = fields
            .keys()
            .filter_map(|f| f.strip_prefix('c'))
            .map(|id| id.parse())
            .collect::<Result<_, _>>()?;
        cards.sort_unstable();
        families.entry(bucket_set).or_default().push(BucketRow {
            key: suffix.parse()?,
            cards,
        });
    }
    let mut report: Vec<FamilyRow> = families
        .into_iter()
        .map(|(bucket_set, mut sub_buckets)| {
            sub_buckets.sort_by_key(|b| b.key);
            FamilyRow {
                bucket_set,
                sub_buckets,
            }
        })
        .collect();
    report.sort_by_key(|f| f.bucket_set);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
