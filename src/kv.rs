//! # KV Store Interface
//!
//! Trait-based interface to the shared transactional key-value store, plus
//! an in-memory implementation with real WATCH semantics for tests and
//! demos.
//!
//! The engine's concurrency model lives entirely here: a connection WATCHes
//! every key before its first read, buffers writes, and applies them with
//! `exec`. If any watched key was written by another connection in the
//! meantime, `exec` applies nothing and reports the conflict.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by the KV layer.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("kv: wrong type for key {0}")]
    WrongType(String),

    #[error("kv: connection error: {0}")]
    Connection(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// One buffered write inside a MULTI/EXEC transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Append bytes to a string key, creating it if absent.
    Append { key: String, data: Vec<u8> },
    /// Replace a hash key with the given fields.
    WriteHash {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Replace a set key with the given members.
    WriteSet { key: String, members: Vec<String> },
    /// Push a value onto the tail of a list key.
    ListPush { key: String, value: String },
    /// Delete a key outright.
    Delete { key: String },
}

impl KvOp {
    pub fn key(&self) -> &str {
        match self {
            KvOp::Append { key, .. }
            | KvOp::WriteHash { key, .. }
            | KvOp::WriteSet { key, .. }
            | KvOp::ListPush { key, .. }
            | KvOp::Delete { key } => key,
        }
    }
}

/// An isolated connection to the KV store.
///
/// One connection backs one unit of work. WATCH state is connection-local
/// and cleared by `exec` or `quit`; a connection that errors out must
/// `quit` so pending watches do not leak.
#[async_trait]
pub trait KvConnection: Send {
    /// WATCH a key: any write to it by another connection between now and
    /// `exec` aborts the transaction.
    async fn watch(&mut self, key: &str) -> KvResult<()>;

    /// Read a string key.
    async fn get(&mut self, key: &str) -> KvResult<Option<Vec<u8>>>;

    /// Read all fields of a hash key. `None` when the key is absent.
    async fn hash_get_all(&mut self, key: &str) -> KvResult<Option<Vec<(String, String)>>>;

    /// Read all members of a set key. `None` when the key is absent.
    async fn set_members(&mut self, key: &str) -> KvResult<Option<Vec<String>>>;

    /// Pop the head of a list key. Not transactional.
    async fn list_pop(&mut self, key: &str) -> KvResult<Option<String>>;

    /// MULTI/EXEC: apply `ops` atomically. Returns `false`, with nothing
    /// applied, when a watched key changed. Watches are cleared either
    /// way.
    async fn exec(&mut self, ops: Vec<KvOp>) -> KvResult<bool>;

    /// Release outstanding watches without committing.
    async fn quit(&mut self) -> KvResult<()>;
}

/// Handle to the store itself: a factory for isolated connections.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn connection(&self) -> KvResult<Box<dyn KvConnection>>;
}

/// A value held by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    List(VecDeque<String>),
}

#[derive(Debug, Default)]
struct Shared {
    entries: HashMap<String, Value>,
    /// Monotonic per-key write counters. Kept for deleted keys as well, so
    /// a WATCH on an absent key still detects a concurrent create.
    versions: HashMap<String, u64>,
}

impl Shared {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn apply(&mut self, op: &KvOp) -> KvResult<()> {
        match op {
            KvOp::Append { key, data } => {
                let entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Value::Str(Vec::new()));
                match entry {
                    Value::Str(buf) => buf.extend_from_slice(data),
                    _ => return Err(KvError::WrongType(key.clone())),
                }
            }
            KvOp::WriteHash { key, fields } => {
                if fields.is_empty() {
                    self.entries.remove(key);
                } else {
                    self.entries
                        .insert(key.clone(), Value::Hash(fields.iter().cloned().collect()));
                }
            }
            KvOp::WriteSet { key, members } => {
                if members.is_empty() {
                    self.entries.remove(key);
                } else {
                    self.entries
                        .insert(key.clone(), Value::Set(members.iter().cloned().collect()));
                }
            }
            KvOp::ListPush { key, value } => {
                let entry = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Value::List(VecDeque::new()));
                match entry {
                    Value::List(list) => list.push_back(value.clone()),
                    _ => return Err(KvError::WrongType(key.clone())),
                }
            }
            KvOp::Delete { key } => {
                self.entries.remove(key);
            }
        }
        self.bump(op.key());
        Ok(())
    }
}

/// In-memory KV store with WATCH/MULTI/EXEC semantics.
#[derive(Clone, Default)]
pub struct MemoryKv {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> KvResult<std::sync::MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|e| KvError::Connection(e.to_string()))
    }

    /// Raw read of a key, outside any transaction. Diagnostic surface; the
    /// integration suite uses it to audit committed state.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.shared.lock().ok()?.entries.get(key).cloned()
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        match self.shared.lock() {
            Ok(shared) => {
                let mut keys: Vec<String> = shared.entries.keys().cloned().collect();
                keys.sort();
                keys
            }
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn connection(&self) -> KvResult<Box<dyn KvConnection>> {
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            watched: HashMap::new(),
        }))
    }
}

/// A connection into a [`MemoryKv`].
pub struct MemoryConnection {
    shared: Arc<Mutex<Shared>>,
    watched: HashMap<String, u64>,
}

impl MemoryConnection {
    fn lock(&self) -> KvResult<std::sync::MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|e| KvError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KvConnection for MemoryConnection {
    async fn watch(&mut self, key: &str) -> KvResult<()> {
        let version = self.lock()?.version(key);
        self.watched.entry(key.to_string()).or_insert(version);
        Ok(())
    }

    async fn get(&mut self, key: &str) -> KvResult<Option<Vec<u8>>> {
        match self.lock()?.entries.get(key) {
            None => Ok(None),
            Some(Value::Str(buf)) => Ok(Some(buf.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hash_get_all(&mut self, key: &str) -> KvResult<Option<Vec<(String, String)>>> {
        match self.lock()?.entries.get(key) {
            None => Ok(None),
            Some(Value::Hash(map)) => {
                let mut fields: Vec<(String, String)> =
                    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                fields.sort();
                Ok(Some(fields))
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn set_members(&mut self, key: &str) -> KvResult<Option<Vec<String>>> {
        match self.lock()?.entries.get(key) {
            None => Ok(None),
            Some(Value::Set(members)) => Ok(Some(members.iter().cloned().collect())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn list_pop(&mut self, key: &str) -> KvResult<Option<String>> {
        let mut shared = self.lock()?;
        match shared.entries.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => {
                let popped = list.pop_front();
                let emptied = list.is_empty();
                if emptied {
                    shared.entries.remove(key);
                }
                if popped.is_some() {
                    shared.bump(key);
                }
                Ok(popped)
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn exec(&mut self, ops: Vec<KvOp>) -> KvResult<bool> {
        let watched = std::mem::take(&mut self.watched);
        let mut shared = self.lock()?;
        for (key, version) in &watched {
            if shared.version(key) != *version {
                return Ok(false);
            }
        }
        for op in &ops {
            shared.apply(op)?;
        }
        Ok(true)
    }

    async fn quit(&mut self) -> KvResult<()> {
        self.watched.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_applies_buffered_ops() {
        let store = MemoryKv::new();
        let mut conn = store.connection().await.unwrap();
        let ok = conn
            .exec(vec![
                KvOp::Append {
                    key: "s".into(),
                    data: vec![1, 2],
                },
                KvOp::Append {
                    key: "s".into(),
                    data: vec![3],
                },
                KvOp::WriteHash {
                    key: "h".into(),
                    fields: vec![("l".into(), "3".into())],
                },
            ])
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(conn.get("s").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(
            conn.hash_get_all("h").await.unwrap(),
            Some(vec![("l".to_string(), "3".to_string())])
        );
    }

    #[tokio::test]
    async fn concurrent_write_to_watched_key_aborts_exec() {
        let store = MemoryKv::new();
        let mut a = store.connection().await.unwrap();
        let mut b = store.connection().await.unwrap();

        a.watch("s").await.unwrap();
        assert_eq!(a.get("s").await.unwrap(), None);

        // b commits an append to the same key first.
        let ok = b
            .exec(vec![KvOp::Append {
                key: "s".into(),
                data: vec![9],
            }])
            .await
            .unwrap();
        assert!(ok);

        // a's transaction must now fail and apply nothing.
        let ok = a
            .exec(vec![KvOp::Append {
                key: "s".into(),
                data: vec![1],
            }])
            .await
            .unwrap();
        assert!(!ok);
        assert_eq!(b.get("s").await.unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn watch_on_absent_key_detects_create() {
        let store = MemoryKv::new();
        let mut a = store.connection().await.unwrap();
        let mut b = store.connection().await.unwrap();

        a.watch("missing").await.unwrap();
        b.exec(vec![KvOp::WriteHash {
            key: "missing".into(),
            fields: vec![("l".into(), "1".into())],
        }])
        .await
        .unwrap();

        assert!(!a.exec(vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn exec_clears_watches() {
        let store = MemoryKv::new();
        let mut a = store.connection().await.unwrap();
        let mut b = store.connection().await.unwrap();

        a.watch("k").await.unwrap();
        assert!(a.exec(vec![]).await.unwrap());

        // After exec the old watch must not affect the next transaction.
        b.exec(vec![KvOp::Append {
            key: "k".into(),
            data: vec![1],
        }])
        .await
        .unwrap();
        assert!(a.exec(vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn list_pop_drains_in_order() {
        let store = MemoryKv::new();
        let mut conn = store.connection().await.unwrap();
        conn.exec(vec![
            KvOp::ListPush {
                key: "q".into(),
                value: "1".into(),
            },
            KvOp::ListPush {
                key: "q".into(),
                value: "2".into(),
            },
        ])
        .await
        .unwrap();

        assert_eq!(conn.list_pop("q").await.unwrap(), Some("1".to_string()));
        assert_eq!(conn.list_pop("q").await.unwrap(), Some("2".to_string()));
        assert_eq!(conn.list_pop("q").await.unwrap(), None);
    }
}
