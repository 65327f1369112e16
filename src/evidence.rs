//! Evidence store interface: the read-only source of card fulltexts.

use crate::error::Result;
use crate::model::CardId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Read-only access to card fulltexts.
///
/// The engine calls this only to seed the matcher and to re-derive a card's
/// sentences when it is evicted from a bucket.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// The fulltext for a card, or `None` when the card does not exist.
    async fn lookup_fulltext(&self, card: CardId) -> Result<Option<String>>;
}

/// In-memory evidence store.
#[derive(Debug, Default)]
pub struct MemoryEvidence {
    texts: Mutex<HashMap<CardId, String>>,
}

impl MemoryEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, card: CardId, fulltext: impl Into<String>) {
        if let Ok(mut texts) = self.texts.lock() {
            texts.insert(card, fulltext.into());
        }
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidence {
    async fn lookup_fulltext(&self, card: CardId) -> Result<Option<String>> {
        let texts = self
            .texts
            .lock()
            .map_err(|e| crate::error::DedupError::Infrastructure(e.to_string()))?;
        Ok(texts.get(&card).cloned())
    }
}
