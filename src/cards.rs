//! Per-card persistent state: normalized sentence count and the owning
//! SubBucket back-reference.
//!
//! Both live in one hash key `C:<card_id>` with fields `l` (length,
//! decimal) and `sb` (SubBucket key, decimal). Length is written once per
//! ingestion and never changes; the back-reference moves with the card and
//! is cleared when the card is evicted pending re-queue.

use crate::error::{DedupError, Result};
use crate::model::SubBucketKey;

const FIELD_LENGTH: &str = "l";
const FIELD_SUB_BUCKET: &str = "sb";

/// Persistent state of one card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardInfo {
    pub length: Option<u32>,
    pub sub_bucket: Option<SubBucketKey>,
}

impl CardInfo {
    /// Parse a card hash. `key` is only for error context.
    pub fn parse(key: &str, fields: &[(String, String)]) -> Result<Self> {
        let mut info = CardInfo::default();
        for (field, value) in fields {
            match field.as_str() {
                FIELD_LENGTH => {
                    info.length = Some(parse_u32(key, field, value)?);
                }
                FIELD_SUB_BUCKET => {
                    info.sub_bucket = Some(SubBucketKey(parse_u32(key, field, value)?));
                }
                _ => {
                    return Err(DedupError::InvalidHashKey {
                        key: key.to_string(),
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(info)
    }

    /// Serialize to hash fields. Empty when there is nothing to persist.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::with_capacity(2);
        if let Some(length) = self.length {
            fields.push((FIELD_LENGTH.to_string(), length.to_string()));
        }
        if let Some(sub_bucket) = self.sub_bucket {
            fields.push((FIELD_SUB_BUCKET.to_string(), sub_bucket.to_string()));
        }
        fields
    }
}

fn parse_u32(key: &str, field: &str, value: &str) -> Result<u32> {
    value.parse().map_err(|_| DedupError::InvalidHashKey {
        key: key.to_string(),
        field: field.to_string(),
    })
}
