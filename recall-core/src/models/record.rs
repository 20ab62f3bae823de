use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::metadata::Metadata;
use crate::error::StoreError;

pub const ID_PREFIX: &str = "vec_";

/// Row of the `vector_metadata` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetadataRow {
    pub id: i64,
    pub chroma_id: String,
    pub metadata: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A record as read back from the relational side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub metadata: Metadata,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TryFrom<MetadataRow> for StoredRecord {
    type Error = StoreError;

    fn try_from(row: MetadataRow) -> Result<Self, Self::Error> {
        Ok(Self {
            metadata: Metadata::from_json_str(&row.metadata)?,
            id: row.chroma_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One similarity search result.
///
/// `similarity_score` is the index distance: lower is closer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub similarity_score: f32,
    pub metadata: Map<String, Value>,
}

impl SearchHit {
    /// Flat view: the metadata object with `similarity_score` added.
    pub fn into_metadata(self) -> Map<String, Value> {
        let mut map = self.metadata;
        map.insert(
            "similarity_score".to_string(),
            serde_json::json!(self.similarity_score),
        );
        map
    }
}

/// Parse a `vec_<millis>` id, returning its millisecond component.
pub fn parse_id(id: &str) -> Result<u64, StoreError> {
    let digits = id
        .strip_prefix(ID_PREFIX)
        .ok_or_else(|| StoreError::validation(format!("embedding id must start with '{}'", ID_PREFIX)))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StoreError::validation(format!("malformed embedding id: {}", id)));
    }
    digits
        .parse()
        .map_err(|_| StoreError::validation(format!("malformed embedding id: {}", id)))
}

/// Hands out `vec_<millis>` ids that strictly increase for the life of the
/// generator, even when several are requested within one millisecond.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never issue an id at or below `floor`.
    pub fn seed(&self, floor: u64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }

    pub fn next_id(&self) -> String {
        loop {
            let now = Utc::now().timestamp_millis().max(0) as u64;
            let prev = self.last.load(Ordering::SeqCst);
            let candidate = now.max(prev + 1);
            if self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return format!("{}{}", ID_PREFIX, candidate);
            }
        }
    }
}
