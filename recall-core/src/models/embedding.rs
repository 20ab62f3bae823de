use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A rank-2 dense embedding: one or more rows of equal width, every value
/// finite. Stored records are always a single `1 × d` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f32>>", into = "Vec<Vec<f32>>")]
pub struct Embedding {
    rows: Vec<Vec<f32>>,
}

impl Embedding {
    pub fn new(rows: Vec<Vec<f32>>) -> Result<Self, StoreError> {
        let width = match rows.first() {
            Some(first) => first.len(),
            None => {
                return Err(StoreError::validation(
                    "embedding must be a 2-rank tensor with at least one row",
                ))
            }
        };
        if width == 0 {
            return Err(StoreError::validation("embedding rows must not be empty"));
        }
        if let Some(i) = rows.iter().position(|r| r.len() != width) {
            return Err(StoreError::validation(format!(
                "embedding is ragged: row {} has {} values, expected {}",
                i,
                rows[i].len(),
                width
            )));
        }
        for row in &rows {
            if row.iter().any(|v| v.is_nan()) {
                return Err(StoreError::validation("embedding contains NaN values"));
            }
            if row.iter().any(|v| v.is_infinite()) {
                return Err(StoreError::validation("embedding contains infinite values"));
            }
        }
        Ok(Self { rows })
    }

    /// Wrap a flat vector as a `1 × d` embedding.
    pub fn from_vector(vector: Vec<f32>) -> Result<Self, StoreError> {
        Self::new(vec![vector])
    }

    pub fn dimension(&self) -> usize {
        self.rows[0].len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    /// The query row. Extra rows are ignored by search.
    pub fn first_row(&self) -> &[f32] {
        &self.rows[0]
    }

    /// The vector to persist. Records carry exactly one row.
    pub fn single_row(&self) -> Result<&[f32], StoreError> {
        if self.rows.len() != 1 {
            return Err(StoreError::validation(format!(
                "a stored embedding must have exactly one row, got {}",
                self.rows.len()
            )));
        }
        Ok(&self.rows[0])
    }
}

impl TryFrom<Vec<Vec<f32>>> for Embedding {
    type Error = StoreError;

    fn try_from(rows: Vec<Vec<f32>>) -> Result<Self, Self::Error> {
        Self::new(rows)
    }
}

impl From<Embedding> for Vec<Vec<f32>> {
    fn from(e: Embedding) -> Self {
        e.rows
    }
}
