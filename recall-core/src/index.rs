//! Vector index behind the store.
//!
//! `VectorIndex` is the seam: the store only needs batched add/update/delete,
//! k-nearest query, and enough introspection to reconcile and back up.
//! `LocalIndex` is the bundled implementation: exact search over squared
//! Euclidean distance, persisted as a JSON snapshot inside the index
//! directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

const SNAPSHOT_EXT: &str = "json";
const QUERY_CACHE_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Batch length mismatch: {ids} ids, {vectors} vectors, {documents} documents")]
    LengthMismatch {
        ids: usize,
        vectors: usize,
        documents: usize,
    },

    #[error("Id already present in index: {0}")]
    DuplicateId(String),

    #[error("Index persistence failed: {0}")]
    Persistence(String),

    #[error("Index is closed")]
    Closed,
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Persistence(e.to_string())
    }
}

/// Nearest neighbours, closest first. `distances[i]` belongs to `ids[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub ids: Vec<String>,
    pub distances: Vec<f32>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert new entries. Fails without changes if any id already exists.
    async fn add(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
    ) -> Result<(), IndexError>;

    /// Up to `n_results` nearest entries to `vector`, closest first.
    async fn query(&self, vector: &[f32], n_results: usize) -> Result<QueryResult, IndexError>;

    /// Replace entries, inserting any that are missing.
    async fn update(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
    ) -> Result<(), IndexError>;

    /// Remove entries. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<(), IndexError>;

    async fn ids(&self) -> Result<Vec<String>, IndexError>;

    /// The document stored alongside `id`.
    async fn document(&self, id: &str) -> Result<Option<String>, IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;

    /// Remove every entry. The dimension stays fixed if it was configured.
    async fn clear(&self) -> Result<(), IndexError>;

    fn clear_cache(&self);

    /// Make everything written so far durable on disk.
    async fn flush(&self) -> Result<(), IndexError>;

    /// Discard in-memory state and load again from the persist directory.
    async fn reload(&self) -> Result<(), IndexError>;

    async fn dimension(&self) -> Option<usize>;

    fn persist_dir(&self) -> &Path;

    async fn close(&self) -> Result<(), IndexError>;
}

// ====== LOCAL INDEX ======

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    vector: Vec<f32>,
    document: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    collection: String,
    dimension: Option<usize>,
    entries: BTreeMap<String, IndexEntry>,
}

type QueryKey = (Vec<u32>, usize);

/// Query results keyed by vector bits and `n_results`. Every write bumps
/// `generation`, and a result computed under an older generation is never
/// stored.
#[derive(Debug, Default)]
struct QueryCache {
    entries: HashMap<QueryKey, QueryResult>,
    generation: u64,
}

impl QueryCache {
    fn key(vector: &[f32], n_results: usize) -> QueryKey {
        (vector.iter().map(|v| v.to_bits()).collect(), n_results)
    }

    fn invalidate(&mut self) {
        self.entries.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Returns whether the result was stored.
    fn insert_if_current(&mut self, generation: u64, key: QueryKey, result: QueryResult) -> bool {
        if generation != self.generation {
            return false;
        }
        if self.entries.len() >= QUERY_CACHE_CAPACITY {
            self.entries.clear();
        }
        self.entries.insert(key, result);
        true
    }
}

pub struct LocalIndex {
    dir: PathBuf,
    collection: String,
    configured_dimension: Option<usize>,
    state: RwLock<Snapshot>,
    cache: Mutex<QueryCache>,
    closed: AtomicBool,
}

impl LocalIndex {
    /// Open the collection stored under `dir`, creating the directory if
    /// needed. A configured `dimension` must agree with what is on disk.
    pub async fn open(
        dir: &Path,
        collection: &str,
        dimension: Option<usize>,
    ) -> Result<Self, IndexError> {
        tokio::fs::create_dir_all(dir).await?;
        let index = Self {
            dir: dir.to_path_buf(),
            collection: collection.to_string(),
            configured_dimension: dimension,
            state: RwLock::new(Snapshot::default()),
            cache: Mutex::new(QueryCache::default()),
            closed: AtomicBool::new(false),
        };
        let snapshot = index.load_snapshot().await?;
        tracing::info!(
            collection,
            entries = snapshot.entries.len(),
            dimension = ?snapshot.dimension,
            "Vector index opened"
        );
        *index.state.write().await = snapshot;
        Ok(index)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.collection, SNAPSHOT_EXT))
    }

    async fn load_snapshot(&self) -> Result<Snapshot, IndexError> {
        let path = self.snapshot_path();
        let mut snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot {
                collection: self.collection.clone(),
                ..Snapshot::default()
            },
            Err(e) => return Err(e.into()),
        };
        match (self.configured_dimension, snapshot.dimension) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(IndexError::DimensionMismatch { expected, actual });
            }
            (Some(expected), None) => snapshot.dimension = Some(expected),
            _ => {}
        }
        Ok(snapshot)
    }

    /// Write to a temp file and rename over the snapshot so a crash never
    /// leaves a half-written file behind.
    async fn persist(&self, snapshot: &Snapshot) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec(snapshot)?;
        let path = self.snapshot_path();
        let tmp = path.with_extension(format!("{}.tmp", SNAPSHOT_EXT));
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.invalidate();
        }
    }

    fn cache_generation(&self) -> Option<u64> {
        self.cache.lock().ok().map(|c| c.generation)
    }
}

fn check_batch(
    snapshot: &Snapshot,
    ids: &[String],
    vectors: &[Vec<f32>],
    documents: &[String],
) -> Result<Option<usize>, IndexError> {
    if ids.len() != vectors.len() || ids.len() != documents.len() {
        return Err(IndexError::LengthMismatch {
            ids: ids.len(),
            vectors: vectors.len(),
            documents: documents.len(),
        });
    }
    let mut dimension = snapshot.dimension;
    for v in vectors {
        match dimension {
            Some(expected) if expected != v.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                })
            }
            None => dimension = Some(v.len()),
            _ => {}
        }
    }
    Ok(dimension)
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[async_trait]
impl VectorIndex for LocalIndex {
    async fn add(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
    ) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let dimension = check_batch(&state, ids, vectors, documents)?;
        if let Some(dup) = ids.iter().find(|id| state.entries.contains_key(*id)) {
            return Err(IndexError::DuplicateId(dup.clone()));
        }

        let previous_dimension = state.dimension;
        state.dimension = dimension;
        for ((id, vector), document) in ids.iter().zip(vectors).zip(documents) {
            state.entries.insert(
                id.clone(),
                IndexEntry {
                    vector: vector.clone(),
                    document: document.clone(),
                },
            );
        }
        self.invalidate_cache();

        if let Err(e) = self.persist(&state).await {
            for id in ids {
                state.entries.remove(id);
            }
            state.dimension = previous_dimension;
            return Err(e);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], n_results: usize) -> Result<QueryResult, IndexError> {
        self.ensure_open()?;
        let key = QueryCache::key(vector, n_results);
        if let Some(hit) = self
            .cache
            .lock()
            .ok()
            .and_then(|c| c.entries.get(&key).cloned())
        {
            return Ok(hit);
        }

        let (generation, result) = {
            let state = self.state.read().await;
            // Writers invalidate under the write lock, so this generation
            // matches the entries read below.
            let generation = self.cache_generation();
            if let Some(expected) = state.dimension {
                if expected != vector.len() {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
            }

            let mut scored: Vec<(&String, f32)> = state
                .entries
                .iter()
                .map(|(id, entry)| (id, squared_l2(&entry.vector, vector)))
                .collect();
            scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            scored.truncate(n_results);

            let result = QueryResult {
                ids: scored.iter().map(|(id, _)| (*id).clone()).collect(),
                distances: scored.iter().map(|(_, d)| *d).collect(),
            };
            (generation, result)
        };

        if let (Some(generation), Ok(mut cache)) = (generation, self.cache.lock()) {
            cache.insert_if_current(generation, key, result.clone());
        }
        Ok(result)
    }

    async fn update(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
    ) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let dimension = check_batch(&state, ids, vectors, documents)?;

        let previous_dimension = state.dimension;
        let mut replaced = Vec::with_capacity(ids.len());
        state.dimension = dimension;
        for ((id, vector), document) in ids.iter().zip(vectors).zip(documents) {
            let old = state.entries.insert(
                id.clone(),
                IndexEntry {
                    vector: vector.clone(),
                    document: document.clone(),
                },
            );
            replaced.push((id.clone(), old));
        }
        self.invalidate_cache();

        if let Err(e) = self.persist(&state).await {
            for (id, old) in replaced.into_iter().rev() {
                match old {
                    Some(entry) => state.entries.insert(id, entry),
                    None => state.entries.remove(&id),
                };
            }
            state.dimension = previous_dimension;
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let removed: Vec<(String, IndexEntry)> = ids
            .iter()
            .filter_map(|id| state.entries.remove(id).map(|e| (id.clone(), e)))
            .collect();
        if removed.is_empty() {
            return Ok(());
        }
        self.invalidate_cache();

        if let Err(e) = self.persist(&state).await {
            state.entries.extend(removed);
            return Err(e);
        }
        Ok(())
    }

    async fn ids(&self) -> Result<Vec<String>, IndexError> {
        self.ensure_open()?;
        Ok(self.state.read().await.entries.keys().cloned().collect())
    }

    async fn document(&self, id: &str) -> Result<Option<String>, IndexError> {
        self.ensure_open()?;
        Ok(self
            .state
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.document.clone()))
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.ensure_open()?;
        Ok(self.state.read().await.entries.len())
    }

    async fn clear(&self) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state.entries.clear();
        state.dimension = self.configured_dimension;
        self.invalidate_cache();
        self.persist(&state).await
    }

    fn clear_cache(&self) {
        self.invalidate_cache();
        tracing::debug!(collection = %self.collection, "Query cache cleared");
    }

    async fn flush(&self) -> Result<(), IndexError> {
        self.ensure_open()?;
        let state = self.state.read().await;
        self.persist(&state).await
    }

    async fn reload(&self) -> Result<(), IndexError> {
        let snapshot = self.load_snapshot().await?;
        let mut state = self.state.write().await;
        *state = snapshot;
        self.invalidate_cache();
        self.closed.store(false, Ordering::SeqCst);
        tracing::info!(
            collection = %self.collection,
            entries = state.entries.len(),
            "Vector index reloaded"
        );
        Ok(())
    }

    async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    fn persist_dir(&self) -> &Path {
        &self.dir
    }

    async fn close(&self) -> Result<(), IndexError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.flush().await;
        self.closed.store(true, Ordering::SeqCst);
        self.invalidate_cache();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn docs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{{\"n\":{}}}", i)).collect()
    }

    // ====== TEST 1: nearest neighbours come back closest first ======
    #[tokio::test]
    async fn test_query_orders_by_distance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        index
            .add(
                &ids(&["vec_1", "vec_2", "vec_3"]),
                &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]],
                &docs(3),
            )
            .await
            .expect("add");

        let result = index.query(&[0.1, 0.9, 0.0], 2).await.expect("query");
        assert_eq!(result.ids, ids(&["vec_2", "vec_1"]));
        assert!(result.distances[0] < result.distances[1]);
        assert!((result.distances[0] - 0.02).abs() < 1e-6);

        let all = index.query(&[0.0, 0.0, 0.0], 10).await.expect("query all");
        assert_eq!(all.ids.len(), 3);
    }

    // ====== TEST 2: dimension is fixed by the first insert ======
    #[tokio::test]
    async fn test_dimension_is_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        assert_eq!(index.dimension().await, None);
        index
            .add(&ids(&["vec_1"]), &[vec![1.0, 2.0]], &docs(1))
            .await
            .expect("add");
        assert_eq!(index.dimension().await, Some(2));

        let err = index
            .add(&ids(&["vec_2"]), &[vec![1.0, 2.0, 3.0]], &docs(1))
            .await
            .expect_err("wrong width");
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert!(index.query(&[1.0], 1).await.is_err());
        assert_eq!(index.count().await.expect("count"), 1);
    }

    // ====== TEST 3: entries survive reopening the directory ======
    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let index = LocalIndex::open(dir.path(), "test", Some(2)).await.expect("open");
            index
                .add(&ids(&["vec_1", "vec_2"]), &[vec![0.0, 1.0], vec![1.0, 0.0]], &docs(2))
                .await
                .expect("add");
            index.delete(&ids(&["vec_1"])).await.expect("delete");
            index.close().await.expect("close");
            assert!(matches!(index.count().await, Err(IndexError::Closed)));
        }
        let reopened = LocalIndex::open(dir.path(), "test", Some(2)).await.expect("reopen");
        assert_eq!(reopened.ids().await.expect("ids"), ids(&["vec_2"]));
        assert_eq!(
            reopened.document("vec_2").await.expect("doc"),
            Some("{\"n\":1}".to_string())
        );

        let conflict = LocalIndex::open(dir.path(), "test", Some(3)).await;
        assert!(matches!(
            conflict,
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    // ====== TEST 4: update upserts, delete ignores unknown ids ======
    #[tokio::test]
    async fn test_update_and_delete_semantics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        index
            .add(&ids(&["vec_1"]), &[vec![0.0, 0.0]], &docs(1))
            .await
            .expect("add");
        assert!(matches!(
            index.add(&ids(&["vec_1"]), &[vec![0.0, 0.0]], &docs(1)).await,
            Err(IndexError::DuplicateId(_))
        ));

        index
            .update(&ids(&["vec_1", "vec_9"]), &[vec![5.0, 5.0], vec![1.0, 1.0]], &docs(2))
            .await
            .expect("upsert");
        let nearest = index.query(&[5.0, 5.0], 1).await.expect("query");
        assert_eq!(nearest.ids, ids(&["vec_1"]));
        assert_eq!(nearest.distances, vec![0.0]);

        index.delete(&ids(&["vec_404"])).await.expect("unknown id ignored");
        index.delete(&ids(&["vec_1", "vec_9"])).await.expect("delete");
        assert_eq!(index.count().await.expect("count"), 0);
    }

    // ====== TEST 5: cached results are dropped when the data changes ======
    #[tokio::test]
    async fn test_query_cache_invalidated_on_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        index
            .add(&ids(&["vec_1"]), &[vec![1.0, 1.0]], &docs(1))
            .await
            .expect("add");
        let first = index.query(&[0.0, 0.0], 5).await.expect("query");
        assert_eq!(first.ids.len(), 1);

        index
            .add(&ids(&["vec_2"]), &[vec![0.0, 0.0]], &docs(1))
            .await
            .expect("add");
        let second = index.query(&[0.0, 0.0], 5).await.expect("query");
        assert_eq!(second.ids, ids(&["vec_2", "vec_1"]));
    }

    // ====== TEST 5b: a result computed before a write is not cached ======
    #[tokio::test]
    async fn test_stale_query_result_not_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        index
            .add(&ids(&["vec_1"]), &[vec![1.0, 1.0]], &docs(1))
            .await
            .expect("add");

        // A query that read the entries, then lost the race to a writer.
        let generation = index.cache_generation().expect("generation");
        let stale = index.query(&[0.0, 0.0], 5).await.expect("query");
        index.clear_cache();
        index
            .add(&ids(&["vec_2"]), &[vec![0.0, 0.0]], &docs(1))
            .await
            .expect("add");
        let key = QueryCache::key(&[0.0, 0.0], 5);
        let stored = index
            .cache
            .lock()
            .expect("cache lock")
            .insert_if_current(generation, key, stale);
        assert!(!stored);

        let fresh = index.query(&[0.0, 0.0], 5).await.expect("query");
        assert_eq!(fresh.ids, ids(&["vec_2", "vec_1"]));
    }

    #[test]
    fn test_insert_if_current_tracks_generation() {
        let mut cache = QueryCache::default();
        let key = QueryCache::key(&[1.0], 1);
        let result = QueryResult {
            ids: vec!["vec_1".into()],
            distances: vec![0.0],
        };
        assert!(cache.insert_if_current(0, key.clone(), result.clone()));
        cache.invalidate();
        assert!(cache.entries.is_empty());
        assert!(!cache.insert_if_current(0, key.clone(), result.clone()));
        assert!(cache.insert_if_current(1, key, result));
    }

    // ====== TEST 6: reload picks up a snapshot replaced on disk ======
    #[tokio::test]
    async fn test_reload_reads_replaced_snapshot() {
        let source = tempfile::tempdir().expect("tempdir");
        let target = tempfile::tempdir().expect("tempdir");
        let a = LocalIndex::open(source.path(), "test", None).await.expect("open a");
        a.add(&ids(&["vec_7"]), &[vec![1.0]], &docs(1)).await.expect("add");
        let b = LocalIndex::open(target.path(), "test", None).await.expect("open b");
        assert_eq!(b.count().await.expect("count"), 0);

        std::fs::copy(
            source.path().join("test.json"),
            target.path().join("test.json"),
        )
        .expect("copy snapshot");
        b.reload().await.expect("reload");
        assert_eq!(b.ids().await.expect("ids"), ids(&["vec_7"]));
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = LocalIndex::open(dir.path(), "test", None).await.expect("open");
        let err = index
            .add(&ids(&["vec_1", "vec_2"]), &[vec![1.0]], &docs(2))
            .await
            .expect_err("mismatch");
        assert!(matches!(err, IndexError::LengthMismatch { .. }));
    }
}
