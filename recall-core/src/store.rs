//! `VectorStore`: one logical record written to two stores.
//!
//! Every write goes to the vector index first and to the `vector_metadata`
//! table second, inside a transaction. There is no two-phase commit: if the
//! relational half fails, the index keeps an orphan entry that
//! [`VectorStore::reconcile`] removes later.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::cache::MetadataCache;
use crate::config::{PoolConfig, RecallConfig, RetryConfig, StoreConfig};
use crate::db;
use crate::error::{Result, StoreError};
use crate::index::{LocalIndex, VectorIndex};
use crate::metrics::{MetricsSnapshot, Operation, StoreMetrics};
use crate::models::record::parse_id;
use crate::models::{Embedding, IdGenerator, Metadata, SearchHit, StoredRecord};
use crate::pool::{ConnectionPool, PoolStats};
use crate::transaction::TransactionManager;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub sqlite_version: String,
    pub records: i64,
    pub index_entries: usize,
    pub index_dimension: Option<usize>,
    pub pool: PoolStats,
}

pub struct VectorStore {
    pub(crate) config: StoreConfig,
    pub(crate) pool_config: PoolConfig,
    pub(crate) retry: RetryConfig,
    /// Write-locked only while restore swaps the database out.
    pub(crate) backend: RwLock<TransactionManager>,
    pub(crate) index: Arc<dyn VectorIndex>,
    pub(crate) ids: IdGenerator,
    pub(crate) metrics: Mutex<StoreMetrics>,
    pub(crate) cache: MetadataCache,
    in_flight: StdMutex<HashSet<String>>,
    closed: AtomicBool,
}

/// Marks an id as being written until dropped.
pub(crate) struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

// ============================================================================
// CONSTRUCTION
// ============================================================================

impl VectorStore {
    /// Open the store described by `config`, backed by a [`LocalIndex`] in
    /// the configured index directory.
    pub async fn open(config: &RecallConfig) -> Result<Self> {
        let index = LocalIndex::open(
            &config.store.index_path(),
            &config.store.collection,
            config.store.dimension,
        )
        .await?;
        Self::open_with_index(config, Arc::new(index)).await
    }

    /// Open with a caller-supplied index.
    pub async fn open_with_index(
        config: &RecallConfig,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self> {
        let db_path = config.store.database_path();
        let pool = ConnectionPool::open(&db_path, &config.pool).await?;
        {
            let mut conn = pool.acquire().await?;
            db::initialize_schema(&mut conn).await?;
        }

        let store = Self {
            config: config.store.clone(),
            pool_config: config.pool.clone(),
            retry: config.retry.clone(),
            backend: RwLock::new(TransactionManager::new(pool, config.retry.clone())),
            index,
            ids: IdGenerator::new(),
            metrics: Mutex::new(StoreMetrics::new(config.store.latency_sample_limit)),
            cache: MetadataCache::new(config.store.metadata_cache_capacity),
            in_flight: StdMutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        };
        {
            let tm = store.backend.read().await;
            store.seed_ids(&tm).await?;
        }

        tracing::info!(
            database = %db_path.display(),
            index = %store.index.persist_dir().display(),
            "Vector store opened"
        );
        Ok(store)
    }

    /// Move the id floor past every id already present in either store.
    pub(crate) async fn seed_ids(&self, tm: &TransactionManager) -> Result<()> {
        let relational = {
            let mut conn = tm.pool().acquire().await?;
            db::max_record_id(&mut conn).await?.unwrap_or(0)
        };
        let indexed = self
            .index
            .ids()
            .await?
            .iter()
            .filter_map(|id| parse_id(id).ok())
            .max()
            .unwrap_or(0);
        self.ids.seed(relational.max(indexed));
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("vector store is closed".into()));
        }
        Ok(())
    }

    pub(crate) fn track(&self, id: &str) -> InFlight<'_> {
        if let Ok(mut set) = self.in_flight.lock() {
            set.insert(id.to_string());
        }
        InFlight {
            set: &self.in_flight,
            id: id.to_string(),
        }
    }

    pub(crate) fn in_flight_ids(&self) -> HashSet<String> {
        self.in_flight
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Count and log a failed operation, or record the latency of a
    /// successful one.
    pub(crate) async fn finish<T>(
        &self,
        op: Operation,
        started: Instant,
        result: Result<T>,
    ) -> Result<T> {
        let mut metrics = self.metrics.lock().await;
        match &result {
            Ok(_) => metrics.record(op, started.elapsed().as_secs_f64()),
            Err(e) => {
                metrics.record_error();
                tracing::error!(operation = ?op, error = %e, "Vector store operation failed");
            }
        }
        result
    }

    pub(crate) async fn record_failure(&self, context: &str, e: &StoreError) {
        self.metrics.lock().await.record_error();
        tracing::error!(error = %e, "{} failed", context);
    }
}

// ============================================================================
// RECORD OPERATIONS
// ============================================================================

impl VectorStore {
    /// Store one `1 × d` embedding with its metadata and return the new id.
    pub async fn add(&self, embedding: &Embedding, metadata: &Metadata) -> Result<String> {
        let vector = embedding.single_row()?.to_vec();
        let json = metadata.to_json()?;
        self.ensure_open()?;

        let started = Instant::now();
        let tm = self.backend.read().await;
        let id = self.ids.next_id();
        let _in_flight = self.track(&id);

        let result = async {
            self.index
                .add(&[id.clone()], &[vector], &[json.clone()])
                .await?;
            tm.with_retry(|| {
                let id = id.clone();
                let json = json.clone();
                tm.transaction(move |tx| {
                    Box::pin(async move {
                        let rows = db::insert_metadata(tx.conn()?, &id, &json).await?;
                        if rows != 1 {
                            return Err(StoreError::Database(sqlx::Error::RowNotFound));
                        }
                        Ok::<_, StoreError>(())
                    })
                })
            })
            .await
        }
        .await;

        let result = self.finish(Operation::Insert, started, result).await;
        if result.is_ok() {
            tracing::debug!(id = %id, "Embedding added");
        }
        result.map(|_| id)
    }

    /// Nearest `n_results` records to the first row of `query`, closest
    /// first. Each hit's metadata carries `experience`; `similarity_score` is
    /// the squared Euclidean distance reported by the index (lower is closer).
    pub async fn similarity_search(
        &self,
        query: &Embedding,
        n_results: usize,
    ) -> Result<Vec<SearchHit>> {
        if n_results < 1 {
            return Err(StoreError::validation("n_results must be at least 1"));
        }
        self.ensure_open()?;

        let started = Instant::now();
        let tm = self.backend.read().await;
        let mut hits_cached = 0u64;
        let mut hits_loaded = 0u64;

        let result = async {
            let found = self.index.query(query.first_row(), n_results).await?;
            let mut conn = tm.pool().acquire().await?;
            let mut hits = Vec::with_capacity(found.ids.len());

            for (id, distance) in found.ids.into_iter().zip(found.distances) {
                let metadata = match self.cache.get(&id) {
                    Some(m) => {
                        hits_cached += 1;
                        m
                    }
                    None => {
                        hits_loaded += 1;
                        let generation = self.cache.generation();
                        let Some(row) = db::fetch_metadata(&mut conn, &id).await? else {
                            tracing::debug!(id = %id, "Index hit has no metadata row, skipping");
                            continue;
                        };
                        let m = Metadata::from_json_str(&row.metadata)?;
                        self.cache.insert(generation, &id, m.clone());
                        m
                    }
                };
                hits.push(SearchHit {
                    id,
                    similarity_score: distance,
                    metadata: metadata.with_experience(),
                });
            }
            Ok::<_, StoreError>(hits)
        }
        .await;

        self.metrics
            .lock()
            .await
            .record_cache(hits_cached, hits_loaded);
        self.finish(Operation::Query, started, result).await
    }

    /// Replace the vector and metadata of an existing record.
    ///
    /// The index upserts, so an unknown id leaves an index-only entry behind
    /// and the call fails with `Database(RowNotFound)`.
    pub async fn update_embedding(
        &self,
        id: &str,
        embedding: &Embedding,
        metadata: &Metadata,
    ) -> Result<()> {
        parse_id(id)?;
        let vector = embedding.single_row()?.to_vec();
        let json = metadata.to_json()?;
        self.ensure_open()?;

        let started = Instant::now();
        let tm = self.backend.read().await;
        let _in_flight = self.track(id);

        let result = async {
            self.index
                .update(&[id.to_string()], &[vector], &[json.clone()])
                .await?;
            tm.with_retry(|| {
                let id = id.to_string();
                let json = json.clone();
                tm.transaction(move |tx| {
                    Box::pin(async move {
                        let rows = db::update_metadata(tx.conn()?, &id, &json).await?;
                        if rows == 0 {
                            return Err(StoreError::Database(sqlx::Error::RowNotFound));
                        }
                        Ok::<_, StoreError>(())
                    })
                })
            })
            .await
        }
        .await;

        self.cache.invalidate(id);
        self.finish(Operation::Update, started, result).await
    }

    /// Remove a record from both stores. Unknown ids are not an error.
    pub async fn delete_embedding(&self, id: &str) -> Result<()> {
        parse_id(id)?;
        self.ensure_open()?;

        let started = Instant::now();
        let tm = self.backend.read().await;
        let _in_flight = self.track(id);

        let result = async {
            self.index.delete(&[id.to_string()]).await?;
            tm.with_retry(|| {
                let id = id.to_string();
                tm.transaction(move |tx| {
                    Box::pin(async move {
                        db::delete_metadata(tx.conn()?, &id).await?;
                        Ok::<_, StoreError>(())
                    })
                })
            })
            .await
        }
        .await;

        self.cache.invalidate(id);
        self.finish(Operation::Delete, started, result).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredRecord>> {
        parse_id(id)?;
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let result = async {
            let mut conn = tm.pool().acquire().await?;
            db::fetch_metadata(&mut conn, id)
                .await?
                .map(StoredRecord::try_from)
                .transpose()
        }
        .await;
        if let Err(e) = &result {
            self.record_failure("get", e).await;
        }
        result
    }

    pub async fn get_all_metadata(&self) -> Result<Vec<StoredRecord>> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let result = async {
            let mut conn = tm.pool().acquire().await?;
            db::fetch_all_metadata(&mut conn)
                .await?
                .into_iter()
                .map(StoredRecord::try_from)
                .collect::<Result<Vec<_>>>()
        }
        .await;
        if let Err(e) = &result {
            self.record_failure("get_all_metadata", e).await;
        }
        result
    }

    /// Number of metadata rows.
    pub async fn count(&self) -> Result<i64> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let mut conn = tm.pool().acquire().await?;
        Ok(db::count_metadata(&mut conn).await?)
    }

    /// Remove every record from both stores.
    pub async fn clear_all(&self) -> Result<()> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let result = async {
            self.index.clear().await?;
            tm.transaction(|tx| {
                Box::pin(async move {
                    let removed = db::clear_metadata(tx.conn()?).await?;
                    Ok::<_, StoreError>(removed)
                })
            })
            .await
        }
        .await;
        self.cache.clear();
        match result {
            Ok(removed) => {
                tracing::info!(removed, "All records cleared");
                Ok(())
            }
            Err(e) => {
                self.record_failure("clear_all", &e).await;
                Err(e)
            }
        }
    }
}

// ============================================================================
// MAINTENANCE OPERATIONS
// ============================================================================

impl VectorStore {
    /// Compact the relational store and stamp `last_vacuum_time`.
    pub async fn vacuum(&self) -> Result<()> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let result = async {
            let mut conn = tm.pool().acquire().await?;
            db::vacuum(&mut conn).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        match result {
            Ok(()) => {
                let stamp = self.metrics.lock().await.mark_vacuum(Utc::now());
                tracing::info!(at = %stamp, "Database vacuumed");
                Ok(())
            }
            Err(e) => {
                self.record_failure("vacuum", &e).await;
                Err(e)
            }
        }
    }

    /// Drop the index query cache and the metadata cache.
    pub fn clear_caches(&self) {
        self.index.clear_cache();
        self.cache.clear();
        tracing::info!("Caches cleared");
    }

    pub async fn cleanup_idle_connections(&self) -> usize {
        self.backend.read().await.pool().cleanup_idle().await
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.backend.read().await.pool().stats()
    }

    /// Refresh on-disk sizes and the record total, then snapshot.
    pub async fn get_metrics(&self) -> Result<MetricsSnapshot> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let db_size = {
            let mut conn = tm.pool().acquire().await?;
            db::database_size(&mut conn).await?
        };
        let index_size = crate::backup::dir_size(self.index.persist_dir()).await;
        let total = self.index.count().await?;
        let pool = tm.pool().stats();

        let mut metrics = self.metrics.lock().await;
        metrics.db_size = u64::try_from(db_size).unwrap_or(0);
        metrics.index_size = index_size;
        metrics.total_embeddings = total as u64;
        Ok(metrics.snapshot(Some(pool)))
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.ensure_open()?;
        let tm = self.backend.read().await;
        let mut conn = tm.pool().acquire().await?;
        Ok(HealthReport {
            sqlite_version: db::health_check(&mut conn).await?,
            records: db::count_metadata(&mut conn).await?,
            index_entries: self.index.count().await?,
            index_dimension: self.index.dimension().await,
            pool: tm.pool().stats(),
        })
    }

    /// Flush the index and close every connection. Further calls fail with
    /// a connection error.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tm = self.backend.write().await;
        let index_result = self.index.close().await;
        tm.pool().close_all().await;
        self.cache.clear();
        tracing::info!("Vector store closed");
        index_result.map_err(StoreError::from)
    }
}
