//! In-process counters for the store. Mutated under the store's metrics lock,
//! rendered to a serializable snapshot on request.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::pool::PoolStats;
use crate::reconcile::ReconcileReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct StoreMetrics {
    sample_limit: usize,
    pub total_embeddings: u64,
    pub total_queries: u64,
    query_latencies: VecDeque<f64>,
    insert_latencies: VecDeque<f64>,
    update_latencies: VecDeque<f64>,
    delete_latencies: VecDeque<f64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub error_count: u64,
    pub last_vacuum_time: Option<DateTime<Utc>>,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub last_reconcile: Option<ReconcileReport>,
    pub db_size: u64,
    pub index_size: u64,
}

impl StoreMetrics {
    /// `sample_limit` bounds each latency series; the oldest samples are
    /// dropped first.
    pub fn new(sample_limit: usize) -> Self {
        Self {
            sample_limit: sample_limit.max(1),
            total_embeddings: 0,
            total_queries: 0,
            query_latencies: VecDeque::new(),
            insert_latencies: VecDeque::new(),
            update_latencies: VecDeque::new(),
            delete_latencies: VecDeque::new(),
            cache_hits: 0,
            cache_misses: 0,
            error_count: 0,
            last_vacuum_time: None,
            last_backup_time: None,
            last_reconcile: None,
            db_size: 0,
            index_size: 0,
        }
    }

    /// Record a successful operation and how long it took, in seconds.
    pub fn record(&mut self, op: Operation, seconds: f64) {
        match op {
            Operation::Query => self.total_queries += 1,
            Operation::Insert => self.total_embeddings += 1,
            Operation::Update | Operation::Delete => {}
        }
        let limit = self.sample_limit;
        let series = self.series_mut(op);
        if series.len() == limit {
            series.pop_front();
        }
        series.push_back(seconds);
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Add one search's metadata cache outcome.
    pub fn record_cache(&mut self, hits: u64, misses: u64) {
        self.cache_hits += hits;
        self.cache_misses += misses;
    }

    /// Stamp a vacuum. Successive stamps strictly increase even when the
    /// clock has not advanced.
    pub fn mark_vacuum(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = match self.last_vacuum_time {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        self.last_vacuum_time = Some(stamp);
        stamp
    }

    pub fn latencies(&self, op: Operation) -> &VecDeque<f64> {
        match op {
            Operation::Query => &self.query_latencies,
            Operation::Insert => &self.insert_latencies,
            Operation::Update => &self.update_latencies,
            Operation::Delete => &self.delete_latencies,
        }
    }

    fn series_mut(&mut self, op: Operation) -> &mut VecDeque<f64> {
        match op {
            Operation::Query => &mut self.query_latencies,
            Operation::Insert => &mut self.insert_latencies,
            Operation::Update => &mut self.update_latencies,
            Operation::Delete => &mut self.delete_latencies,
        }
    }

    pub fn snapshot(&self, pool: Option<PoolStats>) -> MetricsSnapshot {
        let cache_total = self.cache_hits + self.cache_misses;
        let op_total = self.total_queries + self.total_embeddings;
        MetricsSnapshot {
            total_embeddings: self.total_embeddings,
            total_queries: self.total_queries,
            avg_query_latency: average(&self.query_latencies),
            avg_insert_latency: average(&self.insert_latencies),
            avg_update_latency: average(&self.update_latencies),
            avg_delete_latency: average(&self.delete_latencies),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            cache_hit_rate: ratio(self.cache_hits, cache_total),
            error_count: self.error_count,
            error_rate: ratio(self.error_count, op_total),
            db_size: self.db_size,
            chroma_size: self.index_size,
            last_vacuum_time: self.last_vacuum_time,
            last_backup_time: self.last_backup_time,
            last_reconcile: self.last_reconcile.clone(),
            pool,
        }
    }
}

fn average(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Read-only view of [`StoreMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_embeddings: u64,
    pub total_queries: u64,
    pub avg_query_latency: f64,
    pub avg_insert_latency: f64,
    pub avg_update_latency: f64,
    pub avg_delete_latency: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub error_count: u64,
    pub error_rate: f64,
    pub db_size: u64,
    pub chroma_size: u64,
    pub last_vacuum_time: Option<DateTime<Utc>>,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub last_reconcile: Option<ReconcileReport>,
    pub pool: Option<PoolStats>,
}
