//! Consistency sweep between the vector index and `vector_metadata`.
//!
//! Index-only ids come from writes whose relational half failed (or from
//! updates of unknown ids); relational-only ids come from deletes whose
//! relational half failed. Ids currently being written, and ids younger than
//! the grace period, are left alone.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::config::OrphanPolicy;
use crate::db;
use crate::error::{Result, StoreError};
use crate::models::record::parse_id;
use crate::models::Metadata;
use crate::store::VectorStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub index_only: usize,
    pub relational_only: usize,
    pub removed_from_index: usize,
    pub backfilled: usize,
    pub removed_from_relational: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconcileReport {
    pub fn repaired(&self) -> usize {
        self.removed_from_index + self.backfilled + self.removed_from_relational
    }
}

impl VectorStore {
    /// Scan both stores and repair every orphan old enough to be settled.
    pub async fn reconcile(&self, policy: OrphanPolicy, grace: Duration) -> Result<ReconcileReport> {
        self.ensure_open()?;
        let result = self.run_reconcile(policy, grace).await;
        match result {
            Ok(report) => {
                self.metrics.lock().await.last_reconcile = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                self.record_failure("reconcile", &e).await;
                Err(e)
            }
        }
    }

    async fn run_reconcile(&self, policy: OrphanPolicy, grace: Duration) -> Result<ReconcileReport> {
        let start = Instant::now();
        let tm = self.backend.read().await;
        let mut report = ReconcileReport::default();

        let indexed: HashSet<String> = self.index.ids().await?.into_iter().collect();
        let relational: HashMap<String, NaiveDateTime> = {
            let mut conn = tm.pool().acquire().await?;
            db::list_ids(&mut conn).await?.into_iter().collect()
        };
        let busy = self.in_flight_ids();
        let now = Utc::now();
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);

        let mut stale_index = Vec::new();
        for id in indexed.iter().filter(|id| !relational.contains_key(*id)) {
            report.index_only += 1;
            let created_ms = parse_id(id).ok().and_then(|ms| i64::try_from(ms).ok());
            let young = created_ms.is_some_and(|ms| now.timestamp_millis() - ms < grace_ms);
            if busy.contains(id) || young {
                report.skipped += 1;
            } else {
                stale_index.push(id.clone());
            }
        }

        let mut stale_rows = Vec::new();
        for (id, created_at) in relational.iter().filter(|(id, _)| !indexed.contains(*id)) {
            report.relational_only += 1;
            let age_ms = (now.naive_utc() - *created_at).num_milliseconds();
            if busy.contains(id) || age_ms < grace_ms {
                report.skipped += 1;
            } else {
                stale_rows.push(id.clone());
            }
        }

        let mut drop_from_index = Vec::new();
        match policy {
            OrphanPolicy::Delete => drop_from_index = stale_index,
            OrphanPolicy::Backfill => {
                for id in stale_index {
                    match self.backfill(&tm, &id).await {
                        Ok(true) => report.backfilled += 1,
                        Ok(false) => drop_from_index.push(id),
                        Err(e) => {
                            tracing::warn!(id = %id, error = %e, "Backfill failed, removing from index");
                            drop_from_index.push(id);
                        }
                    }
                }
            }
        }

        if !drop_from_index.is_empty() {
            self.index.delete(&drop_from_index).await?;
            report.removed_from_index = drop_from_index.len();
        }

        if !stale_rows.is_empty() {
            let ids = stale_rows.clone();
            let removed = tm
                .transaction(move |tx| {
                    Box::pin(async move {
                        let mut removed = 0;
                        for id in &ids {
                            removed += db::delete_metadata(tx.conn()?, id).await?;
                        }
                        Ok::<_, StoreError>(removed)
                    })
                })
                .await?;
            report.removed_from_relational = usize::try_from(removed).unwrap_or(0);
        }

        for id in drop_from_index.iter().chain(stale_rows.iter()) {
            self.cache.invalidate(id);
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        report.finished_at = Some(Utc::now());
        if report.index_only > 0 || report.relational_only > 0 {
            tracing::info!(
                index_only = report.index_only,
                relational_only = report.relational_only,
                removed_from_index = report.removed_from_index,
                backfilled = report.backfilled,
                removed_from_relational = report.removed_from_relational,
                skipped = report.skipped,
                elapsed_ms = report.elapsed_ms,
                "Reconciliation complete"
            );
        } else {
            tracing::debug!(elapsed_ms = report.elapsed_ms, "Stores consistent");
        }
        Ok(report)
    }

    /// Re-create the relational row for an index-only id from the document
    /// the index holds. Returns false when there is nothing usable to restore.
    async fn backfill(&self, tm: &crate::transaction::TransactionManager, id: &str) -> Result<bool> {
        let Some(document) = self.index.document(id).await? else {
            return Ok(false);
        };
        let metadata = match Metadata::from_json_str(&document) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Index document is not valid metadata");
                return Ok(false);
            }
        };
        let json = metadata.to_json()?;
        let id = id.to_string();
        tm.transaction(move |tx| {
            Box::pin(async move {
                db::insert_metadata(tx.conn()?, &id, &json).await?;
                Ok::<_, StoreError>(())
            })
        })
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{meta, open_store, vector};
    use serde_json::json;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // ====== TEST 1: update of an unknown id leaves an orphan the sweep removes ======
    #[tokio::test]
    async fn test_orphan_from_failed_update_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let kept = store
            .add(&vector(&[0.0, 1.0]), &meta(json!({"tag": "kept"})))
            .await
            .expect("add");

        let err = store
            .update_embedding("vec_1000", &vector(&[1.0, 0.0]), &meta(json!({"tag": "ghost"})))
            .await
            .expect_err("missing row");
        assert!(matches!(err, StoreError::Database(sqlx::Error::RowNotFound)));
        assert_eq!(store.index().count().await.expect("count"), 2);

        settle().await;
        let report = store
            .reconcile(OrphanPolicy::Delete, Duration::from_millis(1))
            .await
            .expect("reconcile");
        assert_eq!(report.index_only, 1);
        assert_eq!(report.removed_from_index, 1);
        assert_eq!(store.index().ids().await.expect("ids"), vec![kept]);

        let again = store
            .reconcile(OrphanPolicy::Delete, Duration::from_millis(1))
            .await
            .expect("second pass");
        assert_eq!(again.repaired(), 0);
    }

    // ====== TEST 2: backfill restores the row from the index document ======
    #[tokio::test]
    async fn test_backfill_policy_recreates_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store
            .index()
            .add(
                &["vec_77".to_string()],
                &[vec![3.0, 4.0]],
                &[r#"{"tag":"recovered"}"#.to_string()],
            )
            .await
            .expect("index-only write");

        settle().await;
        let report = store
            .reconcile(OrphanPolicy::Backfill, Duration::from_millis(1))
            .await
            .expect("reconcile");
        assert_eq!(report.backfilled, 1);
        let record = store.get("vec_77").await.expect("get").expect("backfilled");
        assert_eq!(record.metadata.get("tag"), Some(&json!("recovered")));
    }

    // ====== TEST 3: relational-only rows are deleted ======
    #[tokio::test]
    async fn test_relational_orphan_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let id = store
            .add(&vector(&[1.0]), &meta(json!({"k": 1})))
            .await
            .expect("add");
        store.index().delete(&[id.clone()]).await.expect("index delete");

        // created_at has one-second resolution
        let report = store
            .reconcile(OrphanPolicy::Delete, Duration::ZERO)
            .await
            .expect("reconcile");
        assert_eq!(report.relational_only, 1);
        assert_eq!(report.removed_from_relational, 1);
        assert!(store.get(&id).await.expect("get").is_none());
    }

    // ====== TEST 4: young orphans are left for a later pass ======
    #[tokio::test]
    async fn test_grace_period_protects_recent_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let fresh = format!("vec_{}", Utc::now().timestamp_millis());
        store
            .index()
            .add(&[fresh.clone()], &[vec![1.0]], &[r#"{"k":1}"#.to_string()])
            .await
            .expect("index-only write");

        let report = store
            .reconcile(OrphanPolicy::Delete, Duration::from_secs(3600))
            .await
            .expect("reconcile");
        assert_eq!(report.index_only, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed_from_index, 0);
        assert_eq!(store.index().ids().await.expect("ids"), vec![fresh]);
        assert!(store
            .get_metrics()
            .await
            .expect("metrics")
            .last_reconcile
            .is_some());
    }
}
