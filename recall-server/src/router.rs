use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use recall_core::config::RecallConfig;
use recall_core::ipc::{RecallRequest, RecallResponse};
use recall_core::{
    list_backups, Embedding, HardwareMonitor, Metadata, OrphanPolicy, StoreError, VectorStore,
};
use serde::Serialize;

/// Everything a request handler needs. Cloned per connection.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<VectorStore>,
    pub monitor: Arc<dyn HardwareMonitor>,
    pub backup_dir: PathBuf,
    pub orphan_policy: OrphanPolicy,
    pub reconcile_grace: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<VectorStore>,
        monitor: Arc<dyn HardwareMonitor>,
        config: &RecallConfig,
    ) -> Self {
        Self {
            store,
            monitor,
            backup_dir: config.backup.path(),
            orphan_policy: config.maintenance.orphan_policy,
            reconcile_grace: Duration::from_secs(config.maintenance.reconcile_grace_secs),
        }
    }

    fn backup_dir_or(&self, dir: Option<String>) -> PathBuf {
        dir.map(|d| recall_core::config::expand_path(&d))
            .unwrap_or_else(|| self.backup_dir.clone())
    }
}

pub async fn handle_request(request: RecallRequest, state: &AppState) -> RecallResponse {
    let store = &state.store;
    match request {
        RecallRequest::Ping => RecallResponse::pong(),
        RecallRequest::Health => respond(store.health().await),
        RecallRequest::Add {
            embedding,
            metadata,
        } => {
            let result = async {
                let embedding = Embedding::new(embedding)?;
                let metadata = Metadata::new(metadata)?;
                store.add(&embedding, &metadata).await
            }
            .await;
            respond(result.map(|id| serde_json::json!({ "id": id })))
        }
        RecallRequest::Search {
            embedding,
            n_results,
        } => {
            let result = async {
                let embedding = Embedding::new(embedding)?;
                store.similarity_search(&embedding, n_results).await
            }
            .await;
            respond(result.map(|hits| serde_json::json!({ "count": hits.len(), "results": hits })))
        }
        RecallRequest::Get { id } => match store.get(&id).await {
            Ok(Some(record)) => respond(Ok::<_, StoreError>(record)),
            Ok(None) => RecallResponse::err(format!("No record with id {}", id)),
            Err(e) => RecallResponse::from_error(&e),
        },
        RecallRequest::Update {
            id,
            embedding,
            metadata,
        } => {
            let result = async {
                let embedding = Embedding::new(embedding)?;
                let metadata = Metadata::new(metadata)?;
                store.update_embedding(&id, &embedding, &metadata).await
            }
            .await;
            respond(result.map(|_| serde_json::json!({ "updated": id })))
        }
        RecallRequest::Delete { id } => respond(
            store
                .delete_embedding(&id)
                .await
                .map(|_| serde_json::json!({ "deleted": id })),
        ),
        RecallRequest::Count => respond(
            store
                .count()
                .await
                .map(|count| serde_json::json!({ "count": count })),
        ),
        RecallRequest::Backup { dir } => {
            let dir = state.backup_dir_or(dir);
            respond(
                store
                    .backup(&dir)
                    .await
                    .map(|path| serde_json::json!({ "path": path })),
            )
        }
        RecallRequest::Restore { path } => {
            let path = recall_core::config::expand_path(&path);
            respond(
                store
                    .restore(&path)
                    .await
                    .map(|_| serde_json::json!({ "restored": path })),
            )
        }
        RecallRequest::ListBackups { dir } => {
            let dir = state.backup_dir_or(dir);
            respond(list_backups(&dir).await)
        }
        RecallRequest::Vacuum => respond(
            store
                .vacuum()
                .await
                .map(|_| serde_json::json!({ "vacuumed": true })),
        ),
        RecallRequest::Reconcile { policy } => {
            let policy = policy.unwrap_or(state.orphan_policy);
            respond(store.reconcile(policy, state.reconcile_grace).await)
        }
        RecallRequest::ClearCaches => {
            store.clear_caches();
            RecallResponse::ok(serde_json::json!({ "cleared": true }))
        }
        RecallRequest::Metrics => respond(store.get_metrics().await),
        RecallRequest::Hardware => {
            let monitor = state.monitor.clone();
            match tokio::task::spawn_blocking(move || monitor.get_metrics()).await {
                Ok(metrics) => respond(Ok::<_, StoreError>(metrics)),
                Err(e) => RecallResponse::err(format!("Hardware read failed: {}", e)),
            }
        }
        RecallRequest::HardwareHistory { limit } => {
            let monitor = state.monitor.clone();
            match tokio::task::spawn_blocking(move || monitor.history(limit)).await {
                Ok(history) => respond(Ok::<_, StoreError>(history)),
                Err(e) => RecallResponse::err(format!("Hardware history failed: {}", e)),
            }
        }
    }
}

fn respond<T: Serialize>(result: Result<T, StoreError>) -> RecallResponse {
    match result {
        Ok(data) => match serde_json::to_value(data) {
            Ok(value) => RecallResponse::ok(value),
            Err(e) => RecallResponse::from_error(&StoreError::Serialization(e)),
        },
        Err(e) => RecallResponse::from_error(&e),
    }
}
