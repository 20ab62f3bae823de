//! Background maintenance: hardware-triggered cache clearing and vacuum,
//! reconciliation, idle-connection cleanup and metric refresh.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::MaintenanceConfig;
use crate::hardware::{HardwareMetrics, HardwareMonitor};
use crate::reconcile::ReconcileReport;
use crate::store::VectorStore;

// ============================================================================
// PUBLIC API
// ============================================================================

/// What one maintenance tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub hardware: Option<HardwareMetrics>,
    pub overheated: bool,
    pub vacuumed: bool,
    pub reconcile: Option<ReconcileReport>,
    pub idle_closed: usize,
    pub errors: Vec<String>,
}

/// Run a single maintenance pass. Failures of one step are recorded in the
/// report and do not stop the others.
///
/// Public for unit testing.
pub async fn run_maintenance_tick(
    store: &VectorStore,
    monitor: &dyn HardwareMonitor,
    config: &MaintenanceConfig,
) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    let metrics = monitor.get_metrics();
    let hottest = metrics.max_temp();
    report.hardware = Some(metrics);
    if let Some(temp) = hottest.filter(|t| *t >= config.warning_temp_celsius) {
        report.overheated = true;
        tracing::warn!(
            temp,
            threshold = config.warning_temp_celsius,
            "Temperature over threshold, clearing caches and vacuuming"
        );
        store.clear_caches();
        report.idle_closed = store.cleanup_idle_connections().await;
        match store.vacuum().await {
            Ok(()) => report.vacuumed = true,
            Err(e) => report.errors.push(format!("vacuum: {}", e)),
        }
    }

    if config.reconcile {
        let grace = Duration::from_secs(config.reconcile_grace_secs);
        match store.reconcile(config.orphan_policy, grace).await {
            Ok(r) => report.reconcile = Some(r),
            Err(e) => report.errors.push(format!("reconcile: {}", e)),
        }
    }

    if let Err(e) = store.get_metrics().await {
        report.errors.push(format!("metrics: {}", e));
    }

    for error in &report.errors {
        tracing::warn!(error = %error, "Maintenance step failed");
    }
    report
}

/// Tick every `interval_secs` until `shutdown` fires.
pub async fn run_maintenance_loop(
    store: Arc<VectorStore>,
    monitor: Arc<dyn HardwareMonitor>,
    config: MaintenanceConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    if !config.enabled {
        tracing::info!("Maintenance loop disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval fires immediately; the first pass waits a full period
    ticker.tick().await;

    tracing::info!(
        interval_secs = config.interval_secs,
        warning_temp = config.warning_temp_celsius,
        reconcile = config.reconcile,
        "Maintenance loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = run_maintenance_tick(&store, monitor.as_ref(), &config).await;
                tracing::debug!(
                    overheated = report.overheated,
                    vacuumed = report.vacuumed,
                    idle_closed = report.idle_closed,
                    errors = report.errors.len(),
                    "Maintenance tick complete"
                );
            }
            _ = shutdown.recv() => {
                tracing::info!("Maintenance loop shutting down");
                break;
            }
        }
    }
}

/// Owned handle to a spawned maintenance loop.
pub struct MaintenanceHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    pub fn spawn(
        store: Arc<VectorStore>,
        monitor: Arc<dyn HardwareMonitor>,
        config: MaintenanceConfig,
    ) -> Self {
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_maintenance_loop(store, monitor, config, rx));
        Self { shutdown, task }
    }

    /// Signal the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Maintenance task panicked");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{meta, open_store, vector};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed reading and counts how often it was asked.
    struct ScriptedMonitor {
        cpu_temp: Option<f32>,
        gpu_temp: Option<f32>,
        reads: AtomicUsize,
    }

    impl ScriptedMonitor {
        fn new(cpu_temp: Option<f32>, gpu_temp: Option<f32>) -> Self {
            Self {
                cpu_temp,
                gpu_temp,
                reads: AtomicUsize::new(0),
            }
        }
    }

    impl HardwareMonitor for ScriptedMonitor {
        fn get_metrics(&self) -> HardwareMetrics {
            self.reads.fetch_add(1, Ordering::SeqCst);
            HardwareMetrics {
                cpu_temp: self.cpu_temp,
                gpu_temp: self.gpu_temp,
                cpu_usage: 10.0,
                cpu_load: 5.0,
                gpu_usage: 0.0,
                memory_usage: 40.0,
                memory_total_kb: 1024,
                memory_available_kb: 512,
                timestamp: Utc::now(),
            }
        }
    }

    fn quiet_config() -> MaintenanceConfig {
        MaintenanceConfig {
            reconcile: false,
            ..MaintenanceConfig::default()
        }
    }

    // ====== TEST 1: cool hardware leaves the database alone ======
    #[tokio::test]
    async fn test_cool_tick_does_not_vacuum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let monitor = ScriptedMonitor::new(Some(45.0), None);

        let report = run_maintenance_tick(&store, &monitor, &quiet_config()).await;
        assert!(!report.overheated);
        assert!(!report.vacuumed);
        assert_eq!(report.idle_closed, 0);
        assert!(report.errors.is_empty());
        assert!(store
            .get_metrics()
            .await
            .expect("metrics")
            .last_vacuum_time
            .is_none());
    }

    // ====== TEST 2: a hot GPU triggers cache clear and vacuum ======
    #[tokio::test]
    async fn test_hot_gpu_triggers_vacuum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store
            .add(&vector(&[1.0]), &meta(json!({"k": 1})))
            .await
            .expect("add");
        store
            .similarity_search(&vector(&[1.0]), 1)
            .await
            .expect("warm cache");
        assert!(!store.cache.is_empty());

        let monitor = ScriptedMonitor::new(Some(50.0), Some(80.0));
        let report = run_maintenance_tick(&store, &monitor, &quiet_config()).await;
        assert!(report.overheated);
        assert!(report.vacuumed);
        assert!(store.cache.is_empty());
        assert!(store
            .get_metrics()
            .await
            .expect("metrics")
            .last_vacuum_time
            .is_some());
    }

    // ====== TEST 3: failures are reported, not raised ======
    #[tokio::test]
    async fn test_failing_steps_are_collected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store.close().await.expect("close");
        let monitor = ScriptedMonitor::new(Some(95.0), None);
        let config = MaintenanceConfig::default();

        let report = run_maintenance_tick(&store, &monitor, &config).await;
        assert!(report.overheated);
        assert!(!report.vacuumed);
        // vacuum, reconcile and metrics all fail on a closed store
        assert_eq!(report.errors.len(), 3);
    }

    // ====== TEST 4: the tick reconciles when enabled ======
    #[tokio::test]
    async fn test_tick_reconciles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        store
            .index()
            .add(&["vec_5".to_string()], &[vec![1.0]], &[r#"{"k":1}"#.to_string()])
            .await
            .expect("index-only write");
        let monitor = ScriptedMonitor::new(None, None);
        let config = MaintenanceConfig {
            reconcile_grace_secs: 0,
            ..MaintenanceConfig::default()
        };

        let report = run_maintenance_tick(&store, &monitor, &config).await;
        let reconcile = report.reconcile.expect("reconcile ran");
        assert_eq!(reconcile.removed_from_index, 1);
        assert_eq!(store.index().count().await.expect("count"), 0);
    }

    // ====== TEST 4b: a failed relational insert leaves an orphan the tick removes ======
    #[tokio::test]
    async fn test_failed_add_orphan_removed_by_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        {
            let tm = store.backend.read().await;
            let mut conn = tm.pool().acquire().await.expect("acquire");
            sqlx::query(
                "CREATE TRIGGER reject_metadata_insert BEFORE INSERT ON vector_metadata
                 BEGIN SELECT RAISE(ABORT, 'inserts disabled'); END",
            )
            .execute(&mut *conn)
            .await
            .expect("create trigger");
        }

        let err = store
            .add(&vector(&[1.0, 2.0]), &meta(json!({"k": 1})))
            .await
            .expect_err("relational insert rejected");
        assert_eq!(err.kind(), crate::error::ErrorKind::Database);
        assert_eq!(store.count().await.expect("count"), 0);
        let orphans = store.index().ids().await.expect("ids");
        assert_eq!(orphans.len(), 1);

        let monitor = ScriptedMonitor::new(None, None);
        let config = MaintenanceConfig {
            reconcile_grace_secs: 0,
            ..MaintenanceConfig::default()
        };
        let report = run_maintenance_tick(&store, &monitor, &config).await;
        let reconcile = report.reconcile.expect("reconcile ran");
        assert_eq!(reconcile.index_only, 1);
        assert_eq!(reconcile.removed_from_index, 1);
        assert_eq!(store.index().count().await.expect("count"), 0);
        assert!(store.get(&orphans[0]).await.expect("get").is_none());
    }

    // ====== TEST 5: the loop ticks and stops on shutdown ======
    #[tokio::test]
    async fn test_loop_runs_and_shuts_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(dir.path()).await);
        let monitor = Arc::new(ScriptedMonitor::new(Some(30.0), None));
        let config = MaintenanceConfig {
            interval_secs: 1,
            ..quiet_config()
        };

        let handle = MaintenanceHandle::spawn(store.clone(), monitor.clone(), config);
        tokio::time::sleep(Duration::from_millis(1300)).await;
        handle.shutdown().await;

        let reads = monitor.reads.load(Ordering::SeqCst);
        assert!(reads >= 1, "expected at least one tick, got {}", reads);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(monitor.reads.load(Ordering::SeqCst), reads);
    }

    #[tokio::test]
    async fn test_disabled_loop_returns_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(open_store(dir.path()).await);
        let monitor = Arc::new(ScriptedMonitor::new(None, None));
        let (_tx, rx) = broadcast::channel(1);
        let config = MaintenanceConfig {
            enabled: false,
            ..MaintenanceConfig::default()
        };
        run_maintenance_loop(store, monitor, config, rx).await;
    }
}
