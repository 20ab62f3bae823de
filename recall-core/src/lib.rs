pub mod backup;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod hardware;
pub mod index;
pub mod ipc;
pub mod maintenance;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod reconcile;
pub mod store;
pub mod transaction;

pub use backup::{list_backups, BackupInfo, BackupManifest};
pub use config::{OrphanPolicy, RecallConfig};
pub use error::{ErrorKind, StoreError};
pub use hardware::{
    HardwareHistory, HardwareMetrics, HardwareMonitor, SystemMonitor, TemperatureSample,
    UsageSample,
};
pub use index::{IndexError, LocalIndex, QueryResult, VectorIndex};
pub use maintenance::{MaintenanceHandle, MaintenanceReport};
pub use metrics::MetricsSnapshot;
pub use models::{Embedding, Metadata, SearchHit, StoredRecord};
pub use pool::{ConnectionPool, PoolStats};
pub use reconcile::ReconcileReport;
pub use store::{HealthReport, VectorStore};
pub use transaction::{execute_with_retry, ScopedTransaction, TransactionManager};
