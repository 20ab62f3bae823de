use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RecallConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/recall.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
    pub database_file: String,
    pub index_dir: String,
    pub collection: String,
    /// Fixed embedding width. `None` lets the first insert decide.
    pub dimension: Option<usize>,
    pub metadata_cache_capacity: usize,
    pub latency_sample_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.recall".to_string(),
            database_file: "vector_store.db".to_string(),
            index_dir: "chroma".to_string(),
            collection: "agent_vectors".to_string(),
            dimension: None,
            metadata_cache_capacity: 1024,
            latency_sample_limit: 1000,
        }
    }
}

impl StoreConfig {
    pub fn data_path(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_path().join(&self.database_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_path().join(&self.index_dir)
    }

    /// Store rooted at `dir`, everything else default. Used by tests and tools.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// How long one `acquire` waits for a free connection before the pool
    /// counts it as a failed attempt.
    pub acquire_timeout_secs: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout_secs: 30,
            idle_timeout_secs: 300,
            acquire_timeout_secs: 30,
            connect_attempts: 3,
            connect_retry_delay_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Remove the half-written record from whichever side holds it.
    #[default]
    Delete,
    /// Rebuild missing metadata rows from the document stored in the index.
    Backfill,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub warning_temp_celsius: f32,
    pub critical_temp_celsius: f32,
    pub reconcile: bool,
    pub orphan_policy: OrphanPolicy,
    pub reconcile_grace_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            warning_temp_celsius: 80.0,
            critical_temp_celsius: 90.0,
            reconcile: true,
            orphan_policy: OrphanPolicy::Delete,
            reconcile_grace_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: "~/.recall/backups".to_string(),
        }
    }
}

impl BackupConfig {
    pub fn path(&self) -> PathBuf {
        expand_path(&self.dir)
    }
}

impl RecallConfig {
    /// Load from a TOML file, then apply `RECALL__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("RECALL").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recall.toml");
        let mut f = std::fs::File::create(&path).expect("create config");
        writeln!(
            f,
            r#"
[store]
data_dir = "/var/lib/recall"
database_file = "mem.db"
index_dir = "vectors"
dimension = 3

[maintenance]
enabled = false
orphan_policy = "backfill"
"#
        )
        .expect("write config");

        let config = RecallConfig::load(path.to_str().expect("utf8 path")).expect("load");
        assert_eq!(config.store.dimension, Some(3));
        assert_eq!(
            config.store.database_path(),
            PathBuf::from("/var/lib/recall/mem.db")
        );
        assert_eq!(config.store.index_path(), PathBuf::from("/var/lib/recall/vectors"));
        assert_eq!(config.maintenance.orphan_policy, OrphanPolicy::Backfill);
        assert!(!config.maintenance.enabled);
        // Keys absent from a present section keep their defaults
        assert_eq!(config.store.collection, "agent_vectors");
        assert_eq!(config.maintenance.interval_secs, 60);
        // Sections absent from the file fall back to defaults
        assert_eq!(config.pool.max_connections, 5);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.service.log_level, "info");
    }

    #[test]
    fn test_expand_path_resolves_tilde() {
        if std::env::var("HOME").is_err() {
            return;
        }
        let expanded = expand_path("~/recall");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
