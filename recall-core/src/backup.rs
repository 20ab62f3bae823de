//! Backup and restore of both stores.
//!
//! A backup is a directory `backup_<YYYYmmdd_HHMMSS>` holding a compacted
//! copy of the database (`vector_store.db`), a copy of the index directory
//! (`chroma/`), and a `metadata.json` manifest.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::db;
use crate::error::{Result, StoreError};
use crate::pool::ConnectionPool;
use crate::store::VectorStore;
use crate::transaction::TransactionManager;

pub const BACKUP_FORMAT_VERSION: &str = "1.0";
pub const BACKUP_PREFIX: &str = "backup_";
pub const MANIFEST_FILE: &str = "metadata.json";
const BACKUP_DB_FILE: &str = "vector_store.db";
const BACKUP_INDEX_DIR: &str = "chroma";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: String,
    pub db_size: u64,
    pub chroma_size: u64,
    pub total_embeddings: u64,
    pub version: String,
}

/// A backup found on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    #[serde(flatten)]
    pub manifest: BackupManifest,
}

// ============================================================================
// PUBLIC API
// ============================================================================

impl VectorStore {
    /// Write a new backup under `dir` and return its path.
    pub async fn backup(&self, dir: &Path) -> Result<PathBuf> {
        self.ensure_open()?;
        match self.write_backup(dir).await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.record_failure("backup", &e).await;
                Err(e)
            }
        }
    }

    /// Replace both stores with the contents of the backup at `path`.
    ///
    /// The manifest is checked first; an unknown format version fails with
    /// a validation error and nothing on disk is touched.
    pub async fn restore(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        match self.restore_from(path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.record_failure("restore", &e).await;
                Err(e)
            }
        }
    }
}

/// Every readable backup under `dir`, newest first.
pub async fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_backup = entry.file_name().to_string_lossy().starts_with(BACKUP_PREFIX);
        if !is_backup || !path.is_dir() {
            continue;
        }
        match read_manifest(&path).await {
            Ok(manifest) => backups.push(BackupInfo { path, manifest }),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable backup");
            }
        }
    }

    backups.sort_by(|a, b| {
        b.manifest
            .timestamp
            .cmp(&a.manifest.timestamp)
            .then_with(|| b.path.cmp(&a.path))
    });
    Ok(backups)
}

/// Total size in bytes of the files under `path`. Missing paths count as 0.
pub async fn dir_size(path: &Path) -> u64 {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum::<u64>()
    })
    .await
    .unwrap_or(0)
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl VectorStore {
    async fn write_backup(&self, dir: &Path) -> Result<PathBuf> {
        let now = Utc::now();
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        tokio::fs::create_dir_all(dir).await?;
        let target = create_backup_dir(dir, &timestamp).await?;

        // Holding the read side keeps restore out until the copy is done.
        let tm = self.backend.read().await;
        let outcome = async {
            let total = {
                let mut conn = tm.pool().acquire().await?;
                db::wal_checkpoint(&mut conn).await?;
                db::vacuum_into(&mut conn, &target.join(BACKUP_DB_FILE)).await?;
                db::count_metadata(&mut conn).await?
            };

            self.index.flush().await?;
            copy_dir(
                self.index.persist_dir().to_path_buf(),
                target.join(BACKUP_INDEX_DIR),
            )
            .await?;

            let manifest = BackupManifest {
                timestamp: timestamp.clone(),
                db_size: dir_size(&target.join(BACKUP_DB_FILE)).await,
                chroma_size: dir_size(&target.join(BACKUP_INDEX_DIR)).await,
                total_embeddings: u64::try_from(total).unwrap_or(0),
                version: BACKUP_FORMAT_VERSION.to_string(),
            };
            tokio::fs::write(
                target.join(MANIFEST_FILE),
                serde_json::to_vec_pretty(&manifest)?,
            )
            .await?;
            Ok::<_, StoreError>(manifest)
        }
        .await;
        drop(tm);

        match outcome {
            Ok(manifest) => {
                self.metrics.lock().await.last_backup_time = Some(now);
                tracing::info!(
                    path = %target.display(),
                    records = manifest.total_embeddings,
                    db_size = manifest.db_size,
                    chroma_size = manifest.chroma_size,
                    "Backup created"
                );
                Ok(target)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&target).await {
                    tracing::warn!(path = %target.display(), error = %cleanup, "Could not remove partial backup");
                }
                Err(e)
            }
        }
    }

    async fn restore_from(&self, backup: &Path) -> Result<()> {
        if !backup.is_dir() {
            return Err(StoreError::validation(format!(
                "backup not found: {}",
                backup.display()
            )));
        }
        let manifest = read_manifest(backup).await?;
        let db_source = backup.join(BACKUP_DB_FILE);
        if !db_source.is_file() {
            return Err(StoreError::validation(format!(
                "backup has no {}: {}",
                BACKUP_DB_FILE,
                backup.display()
            )));
        }
        let index_source = backup.join(BACKUP_INDEX_DIR);
        if !index_source.is_dir() {
            return Err(StoreError::validation(format!(
                "backup has no {}: {}",
                BACKUP_INDEX_DIR,
                backup.display()
            )));
        }

        let mut tm = self.backend.write().await;
        tm.pool().close_all().await;

        let db_path = self.config.database_path();
        let replaced = async {
            for suffix in ["-wal", "-shm"] {
                remove_if_exists(&sidecar(&db_path, suffix)).await?;
            }
            tokio::fs::copy(&db_source, &db_path).await?;
            let index_dir = self.index.persist_dir().to_path_buf();
            match tokio::fs::remove_dir_all(&index_dir).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            copy_dir(index_source.clone(), index_dir).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        self.cache.clear();

        // Bring the pool back even if the copy failed part way. If that
        // fails too, the closed pool stays in place: every operation then
        // reports a connection error and a later restore can retry.
        let pool = match ConnectionPool::open(&db_path, &self.pool_config).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(
                    path = %backup.display(),
                    database = %db_path.display(),
                    error = %e,
                    "Could not reopen database after restore"
                );
                return Err(StoreError::Connection(format!(
                    "database could not be reopened after restore: {}",
                    e
                )));
            }
        };
        *tm = TransactionManager::new(pool, self.retry.clone());
        {
            let mut conn = tm.pool().acquire().await?;
            db::initialize_schema(&mut conn).await?;
        }
        self.index.reload().await?;
        replaced?;

        self.seed_ids(&tm).await?;
        tracing::info!(
            path = %backup.display(),
            timestamp = %manifest.timestamp,
            records = manifest.total_embeddings,
            "Restored from backup"
        );
        Ok(())
    }
}

async fn read_manifest(backup: &Path) -> Result<BackupManifest> {
    let path = backup.join(MANIFEST_FILE);
    let raw = tokio::fs::read(&path).await.map_err(|e| {
        StoreError::validation(format!("cannot read {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_slice(&raw)
        .map_err(|e| StoreError::validation(format!("malformed backup manifest: {}", e)))?;
    match value.get("version") {
        Some(Value::String(v)) if v == BACKUP_FORMAT_VERSION => {}
        other => {
            return Err(StoreError::validation(format!(
                "incompatible backup version {}, expected {}",
                other.map(|v| v.to_string()).unwrap_or_else(|| "<missing>".into()),
                BACKUP_FORMAT_VERSION
            )))
        }
    }
    serde_json::from_value(value)
        .map_err(|e| StoreError::validation(format!("malformed backup manifest: {}", e)))
}

async fn create_backup_dir(dir: &Path, timestamp: &str) -> Result<PathBuf> {
    let base = format!("{}{}", BACKUP_PREFIX, timestamp);
    for n in 0u32.. {
        let name = if n == 0 {
            base.clone()
        } else {
            format!("{}_{}", base, n)
        };
        let path = dir.join(name);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Other("no free backup directory name".into()))
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Recursive copy of `src` into `dst`, creating `dst`.
async fn copy_dir(src: PathBuf, dst: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        std::fs::create_dir_all(&dst)?;
        for entry in WalkDir::new(&src).min_depth(1) {
            let entry = entry?;
            let rel = entry.path().strip_prefix(&src).map_err(io::Error::other)?;
            let target = dst.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Other(format!("copy task failed: {}", e)))??;
    Ok(())
}
