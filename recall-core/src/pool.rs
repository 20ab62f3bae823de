//! Bounded pool of embedded SQLite connections on top of `SqlitePool`.
//!
//! Every connection is opened with the same pragmas (WAL journal, NORMAL
//! synchronous, foreign keys on); callers cannot change them per borrow.
//! Dead connections are caught by sqlx's ping before each borrow and
//! replaced, and connections idle past `idle_timeout` are reaped by sqlx's
//! maintenance task.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};

use crate::config::PoolConfig;
use crate::error::{Result, StoreError};

/// A connection lent to exactly one caller; goes back to the pool on drop.
pub type PooledConnection = PoolConnection<Sqlite>;

/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: SqlitePool,
    path: PathBuf,
    max_connections: u32,
    acquire_attempts: u32,
    retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: u32,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
}

impl ConnectionPool {
    /// Open the pool. sqlx opens one connection up front, so a bad path or
    /// unreadable file fails here rather than on first use.
    pub async fn open(path: &Path, config: &PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(StoreError::validation("max_connections must be at least 1"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let attempts = config.connect_attempts.max(1);
        let retry_delay = Duration::from_millis(config.connect_retry_delay_ms);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let connected = SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
                .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs.max(1)))
                .test_before_acquire(true)
                .connect_with(options.clone())
                .await;
            match connected {
                Ok(pool) => {
                    tracing::info!(
                        path = %path.display(),
                        max_connections = config.max_connections,
                        "Connection pool opened"
                    );
                    return Ok(Self {
                        pool,
                        path: path.to_path_buf(),
                        max_connections: config.max_connections,
                        acquire_attempts: attempts,
                        retry_delay,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        attempts,
                        error = %e,
                        "Failed to open database connection"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        Err(StoreError::Connection(format!(
            "could not open {}: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Borrow a connection, waiting for a release when all are lent out.
    ///
    /// A wait that outlasts `acquire_timeout` is retried after
    /// `connect_retry_delay`; only when every attempt times out does the
    /// caller see `StoreError::Pool`. A closed pool fails at once with
    /// `StoreError::Connection`.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.bounded_wait(|| self.pool.acquire()).await
    }

    /// Return a borrowed connection. Dropping it does the same.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Borrow a connection with a transaction already open on it.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, Sqlite>> {
        self.bounded_wait(|| self.pool.begin()).await
    }

    async fn bounded_wait<T, F, Fut>(&self, mut borrow: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        loop {
            match borrow().await {
                Ok(value) => return Ok(value),
                Err(sqlx::Error::PoolClosed) => return Err(closed_error()),
                Err(sqlx::Error::PoolTimedOut) if attempt < self.acquire_attempts => {
                    tracing::warn!(
                        attempt,
                        attempts = self.acquire_attempts,
                        "All connections busy, waiting again"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(sqlx::Error::PoolTimedOut) => {
                    return Err(StoreError::Pool(format!(
                        "no connection became free after {} attempts",
                        self.acquire_attempts
                    )));
                }
                Err(e @ (sqlx::Error::Io(_) | sqlx::Error::Configuration(_))) => {
                    return Err(StoreError::Connection(e.to_string()))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close every connection that is idle right now and return how many.
    /// Timed expiry happens in the background; this is for shedding
    /// resources on demand.
    pub async fn cleanup_idle(&self) -> usize {
        let mut closed = 0;
        for _ in 0..self.pool.num_idle() {
            let Some(conn) = self.pool.try_acquire() else {
                break;
            };
            match conn.close().await {
                Ok(()) => closed += 1,
                Err(e) => tracing::warn!(error = %e, "Error closing idle connection"),
            }
        }
        if closed > 0 {
            tracing::info!(closed, "Closed idle connections");
        }
        closed
    }

    /// Close every connection and refuse further borrows. Waits for lent-out
    /// connections to come back.
    pub async fn close_all(&self) {
        self.pool.close().await;
        tracing::info!(path = %self.path.display(), "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.pool.size() as usize;
        let idle = self.pool.num_idle();
        PoolStats {
            max_connections: self.max_connections,
            total_connections: total,
            active_connections: total.saturating_sub(idle),
            idle_connections: idle,
        }
    }
}

fn closed_error() -> StoreError {
    StoreError::Connection("connection pool is closed".to_string())
}
