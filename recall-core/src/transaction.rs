//! Scoped transactions over pooled connections, plus a retry wrapper for
//! transient failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::Transaction;
use tokio_retry::RetryIf;

use crate::config::RetryConfig;
use crate::error::{Result, StoreError};
use crate::pool::ConnectionPool;

/// An open transaction holding one pooled connection.
///
/// Dropping it while still active rolls back; sqlx issues the ROLLBACK
/// before the connection is lent out again.
pub struct ScopedTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl ScopedTransaction {
    /// The connection to run statements on. Fails once the transaction has
    /// been committed or rolled back.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .ok_or(StoreError::NoActiveTransaction)
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.commit().await?;
        tracing::debug!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StoreError::NoActiveTransaction)?;
        tx.rollback().await?;
        Ok(())
    }
}

impl Drop for ScopedTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!("Transaction dropped while active; rolling back");
        }
    }
}

#[derive(Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
    retry: RetryConfig,
}

impl TransactionManager {
    pub fn new(pool: ConnectionPool, retry: RetryConfig) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquire a connection and open a transaction on it.
    pub async fn begin(&self) -> Result<ScopedTransaction> {
        let tx = self.pool.begin().await?;
        Ok(ScopedTransaction { tx: Some(tx) })
    }

    /// Run `f` inside a transaction: commit when it returns `Ok`, roll back
    /// and return the error otherwise. The connection goes back to the pool
    /// either way.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut ScopedTransaction) -> BoxFuture<'t, Result<T>>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                if tx.is_active() {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.is_active() {
                    if let Err(rb) = tx.rollback().await {
                        tracing::error!(error = %rb, "Rollback failed");
                    }
                }
                tracing::error!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    /// `execute_with_retry` with the configured attempt count and base delay.
    pub async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_retry(
            operation,
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
        )
        .await
    }
}

/// Call `operation` up to `max_retries` times, sleeping
/// `base_delay * 2^attempt` between attempts. Errors that are not
/// [`StoreError::is_retryable`] are returned immediately.
pub async fn execute_with_retry<T, F, Fut>(
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = max_retries.max(1);
    let delays = (0..max_retries - 1).map(move |n| base_delay.saturating_mul(2u32.saturating_pow(n)));
    let attempt = AtomicU32::new(0);

    let result = RetryIf::spawn(
        delays,
        || {
            let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = operation();
            async move {
                fut.await.map_err(|e| {
                    if n < max_retries {
                        tracing::warn!(
                            attempt = n,
                            max_retries,
                            error = %e,
                            "Operation failed, retrying"
                        );
                    }
                    e
                })
            }
        },
        |e: &StoreError| e.is_retryable(),
    )
    .await;

    if let Err(e) = &result {
        tracing::error!(
            attempts = attempt.load(Ordering::SeqCst),
            error = %e,
            "Operation failed after retries"
        );
    }
    result
}
