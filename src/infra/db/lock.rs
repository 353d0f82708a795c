//! Database-native mutual exclusion for the trending batch.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use tokio::sync::Mutex;
use tracing::warn;

use crate::application::repos::RepoError;
use crate::application::snapshot::BatchLock;

use super::util::map_sqlx_error;

/// Advisory-lock key shared by every instance running the trending batch.
pub const TRENDING_BATCH_LOCK_KEY: i64 = 0x636f_7272_0000_0001;

/// Session-scoped `pg_try_advisory_lock` guard. The connection that acquired
/// the lock is parked until release so the session (and with it the lock)
/// survives exactly as long as one batch run.
pub struct PgAdvisoryBatchLock {
    pool: PgPool,
    key: i64,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgAdvisoryBatchLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            key: TRENDING_BATCH_LOCK_KEY,
            held: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BatchLock for PgAdvisoryBatchLock {
    async fn try_acquire(&self) -> Result<bool, RepoError> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release(&self) {
        let mut held = self.held.lock().await;
        if let Some(mut conn) = held.take() {
            let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await;
            match released {
                Ok(true) => {}
                Ok(false) => {
                    warn!(key = self.key, "Advisory batch lock was not held at release");
                }
                Err(err) => {
                    // Dropping the connection closes the session and frees
                    // the lock server-side regardless.
                    warn!(error = %err, "Failed to release advisory batch lock cleanly");
                }
            }
        }
    }
}
