//! Postgres-backed repository implementations.

mod engagement;
mod lock;
mod posts;
mod snapshots;
mod util;

pub use lock::{PgAdvisoryBatchLock, TRENDING_BATCH_LOCK_KEY};
pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::{
    Postgres, QueryBuilder, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::repos::RankScope;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    /// Shared post-scope conditions: soft deletion, the resolved visibility
    /// allow-list, and the optional author set.
    fn apply_scope_conditions<'q>(qb: &mut QueryBuilder<'q, Postgres>, scope: &'q RankScope) {
        qb.push(" AND p.deleted_at IS NULL AND p.visibility = ANY(");
        qb.push_bind(&scope.visibilities);
        qb.push(")");

        if let Some(authors) = scope.authors.as_ref() {
            qb.push(" AND p.author_id = ANY(");
            qb.push_bind(authors);
            qb.push(")");
        }
    }
}
