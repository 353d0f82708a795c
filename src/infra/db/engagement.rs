use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{CachedScore, EngagementRepo, RepoError};
use crate::domain::scoring::BOOST_HALF_LIFE_SECS;

use super::PostgresRepositories;
use super::util::map_sqlx_error;

impl PostgresRepositories {
    /// Null the score-cache pair inside a caller-owned transaction. Write
    /// paths mutating an engagement counter run this in the same transaction
    /// so invalidation and the counter change land atomically.
    pub async fn invalidate_boost_score_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        post_id: Uuid,
    ) -> Result<(), RepoError> {
        sqlx::query("UPDATE posts SET boost_score = NULL, boost_score_at = NULL WHERE id = $1")
            .bind(post_id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl EngagementRepo for PostgresRepositories {
    async fn load_cached_scores(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<CachedScore>>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(Uuid, Option<f64>, Option<OffsetDateTime>)> = sqlx::query_as(
            "SELECT id, boost_score, boost_score_at FROM posts WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, score, updated_at)| {
                // The pair is null together or not at all; a half-null pair
                // would read as never computed either way.
                let entry = match (score, updated_at) {
                    (Some(score), Some(updated_at)) => Some(CachedScore { score, updated_at }),
                    _ => None,
                };
                (id, entry)
            })
            .collect())
    }

    async fn recompute_boost_scores(
        &self,
        ids: &[Uuid],
        now: OffsetDateTime,
    ) -> Result<HashMap<Uuid, f64>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            r#"
            SELECT b.post_id,
                   SUM(CASE a.tier::text
                           WHEN 'premium' THEN 3.0
                           WHEN 'plus' THEN 2.0
                           ELSE 1.0
                       END
                       * POWER(0.5, (GREATEST(0, EXTRACT(EPOCH FROM ($2::timestamptz - b.created_at))) / {BOOST_HALF_LIFE_SECS})::float8))::float8
            FROM boosts b
            INNER JOIN accounts a ON a.id = b.actor_id
            WHERE b.post_id = ANY($1)
            GROUP BY b.post_id
            "#
        );
        let rows: Vec<(Uuid, f64)> = sqlx::query_as(&sql)
            .bind(ids)
            .bind(now)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().collect())
    }

    async fn write_boost_scores(
        &self,
        scores: &[(Uuid, f64)],
        updated_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        if scores.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = scores.iter().map(|(id, _)| *id).collect();
        let values: Vec<f64> = scores.iter().map(|(_, score)| *score).collect();

        sqlx::query(
            r#"
            UPDATE posts
            SET boost_score = data.score, boost_score_at = $3
            FROM (SELECT UNNEST($1::uuid[]) AS id, UNNEST($2::float8[]) AS score) AS data
            WHERE posts.id = data.id
            "#,
        )
        .bind(&ids)
        .bind(&values)
        .bind(updated_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn invalidate(&self, post_id: Uuid) -> Result<(), RepoError> {
        sqlx::query("UPDATE posts SET boost_score = NULL, boost_score_at = NULL WHERE id = $1")
            .bind(post_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn list_stale_engaged(
        &self,
        stale_before: OffsetDateTime,
        cap: i64,
    ) -> Result<Vec<Uuid>, RepoError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM posts
            WHERE deleted_at IS NULL
              AND (boost_count > 0 OR bookmark_count > 0 OR comment_count > 0)
              AND (boost_score_at IS NULL OR boost_score_at < $1)
            ORDER BY boost_count DESC, id
            LIMIT $2
            "#,
        )
        .bind(stale_before)
        .bind(cap)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(ids)
    }
}
