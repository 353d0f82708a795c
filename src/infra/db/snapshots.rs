use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::pagination::{CursorPage, FeedCursor, PageRequest};
use crate::application::repos::{RankScope, RankedItem, RepoError, TrendingRepo};
use crate::domain::entities::TrendingEntryRecord;

use super::PostgresRepositories;
use super::util::map_sqlx_error;

/// Chunk size for generation inserts, well under the bind-parameter limit.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(sqlx::FromRow)]
struct TrendingPageRow {
    post_id: Uuid,
    post_created_at: OffsetDateTime,
    score: f64,
}

#[async_trait]
impl TrendingRepo for PostgresRepositories {
    async fn latest_generation(&self) -> Result<Option<OffsetDateTime>, RepoError> {
        let latest: Option<OffsetDateTime> =
            sqlx::query_scalar("SELECT MAX(as_of) FROM trending_entries")
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        Ok(latest)
    }

    async fn generation_exists(&self, as_of: OffsetDateTime) -> Result<bool, RepoError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM trending_entries WHERE as_of = $1)")
                .bind(as_of)
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        Ok(exists)
    }

    async fn list_page(
        &self,
        as_of: OffsetDateTime,
        scope: &RankScope,
        page: PageRequest<FeedCursor>,
    ) -> Result<CursorPage<RankedItem>, RepoError> {
        let limit = page.limit.clamp(1, 100) as i64;

        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT t.post_id, t.post_created_at, t.score FROM trending_entries t WHERE t.as_of = ",
        );
        qb.push_bind(as_of);
        qb.push(" AND t.visibility = ANY(");
        qb.push_bind(&scope.visibilities);
        qb.push(")");

        if let Some(authors) = scope.authors.as_ref() {
            qb.push(" AND t.author_id = ANY(");
            qb.push_bind(authors);
            qb.push(")");
        }

        if let Some(cursor) = page.cursor {
            qb.push(" AND (t.score, t.post_created_at, t.post_id) < (");
            qb.push_bind(cursor.score());
            qb.push(", ");
            qb.push_bind(cursor.created_at());
            qb.push(", ");
            qb.push_bind(cursor.id());
            qb.push(")");
        }

        qb.push(" ORDER BY t.score DESC, t.post_created_at DESC, t.post_id DESC LIMIT ");
        qb.push_bind(limit + 1);

        let mut rows: Vec<TrendingPageRow> = qb
            .build_query_as()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let has_more = (rows.len() as i64) > limit;
        if has_more {
            rows.pop();
        }

        let next_cursor = if has_more {
            rows.last().map(|last| {
                FeedCursor::new(as_of, last.score, last.post_created_at, last.post_id).encode()
            })
        } else {
            None
        };

        let items = rows
            .into_iter()
            .map(|row| RankedItem {
                post_id: row.post_id,
                score: row.score,
                created_at: row.post_created_at,
            })
            .collect();

        Ok(CursorPage::new(items, next_cursor))
    }

    async fn replace_generation(
        &self,
        as_of: OffsetDateTime,
        rows: &[TrendingEntryRecord],
        retain_after: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        // Re-running after a crash must not double up the generation.
        sqlx::query("DELETE FROM trending_entries WHERE as_of = $1")
            .bind(as_of)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        // Generations past the retention tail stop serving; anything newer
        // stays so scrolls still referencing it resolve.
        sqlx::query("DELETE FROM trending_entries WHERE as_of < $1")
            .bind(retain_after)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO trending_entries \
                 (as_of, post_id, post_created_at, score, author_id, visibility, \
                  in_reply_to_id, thread_root_id) ",
            );
            qb.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.as_of)
                    .push_bind(entry.post_id)
                    .push_bind(entry.post_created_at)
                    .push_bind(entry.score)
                    .push_bind(entry.author_id)
                    .push_bind(entry.visibility)
                    .push_bind(entry.in_reply_to_id)
                    .push_bind(entry.thread_root_id);
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}
