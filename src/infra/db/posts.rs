use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::application::repos::{
    BucketCaps, PostsRepo, RankScope, RepoError, ScoringRow, SelectionTier,
};
use crate::domain::scoring::AGE_HALF_LIFE_SECS;
use crate::domain::types::{AccountTier, PostVisibility};

use super::PostgresRepositories;
use super::util::map_sqlx_error;

/// Engagement predicate shared by the reply bucket.
const ANY_ENGAGEMENT: &str =
    " AND (p.boost_count > 0 OR p.bookmark_count > 0 OR p.comment_count > 0)";

#[derive(sqlx::FromRow)]
struct PostScoringRow {
    id: Uuid,
    created_at: OffsetDateTime,
    author_id: Uuid,
    visibility: PostVisibility,
    in_reply_to_id: Option<Uuid>,
    thread_root_id: Option<Uuid>,
    pinned: bool,
    bookmark_count: i32,
    boost_score: Option<f64>,
    tier: AccountTier,
}

#[async_trait]
impl PostsRepo for PostgresRepositories {
    async fn select_candidates(
        &self,
        scope: &RankScope,
        tier: SelectionTier,
        caps: BucketCaps,
        as_of: OffsetDateTime,
        recency_window_hours: i64,
    ) -> Result<Vec<Uuid>, RepoError> {
        let window_start = as_of - Duration::days(tier.lookback_days);
        let recent_start = as_of - Duration::hours(recency_window_hours);

        // One UNION of capped, independently-indexed buckets. UNION (not
        // UNION ALL) so the result is already deduplicated.
        let mut qb = QueryBuilder::<Postgres>::new("");

        push_bucket(&mut qb, scope, tier, window_start, |qb| {
            qb.push(" AND p.created_at >= ");
            qb.push_bind(recent_start);
            qb.push(" ORDER BY p.created_at DESC LIMIT ");
            qb.push_bind(caps.recent);
        });

        for counter in ["boost_count", "bookmark_count", "comment_count"] {
            qb.push(" UNION ");
            push_bucket(&mut qb, scope, tier, window_start, |qb| {
                qb.push(format!(" AND p.{counter} > 0 ORDER BY p.{counter} DESC LIMIT "));
                qb.push_bind(caps.per_counter);
            });
        }

        // Engaged replies get their own, tighter bucket: scoring already
        // down-weights them, so the cap stays small even in reply-heavy
        // scopes.
        qb.push(" UNION ");
        let reply_tier = SelectionTier {
            top_level_only: false,
            ..tier
        };
        push_bucket(&mut qb, scope, reply_tier, window_start, |qb| {
            qb.push(" AND p.in_reply_to_id IS NOT NULL");
            qb.push(ANY_ENGAGEMENT);
            qb.push(" ORDER BY p.boost_count DESC LIMIT ");
            qb.push_bind(caps.replies);
        });

        let ids: Vec<Uuid> = qb
            .build_query_scalar()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(ids)
    }

    async fn load_scoring_rows(
        &self,
        ids: &[Uuid],
        as_of: OffsetDateTime,
    ) -> Result<Vec<ScoringRow>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let posts: Vec<PostScoringRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.created_at, p.author_id, p.visibility,
                   p.in_reply_to_id, p.thread_root_id, p.pinned,
                   p.bookmark_count, p.boost_score, a.tier
            FROM posts p
            INNER JOIN accounts a ON a.id = p.author_id
            WHERE p.id = ANY($1) AND p.deleted_at IS NULL
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let (comment_signals, deleted_ancestors, tag_ratios) = futures::try_join!(
            self.load_comment_signals(ids, as_of),
            self.load_deleted_ancestors(ids),
            self.load_tag_trend_ratios(ids),
        )?;

        let rows = posts
            .into_iter()
            .map(|post| ScoringRow {
                comment_signal: comment_signals.get(&post.id).copied().unwrap_or(0.0),
                deleted_ancestors: deleted_ancestors.get(&post.id).copied().unwrap_or(0),
                tag_trend_ratio: tag_ratios.get(&post.id).copied(),
                id: post.id,
                created_at: post.created_at,
                author_id: post.author_id,
                visibility: post.visibility,
                in_reply_to_id: post.in_reply_to_id,
                thread_root_id: post.thread_root_id,
                pinned: post.pinned,
                bookmark_count: post.bookmark_count,
                boost_score: post.boost_score,
                author_tier: post.tier,
            })
            .collect();

        Ok(rows)
    }
}

impl PostgresRepositories {
    /// Decayed child-activity aggregate, evaluated at the frozen `as_of` so
    /// every page of one scroll sees the same signal.
    async fn load_comment_signals(
        &self,
        ids: &[Uuid],
        as_of: OffsetDateTime,
    ) -> Result<HashMap<Uuid, f64>, RepoError> {
        let sql = format!(
            r#"
            SELECT c.in_reply_to_id,
                   SUM(POWER(0.5, (GREATEST(0, EXTRACT(EPOCH FROM ($2::timestamptz - c.created_at))) / {AGE_HALF_LIFE_SECS})::float8))::float8
            FROM posts c
            WHERE c.in_reply_to_id = ANY($1) AND c.deleted_at IS NULL
            GROUP BY c.in_reply_to_id
            "#
        );
        let rows: Vec<(Uuid, f64)> = sqlx::query_as(&sql)
            .bind(ids)
            .bind(as_of)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().collect())
    }

    /// Soft-deleted ancestors among {parent, root-if-distinct} per reply.
    async fn load_deleted_ancestors(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, u32>, RepoError> {
        let rows: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            SELECT p.id,
                   (parent.deleted_at IS NOT NULL)::int
                   + (root.id IS DISTINCT FROM parent.id AND root.deleted_at IS NOT NULL)::int
            FROM posts p
            INNER JOIN posts parent ON parent.id = p.in_reply_to_id
            LEFT JOIN posts root ON root.id = p.thread_root_id
            WHERE p.id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, count)| (id, count.max(0) as u32))
            .collect())
    }

    /// Best tag trend score per post divided by the global maximum, for the
    /// posts that carry at least one trending tag.
    async fn load_tag_trend_ratios(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, f64>, RepoError> {
        let global_max: f64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(trend_score), 0)::float8 FROM tags")
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        if global_max <= 0.0 {
            return Ok(HashMap::new());
        }

        let rows: Vec<(Uuid, f64)> = sqlx::query_as(
            r#"
            SELECT pt.post_id, MAX(t.trend_score)::float8
            FROM post_tags pt
            INNER JOIN tags t ON t.id = pt.tag_id
            WHERE pt.post_id = ANY($1) AND t.trend_score > 0
            GROUP BY pt.post_id
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows
            .into_iter()
            .map(|(id, best)| (id, best / global_max))
            .collect())
    }
}

/// Push one parenthesized bucket subquery sharing the scope and lookback
/// conditions; `tail` appends the bucket's own predicate, order and cap.
fn push_bucket<'q>(
    qb: &mut QueryBuilder<'q, Postgres>,
    scope: &'q RankScope,
    tier: SelectionTier,
    window_start: OffsetDateTime,
    tail: impl FnOnce(&mut QueryBuilder<'q, Postgres>),
) {
    qb.push("(SELECT p.id FROM posts p WHERE 1=1 ");
    PostgresRepositories::apply_scope_conditions(qb, scope);
    qb.push(" AND p.created_at >= ");
    qb.push_bind(window_start);
    if tier.top_level_only {
        qb.push(" AND p.in_reply_to_id IS NULL");
    }
    tail(qb);
    qb.push(")");
}
