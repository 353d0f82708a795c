//! Repository traits describing persistence adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::pagination::{CursorPage, FeedCursor, PageRequest, PaginationError};
use crate::domain::entities::TrendingEntryRecord;
use crate::domain::types::{AccountTier, PostVisibility};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error(transparent)]
    Pagination(#[from] PaginationError),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Already-resolved read scope for one feed request. Visibility and author
/// resolution happen upstream; this layer only applies the result.
#[derive(Debug, Clone)]
pub struct RankScope {
    pub visibilities: Vec<PostVisibility>,
    pub authors: Option<Vec<Uuid>>,
}

impl RankScope {
    pub fn public() -> Self {
        Self {
            visibilities: vec![PostVisibility::Public],
            authors: None,
        }
    }
}

/// One rung of the candidate-widening ladder. Tiers are tried in order of
/// strictly increasing permissiveness and the first non-empty result wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionTier {
    pub lookback_days: i64,
    pub top_level_only: bool,
}

/// Per-bucket row caps; the candidate set is bounded by their sum.
#[derive(Debug, Clone, Copy)]
pub struct BucketCaps {
    pub recent: i64,
    pub per_counter: i64,
    pub replies: i64,
}

impl BucketCaps {
    pub fn total(&self) -> i64 {
        // Three counter buckets (boosts, bookmarks, comments).
        self.recent + 3 * self.per_counter + self.replies
    }
}

/// Everything the scoring engine needs about one candidate, joined and
/// aggregated in bulk by the adapter.
#[derive(Debug, Clone, Copy)]
pub struct ScoringRow {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub author_id: Uuid,
    pub visibility: PostVisibility,
    pub in_reply_to_id: Option<Uuid>,
    pub thread_root_id: Option<Uuid>,
    pub pinned: bool,
    pub bookmark_count: i32,
    pub boost_score: Option<f64>,
    pub author_tier: AccountTier,
    pub comment_signal: f64,
    pub tag_trend_ratio: Option<f64>,
    pub deleted_ancestors: u32,
}

/// One cached engagement score with its write timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedScore {
    pub score: f64,
    pub updated_at: OffsetDateTime,
}

/// One ranked feed item as handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedItem {
    pub post_id: Uuid,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait PostsRepo: Send + Sync {
    /// Union of capped candidate buckets under one tier, deduplicated.
    async fn select_candidates(
        &self,
        scope: &RankScope,
        tier: SelectionTier,
        caps: BucketCaps,
        as_of: OffsetDateTime,
        recency_window_hours: i64,
    ) -> Result<Vec<Uuid>, RepoError>;

    /// Bulk-load scoring inputs for the given posts; unknown ids are
    /// silently absent from the result.
    async fn load_scoring_rows(
        &self,
        ids: &[Uuid],
        as_of: OffsetDateTime,
    ) -> Result<Vec<ScoringRow>, RepoError>;
}

#[async_trait]
pub trait EngagementRepo: Send + Sync {
    /// Current cache fields for the given posts. Posts whose pair is null
    /// are reported with `None`.
    async fn load_cached_scores(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<CachedScore>>, RepoError>;

    /// Recompute decayed boost aggregates from the event table in one
    /// batched query. Posts without events come back as zero.
    async fn recompute_boost_scores(
        &self,
        ids: &[Uuid],
        now: OffsetDateTime,
    ) -> Result<HashMap<Uuid, f64>, RepoError>;

    /// Bulk write-back of recomputed scores with a shared timestamp.
    async fn write_boost_scores(
        &self,
        scores: &[(Uuid, f64)],
        updated_at: OffsetDateTime,
    ) -> Result<(), RepoError>;

    /// Null both cache fields so the next read recomputes.
    async fn invalidate(&self, post_id: Uuid) -> Result<(), RepoError>;

    /// Highest-engagement posts whose cache is null or older than the
    /// horizon, capped; the batch warm pass feeds these to `ensure_fresh`.
    async fn list_stale_engaged(
        &self,
        stale_before: OffsetDateTime,
        cap: i64,
    ) -> Result<Vec<Uuid>, RepoError>;
}

#[async_trait]
pub trait TrendingRepo: Send + Sync {
    /// `as_of` of the most recent committed generation.
    async fn latest_generation(&self) -> Result<Option<OffsetDateTime>, RepoError>;

    /// Whether any rows for this generation are still retained.
    async fn generation_exists(&self, as_of: OffsetDateTime) -> Result<bool, RepoError>;

    /// One keyset page from a generation under the feed order.
    async fn list_page(
        &self,
        as_of: OffsetDateTime,
        scope: &RankScope,
        page: PageRequest<FeedCursor>,
    ) -> Result<CursorPage<RankedItem>, RepoError>;

    /// Atomically replace this generation: delete rows with the same
    /// `as_of` (idempotent re-runs), drop rows older than `retain_after`,
    /// insert the new rows. One transaction, so a failed batch leaves the
    /// previous generation intact.
    async fn replace_generation(
        &self,
        as_of: OffsetDateTime,
        rows: &[TrendingEntryRecord],
        retain_after: OffsetDateTime,
    ) -> Result<(), RepoError>;
}
