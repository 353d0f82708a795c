//! The paginated ranked-read path shared by live and snapshot feeds.
//!
//! Page one of a scroll fixes the scoring epoch (`as_of`); every later page
//! carries it verbatim in the cursor. Live mode scores candidates at that
//! frozen instant, snapshot mode reads the generation stamped with it; both
//! hand out pages under the same strict `(score, created_at, id)` descending
//! order, so a scroll never duplicates or drops rows while scores move
//! underneath it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::candidates::CandidateSelector;
use crate::application::engagement::ScoreCacheService;
use crate::application::pagination::{CursorPage, FeedCursor, PageRequest};
use crate::application::repos::{
    CachedScore, PostsRepo, RankScope, RankedItem, RepoError, ScoringRow, TrendingRepo,
};
use crate::domain::scoring::{self, ScoreInputs};
use crate::domain::types::FeedMode;

const MAX_PAGE_LIMIT: u32 = 50;

#[derive(Debug, Error)]
pub enum RankError {
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// One ranked read. The visibility allow-list and author set arrive already
/// resolved; a malformed cursor silently restarts the scroll.
#[derive(Debug, Clone)]
pub struct RankRequest {
    pub mode: FeedMode,
    pub scope: RankScope,
    pub cursor: Option<String>,
    pub limit: u32,
}

#[derive(Clone)]
pub struct FeedRankService {
    selector: CandidateSelector,
    score_cache: ScoreCacheService,
    posts: Arc<dyn PostsRepo>,
    trending: Arc<dyn TrendingRepo>,
}

impl FeedRankService {
    pub fn new(
        selector: CandidateSelector,
        score_cache: ScoreCacheService,
        posts: Arc<dyn PostsRepo>,
        trending: Arc<dyn TrendingRepo>,
    ) -> Self {
        Self {
            selector,
            score_cache,
            posts,
            trending,
        }
    }

    pub async fn rank(&self, request: RankRequest) -> Result<CursorPage<RankedItem>, RankError> {
        let limit = request.limit.clamp(1, MAX_PAGE_LIMIT);
        let cursor = decode_cursor_leniently(request.cursor.as_deref());

        match request.mode {
            FeedMode::Snapshot => self.snapshot_page(&request.scope, cursor, limit).await,
            FeedMode::Live => self.live_page(&request.scope, cursor, limit).await,
        }
    }

    async fn snapshot_page(
        &self,
        scope: &RankScope,
        cursor: Option<FeedCursor>,
        limit: u32,
    ) -> Result<CursorPage<RankedItem>, RankError> {
        // A cursor pointing at a generation past the retention tail cannot
        // resume; degrade to a fresh scroll on the latest generation.
        let cursor = match cursor {
            Some(cursor) => {
                if self.trending.generation_exists(cursor.as_of()).await? {
                    Some(cursor)
                } else {
                    debug!(
                        as_of = %cursor.as_of(),
                        "Cursor generation aged out; restarting the scroll"
                    );
                    None
                }
            }
            None => None,
        };

        let (as_of, keyset) = match cursor {
            Some(cursor) => (cursor.as_of(), Some(cursor)),
            None => match self.trending.latest_generation().await? {
                Some(latest) => (latest, None),
                None => return Ok(CursorPage::empty()),
            },
        };

        let page = self
            .trending
            .list_page(as_of, scope, PageRequest::new(limit, keyset))
            .await?;
        Ok(page)
    }

    async fn live_page(
        &self,
        scope: &RankScope,
        cursor: Option<FeedCursor>,
        limit: u32,
    ) -> Result<CursorPage<RankedItem>, RankError> {
        let as_of = match cursor {
            Some(cursor) => cursor.as_of(),
            None => OffsetDateTime::now_utc(),
        };

        let ids = self.selector.select(scope, as_of).await?;
        if ids.is_empty() {
            return Ok(CursorPage::empty());
        }

        let cached = self.score_cache.ensure_fresh(&ids).await?;
        let rows = self.posts.load_scoring_rows(&ids, as_of).await?;
        let items = score_rows(&rows, &cached, as_of);

        Ok(assemble_page(items, cursor, limit, as_of))
    }
}

fn decode_cursor_leniently(raw: Option<&str>) -> Option<FeedCursor> {
    let raw = raw?;
    match FeedCursor::decode(raw) {
        Ok(cursor) => Some(cursor),
        Err(err) => {
            debug!(error = %err, "Ignoring undecodable feed cursor");
            None
        }
    }
}

/// Score candidate rows at the frozen instant, preferring the score the
/// cache service just returned over the possibly-older column value.
pub(crate) fn score_rows(
    rows: &[ScoringRow],
    cached: &HashMap<Uuid, CachedScore>,
    as_of: OffsetDateTime,
) -> Vec<RankedItem> {
    rows.iter()
        .map(|row| {
            let boost_score = cached
                .get(&row.id)
                .map(|entry| entry.score)
                .or(row.boost_score);
            let inputs = ScoreInputs {
                created_at: row.created_at,
                boost_score,
                bookmark_count: row.bookmark_count,
                comment_signal: row.comment_signal,
                tag_trend_ratio: row.tag_trend_ratio,
                pinned: row.pinned,
                author_tier: row.author_tier,
                is_reply: row.in_reply_to_id.is_some(),
                deleted_ancestors: row.deleted_ancestors,
            };
            RankedItem {
                post_id: row.id,
                score: scoring::score(&inputs, as_of),
                created_at: row.created_at,
            }
        })
        .collect()
}

fn rank_order(a: &RankedItem, b: &RankedItem) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.post_id.cmp(&a.post_id))
}

/// Sort, apply the cursor keyset, truncate to the page limit and mint the
/// next cursor (carrying `as_of` through unchanged).
pub(crate) fn assemble_page(
    mut items: Vec<RankedItem>,
    cursor: Option<FeedCursor>,
    limit: u32,
    as_of: OffsetDateTime,
) -> CursorPage<RankedItem> {
    items.sort_by(rank_order);

    if let Some(cursor) = cursor {
        items.retain(|item| cursor.admits(item.score, item.created_at, item.post_id));
    }

    let limit = limit as usize;
    let has_more = items.len() > limit;
    items.truncate(limit);

    let next_cursor = if has_more {
        items.last().map(|last| {
            FeedCursor::new(as_of, last.score, last.created_at, last.post_id).encode()
        })
    } else {
        None
    };

    CursorPage::new(items, next_cursor)
}
