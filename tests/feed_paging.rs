//! End-to-end paging behavior over in-memory adapters: stable scrolls in
//! live mode, generation isolation in snapshot mode, and batch replacement
//! semantics, all without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use corrente::application::candidates::{CandidateSelector, SelectionPolicy};
use corrente::application::engagement::ScoreCacheService;
use corrente::application::pagination::{CursorPage, FeedCursor, PageRequest};
use corrente::application::ranking::{FeedRankService, RankRequest};
use corrente::application::repos::{
    BucketCaps, CachedScore, EngagementRepo, PostsRepo, RankScope, RankedItem, RepoError,
    ScoringRow, SelectionTier, TrendingRepo,
};
use corrente::application::snapshot::{
    BatchPolicy, ProcessBatchLock, TrendingBatchService,
};
use corrente::domain::entities::TrendingEntryRecord;
use corrente::domain::types::{AccountTier, FeedMode, PostVisibility};

#[derive(Debug, Clone)]
struct StoredPost {
    row: ScoringRow,
    boost_events: f64,
    cached: Option<CachedScore>,
}

#[derive(Default)]
struct InMemoryStore {
    posts: Mutex<HashMap<Uuid, StoredPost>>,
    trending: Mutex<Vec<TrendingEntryRecord>>,
}

impl InMemoryStore {
    fn insert_post(&self, id: u128, created_at: OffsetDateTime, boost_events: f64) -> Uuid {
        let post_id = Uuid::from_u128(id);
        let row = ScoringRow {
            id: post_id,
            created_at,
            author_id: Uuid::from_u128(9000 + id),
            visibility: PostVisibility::Public,
            in_reply_to_id: None,
            thread_root_id: None,
            pinned: false,
            bookmark_count: 0,
            boost_score: None,
            author_tier: AccountTier::Free,
            comment_signal: 0.0,
            tag_trend_ratio: None,
            deleted_ancestors: 0,
        };
        self.posts.lock().unwrap().insert(
            post_id,
            StoredPost {
                row,
                boost_events,
                cached: None,
            },
        );
        post_id
    }

    fn set_boost_events(&self, id: Uuid, boost_events: f64) {
        let mut posts = self.posts.lock().unwrap();
        let post = posts.get_mut(&id).expect("known post");
        post.boost_events = boost_events;
        post.cached = None;
    }
}

#[async_trait]
impl PostsRepo for InMemoryStore {
    async fn select_candidates(
        &self,
        scope: &RankScope,
        tier: SelectionTier,
        caps: BucketCaps,
        as_of: OffsetDateTime,
        _recency_window_hours: i64,
    ) -> Result<Vec<Uuid>, RepoError> {
        let window_start = as_of - time::Duration::days(tier.lookback_days);
        let posts = self.posts.lock().unwrap();
        let mut ids: Vec<Uuid> = posts
            .values()
            .filter(|post| {
                scope.visibilities.contains(&post.row.visibility)
                    && post.row.created_at >= window_start
                    && (!tier.top_level_only || post.row.in_reply_to_id.is_none())
                    && scope
                        .authors
                        .as_ref()
                        .is_none_or(|authors| authors.contains(&post.row.author_id))
            })
            .map(|post| post.row.id)
            .collect();
        ids.sort();
        ids.truncate(caps.total() as usize);
        Ok(ids)
    }

    async fn load_scoring_rows(
        &self,
        ids: &[Uuid],
        _as_of: OffsetDateTime,
    ) -> Result<Vec<ScoringRow>, RepoError> {
        let posts = self.posts.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| posts.get(id).map(|post| post.row))
            .collect())
    }
}

#[async_trait]
impl EngagementRepo for InMemoryStore {
    async fn load_cached_scores(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<CachedScore>>, RepoError> {
        let posts = self.posts.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| posts.get(id).map(|post| (*id, post.cached)))
            .collect())
    }

    async fn recompute_boost_scores(
        &self,
        ids: &[Uuid],
        _now: OffsetDateTime,
    ) -> Result<HashMap<Uuid, f64>, RepoError> {
        let posts = self.posts.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| posts.get(id).map(|post| (*id, post.boost_events)))
            .collect())
    }

    async fn write_boost_scores(
        &self,
        scores: &[(Uuid, f64)],
        updated_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        let mut posts = self.posts.lock().unwrap();
        for (id, score) in scores {
            if let Some(post) = posts.get_mut(id) {
                post.cached = Some(CachedScore {
                    score: *score,
                    updated_at,
                });
            }
        }
        Ok(())
    }

    async fn invalidate(&self, post_id: Uuid) -> Result<(), RepoError> {
        if let Some(post) = self.posts.lock().unwrap().get_mut(&post_id) {
            post.cached = None;
        }
        Ok(())
    }

    async fn list_stale_engaged(
        &self,
        stale_before: OffsetDateTime,
        cap: i64,
    ) -> Result<Vec<Uuid>, RepoError> {
        let posts = self.posts.lock().unwrap();
        let mut ids: Vec<Uuid> = posts
            .values()
            .filter(|post| {
                post.boost_events > 0.0
                    && post
                        .cached
                        .is_none_or(|cached| cached.updated_at < stale_before)
            })
            .map(|post| post.row.id)
            .collect();
        ids.sort();
        ids.truncate(cap as usize);
        Ok(ids)
    }
}

#[async_trait]
impl TrendingRepo for InMemoryStore {
    async fn latest_generation(&self) -> Result<Option<OffsetDateTime>, RepoError> {
        let trending = self.trending.lock().unwrap();
        Ok(trending.iter().map(|entry| entry.as_of).max())
    }

    async fn generation_exists(&self, as_of: OffsetDateTime) -> Result<bool, RepoError> {
        let trending = self.trending.lock().unwrap();
        Ok(trending.iter().any(|entry| entry.as_of == as_of))
    }

    async fn list_page(
        &self,
        as_of: OffsetDateTime,
        scope: &RankScope,
        page: PageRequest<FeedCursor>,
    ) -> Result<CursorPage<RankedItem>, RepoError> {
        let trending = self.trending.lock().unwrap();
        let mut rows: Vec<&TrendingEntryRecord> = trending
            .iter()
            .filter(|entry| {
                entry.as_of == as_of && scope.visibilities.contains(&entry.visibility)
            })
            .filter(|entry| match page.cursor {
                Some(cursor) => cursor.admits(entry.score, entry.post_created_at, entry.post_id),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap()
                .then_with(|| b.post_created_at.cmp(&a.post_created_at))
                .then_with(|| b.post_id.cmp(&a.post_id))
        });

        let limit = page.limit as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = has_more.then(|| {
            let last = rows.last().unwrap();
            FeedCursor::new(as_of, last.score, last.post_created_at, last.post_id).encode()
        });

        let items = rows
            .into_iter()
            .map(|entry| RankedItem {
                post_id: entry.post_id,
                score: entry.score,
                created_at: entry.post_created_at,
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
        let mut trending = self.trending.lock().unwrap();
        trending.retain(|entry| entry.as_of != as_of && entry.as_of >= retain_after);
        trending.extend_from_slice(rows);
        Ok(())
    }
}

const TTL: Duration = Duration::from_secs(600);

fn rank_service(store: &Arc<InMemoryStore>) -> FeedRankService {
    let posts: Arc<dyn PostsRepo> = store.clone();
    let engagement: Arc<dyn EngagementRepo> = store.clone();
    let trending: Arc<dyn TrendingRepo> = store.clone();
    FeedRankService::new(
        CandidateSelector::new(posts.clone(), SelectionPolicy::default()),
        ScoreCacheService::new(engagement, TTL),
        posts,
        trending,
    )
}

fn batch_service(store: &Arc<InMemoryStore>, policy: BatchPolicy) -> TrendingBatchService {
    let posts: Arc<dyn PostsRepo> = store.clone();
    let engagement: Arc<dyn EngagementRepo> = store.clone();
    let trending: Arc<dyn TrendingRepo> = store.clone();
    TrendingBatchService::new(
        CandidateSelector::new(posts.clone(), SelectionPolicy::default()),
        ScoreCacheService::new(engagement.clone(), TTL),
        posts,
        engagement,
        trending,
        Arc::new(ProcessBatchLock::default()),
        policy,
    )
}

fn seed_posts(store: &InMemoryStore, count: u128) -> Vec<Uuid> {
    let base = OffsetDateTime::now_utc() - time::Duration::hours(10);
    (0..count)
        .map(|index| {
            store.insert_post(
                index + 1,
                base + time::Duration::minutes(index as i64),
                (count - index) as f64,
            )
        })
        .collect()
}

async fn scroll(
    service: &FeedRankService,
    mode: FeedMode,
    limit: u32,
) -> (Vec<RankedItem>, Vec<String>) {
    let mut items = Vec::new();
    let mut cursors = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = service
            .rank(RankRequest {
                mode,
                scope: RankScope::public(),
                cursor: cursor.clone(),
                limit,
            })
            .await
            .expect("rank request succeeds");
        items.extend(page.items);
        match page.next_cursor {
            Some(next) => {
                cursors.push(next.clone());
                cursor = Some(next);
            }
            None => break,
        }
    }
    (items, cursors)
}

fn assert_strictly_decreasing(items: &[RankedItem]) {
    for pair in items.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        assert!(
            a.score > b.score
                || (a.score == b.score && a.created_at > b.created_at)
                || (a.score == b.score && a.created_at == b.created_at && a.post_id > b.post_id),
            "feed order violated between {:?} and {:?}",
            a,
            b
        );
    }
}

#[tokio::test]
async fn live_scroll_covers_every_post_exactly_once() {
    let store = Arc::new(InMemoryStore::default());
    let seeded = seed_posts(&store, 7);
    let service = rank_service(&store);

    let (items, cursors) = scroll(&service, FeedMode::Live, 2).await;

    assert_eq!(items.len(), seeded.len());
    let distinct: HashSet<Uuid> = items.iter().map(|item| item.post_id).collect();
    assert_eq!(distinct.len(), seeded.len());
    assert_strictly_decreasing(&items);

    // Every page of one scroll carries the epoch chosen on page one.
    let epochs: HashSet<OffsetDateTime> = cursors
        .iter()
        .map(|raw| FeedCursor::decode(raw).expect("valid cursor").as_of())
        .collect();
    assert_eq!(epochs.len(), 1);
}

#[tokio::test]
async fn garbage_cursor_starts_a_fresh_first_page() {
    let store = Arc::new(InMemoryStore::default());
    seed_posts(&store, 3);
    let service = rank_service(&store);

    let fresh = service
        .rank(RankRequest {
            mode: FeedMode::Live,
            scope: RankScope::public(),
            cursor: None,
            limit: 2,
        })
        .await
        .unwrap();
    let garbled = service
        .rank(RankRequest {
            mode: FeedMode::Live,
            scope: RankScope::public(),
            cursor: Some("???bookmarked-long-ago???".to_string()),
            limit: 2,
        })
        .await
        .unwrap();

    let fresh_ids: Vec<Uuid> = fresh.items.iter().map(|item| item.post_id).collect();
    let garbled_ids: Vec<Uuid> = garbled.items.iter().map(|item| item.post_id).collect();
    assert_eq!(fresh_ids, garbled_ids);
}

#[tokio::test]
async fn snapshot_scroll_survives_a_new_generation() {
    let store = Arc::new(InMemoryStore::default());
    seed_posts(&store, 6);
    let service = rank_service(&store);
    let batch = batch_service(&store, BatchPolicy::default());

    assert!(batch.run_batch().await.unwrap());

    // First page against the first generation.
    let page_one = service
        .rank(RankRequest {
            mode: FeedMode::Snapshot,
            scope: RankScope::public(),
            cursor: None,
            limit: 2,
        })
        .await
        .unwrap();
    assert_eq!(page_one.items.len(), 2);
    let mid_scroll_cursor = page_one.next_cursor.clone().expect("more pages");

    // Engagement shifts and a new generation commits mid-scroll.
    store.set_boost_events(Uuid::from_u128(6), 100.0);
    assert!(batch.run_batch().await.unwrap());

    // The in-flight cursor still resolves against its own generation: the
    // remaining items complete the original ranking with no duplicates.
    let mut seen: Vec<Uuid> = page_one.items.iter().map(|item| item.post_id).collect();
    let mut cursor = Some(mid_scroll_cursor);
    while let Some(raw) = cursor {
        let page = service
            .rank(RankRequest {
                mode: FeedMode::Snapshot,
                scope: RankScope::public(),
                cursor: Some(raw),
                limit: 2,
            })
            .await
            .unwrap();
        seen.extend(page.items.iter().map(|item| item.post_id));
        cursor = page.next_cursor;
    }
    assert_eq!(seen.len(), 6);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 6);

    // A fresh scroll sees the re-ranked generation with the surge on top.
    let reranked = service
        .rank(RankRequest {
            mode: FeedMode::Snapshot,
            scope: RankScope::public(),
            cursor: None,
            limit: 2,
        })
        .await
        .unwrap();
    assert_eq!(reranked.items[0].post_id, Uuid::from_u128(6));
}

#[tokio::test]
async fn purged_generation_cursor_restarts_on_the_latest() {
    let store = Arc::new(InMemoryStore::default());
    seed_posts(&store, 4);
    let service = rank_service(&store);
    // Zero retention: every committed generation evicts the previous one.
    let batch = batch_service(
        &store,
        BatchPolicy {
            retention: Duration::ZERO,
            ..BatchPolicy::default()
        },
    );

    assert!(batch.run_batch().await.unwrap());
    let page_one = service
        .rank(RankRequest {
            mode: FeedMode::Snapshot,
            scope: RankScope::public(),
            cursor: None,
            limit: 2,
        })
        .await
        .unwrap();
    let stale_cursor = page_one.next_cursor.expect("more pages");

    assert!(batch.run_batch().await.unwrap());

    let restarted = service
        .rank(RankRequest {
            mode: FeedMode::Snapshot,
            scope: RankScope::public(),
            cursor: Some(stale_cursor),
            limit: 2,
        })
        .await
        .unwrap();

    // The old generation is gone, so the scroll restarts at the top of the
    // latest one instead of failing.
    let fresh_ids: Vec<Uuid> = page_one.items.iter().map(|item| item.post_id).collect();
    let restarted_ids: Vec<Uuid> = restarted.items.iter().map(|item| item.post_id).collect();
    assert_eq!(restarted_ids, fresh_ids);
}

#[tokio::test]
async fn empty_snapshot_table_yields_an_empty_page() {
    let store = Arc::new(InMemoryStore::default());
    seed_posts(&store, 3);
    let service = rank_service(&store);

    let page = service
        .rank(RankRequest {
            mode: FeedMode::Snapshot,
            scope: RankScope::public(),
            cursor: None,
            limit: 5,
        })
        .await
        .unwrap();

    assert!(page.items.is_empty());
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn batch_caps_the_generation_size() {
    let store = Arc::new(InMemoryStore::default());
    seed_posts(&store, 10);
    let batch = batch_service(
        &store,
        BatchPolicy {
            max_rows: 4,
            ..BatchPolicy::default()
        },
    );

    assert!(batch.run_batch().await.unwrap());

    let trending = store.trending.lock().unwrap();
    assert_eq!(trending.len(), 4);
    // The cap keeps the best-scored rows: the four most-boosted posts.
    let kept: HashSet<Uuid> = trending.iter().map(|entry| entry.post_id).collect();
    let expected: HashSet<Uuid> = (1..=4).map(Uuid::from_u128).collect();
    assert_eq!(kept, expected);
}

#[tokio::test]
async fn batch_with_no_candidates_leaves_the_table_untouched() {
    let store = Arc::new(InMemoryStore::default());
    let batch = batch_service(&store, BatchPolicy::default());

    assert!(!batch.run_batch().await.unwrap());
    assert!(store.trending.lock().unwrap().is_empty());
}
