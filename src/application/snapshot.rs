//! Periodic precomputation of the trending generation.
//!
//! One batch picks an `as_of`, warms the score cache for the most-engaged
//! stale posts, selects candidates under the wide trending scope, scores and
//! sorts them, and replaces the generation in a single transaction. A batch
//! that fails anywhere leaves the previous generation serving reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{gauge, histogram};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::application::candidates::CandidateSelector;
use crate::application::engagement::ScoreCacheService;
use crate::application::ranking::score_rows;
use crate::application::repos::{
    EngagementRepo, PostsRepo, RankScope, RepoError, ScoringRow, TrendingRepo,
};
use crate::domain::entities::TrendingEntryRecord;
use crate::domain::types::PostVisibility;

/// Mutual exclusion for batch runs. The in-process guard is enough for a
/// single instance owning its own schedule tick; multi-instance deployments
/// swap in the advisory-lock implementation without touching batch logic.
#[async_trait]
pub trait BatchLock: Send + Sync {
    /// `false` means a batch is already running somewhere: skip this tick,
    /// do not retry in a loop.
    async fn try_acquire(&self) -> Result<bool, RepoError>;
    async fn release(&self);
}

/// Single-process guard backed by an atomic flag.
#[derive(Default)]
pub struct ProcessBatchLock {
    held: AtomicBool,
}

#[async_trait]
impl BatchLock for ProcessBatchLock {
    async fn try_acquire(&self) -> Result<bool, RepoError> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    /// Upper bound on rows per generation.
    pub max_rows: usize,
    /// How long superseded generations keep serving in-flight scrolls.
    pub retention: Duration,
    /// Cap on the eager cache-warm pass.
    pub warm_cap: i64,
    /// Cadence between runs; the boot check treats 1.2x this as overdue.
    pub interval: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_rows: 15_000,
            retention: Duration::from_secs(3600),
            warm_cap: 2000,
            interval: Duration::from_secs(600),
        }
    }
}

#[derive(Clone)]
pub struct TrendingBatchService {
    selector: CandidateSelector,
    score_cache: ScoreCacheService,
    posts: Arc<dyn PostsRepo>,
    engagement: Arc<dyn EngagementRepo>,
    trending: Arc<dyn TrendingRepo>,
    lock: Arc<dyn BatchLock>,
    policy: BatchPolicy,
}

impl TrendingBatchService {
    pub fn new(
        selector: CandidateSelector,
        score_cache: ScoreCacheService,
        posts: Arc<dyn PostsRepo>,
        engagement: Arc<dyn EngagementRepo>,
        trending: Arc<dyn TrendingRepo>,
        lock: Arc<dyn BatchLock>,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            selector,
            score_cache,
            posts,
            engagement,
            trending,
            lock,
            policy,
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Run one batch under the lock. Returns whether a new generation was
    /// written; a held lock reads as "already running" and is not an error.
    pub async fn run_batch(&self) -> Result<bool, RepoError> {
        if !self.lock.try_acquire().await? {
            debug!("Trending batch already running; skipping this tick");
            return Ok(false);
        }

        let started = Instant::now();
        let result = self.run_locked().await;
        self.lock.release().await;

        let written = result?;
        histogram!("corrente_trending_batch_ms").record(started.elapsed().as_millis() as f64);
        if let Some(rows) = written {
            gauge!("corrente_trending_rows").set(rows as f64);
            info!(
                rows,
                duration_ms = started.elapsed().as_millis() as u64,
                "Trending batch committed a new generation"
            );
        }
        Ok(written.is_some())
    }

    /// Run one batch at startup when the latest generation is missing or
    /// older than 1.2x the cadence, so a restarted instance never serves a
    /// long-stale trending feed.
    pub async fn run_boot_check(&self) -> Result<bool, RepoError> {
        let overdue_after = self.policy.interval.mul_f64(1.2);
        if let Some(latest) = self.trending.latest_generation().await? {
            let age = OffsetDateTime::now_utc() - latest;
            if age < time::Duration::try_from(overdue_after).unwrap_or(time::Duration::MAX) {
                debug!(latest = %latest, "Trending snapshot is current; no boot batch needed");
                return Ok(false);
            }
        }
        self.run_batch().await
    }

    async fn run_locked(&self) -> Result<Option<usize>, RepoError> {
        let as_of = OffsetDateTime::now_utc();

        // Eager warm pass so the batch does not score thousands of posts
        // against a stale cache.
        let stale_before = as_of - self.score_cache.ttl();
        let warm_ids = self
            .engagement
            .list_stale_engaged(stale_before, self.policy.warm_cap)
            .await?;
        if !warm_ids.is_empty() {
            debug!(posts = warm_ids.len(), "Warming stale engagement scores");
            self.score_cache.ensure_fresh(&warm_ids).await?;
        }

        let scope = trending_scope();
        let ids = self.selector.select(&scope, as_of).await?;
        if ids.is_empty() {
            // Nothing to rank even at the widest tier; keep the previous
            // generation serving instead of committing an empty one.
            debug!("No trending candidates; previous generation left in place");
            return Ok(None);
        }

        let cached = self.score_cache.ensure_fresh(&ids).await?;
        let rows = self.posts.load_scoring_rows(&ids, as_of).await?;
        let scored = score_rows(&rows, &cached, as_of);

        let mut entries: Vec<TrendingEntryRecord> = rows
            .iter()
            .zip(scored.iter())
            .map(|(row, item)| entry_from_row(row, item.score, as_of))
            .collect();
        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.post_created_at.cmp(&a.post_created_at))
                .then_with(|| b.post_id.cmp(&a.post_id))
        });
        entries.truncate(self.policy.max_rows);

        let retain_after =
            as_of - time::Duration::try_from(self.policy.retention).unwrap_or(time::Duration::ZERO);
        self.trending
            .replace_generation(as_of, &entries, retain_after)
            .await?;

        Ok(Some(entries.len()))
    }
}

/// The batch ranks across every visibility tier; read-time scope filtering
/// narrows each page to the viewer's allow-list.
fn trending_scope() -> RankScope {
    RankScope {
        visibilities: vec![
            PostVisibility::Public,
            PostVisibility::Unlisted,
            PostVisibility::Followers,
        ],
        authors: None,
    }
}

fn entry_from_row(row: &ScoringRow, score: f64, as_of: OffsetDateTime) -> TrendingEntryRecord {
    TrendingEntryRecord {
        as_of,
        post_id: row.id,
        post_created_at: row.created_at,
        score,
        author_id: row.author_id,
        visibility: row.visibility,
        in_reply_to_id: row.in_reply_to_id,
        thread_root_id: row.thread_root_id,
    }
}
