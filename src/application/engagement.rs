//! Per-post engagement score cache with TTL staleness and batched refresh.
//!
//! The decayed boost aggregate is expensive to recompute per request, so it
//! is materialized on the post row together with its write timestamp. A null
//! pair means "never computed" and is treated exactly like "stale"; write
//! paths shorten staleness below the TTL only by nulling the pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::repos::{CachedScore, EngagementRepo, RepoError};

/// True when the cached entry must be recomputed before use.
pub fn is_stale(entry: Option<&CachedScore>, now: OffsetDateTime, ttl: Duration) -> bool {
    match entry {
        None => true,
        Some(cached) => now - cached.updated_at >= ttl,
    }
}

#[derive(Clone)]
pub struct ScoreCacheService {
    engagement: Arc<dyn EngagementRepo>,
    ttl: Duration,
}

impl ScoreCacheService {
    pub fn new(engagement: Arc<dyn EngagementRepo>, ttl: Duration) -> Self {
        Self { engagement, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return a fresh cached score for every known id, recomputing all stale
    /// entries in one batched aggregate and one bulk write-back. Ids that do
    /// not resolve to a post are silently skipped.
    pub async fn ensure_fresh(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, CachedScore>, RepoError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let now = OffsetDateTime::now_utc();
        let cached = self.engagement.load_cached_scores(ids).await?;

        let mut fresh = HashMap::with_capacity(cached.len());
        let mut stale_ids = Vec::new();
        for (id, entry) in &cached {
            if is_stale(entry.as_ref(), now, self.ttl) {
                stale_ids.push(*id);
            } else if let Some(entry) = entry {
                fresh.insert(*id, *entry);
            }
        }

        counter!("corrente_score_cache_hit_total").increment(fresh.len() as u64);
        counter!("corrente_score_cache_miss_total").increment(stale_ids.len() as u64);

        if stale_ids.is_empty() {
            return Ok(fresh);
        }

        let recomputed = self
            .engagement
            .recompute_boost_scores(&stale_ids, now)
            .await?;

        // Posts with no events at all still get an explicit zero written so
        // the TTL applies to them like any other entry.
        let mut writes = Vec::with_capacity(stale_ids.len());
        for id in &stale_ids {
            let score = recomputed.get(id).copied().unwrap_or(0.0);
            writes.push((*id, score));
        }
        self.engagement.write_boost_scores(&writes, now).await?;
        counter!("corrente_score_cache_refresh_total").increment(writes.len() as u64);
        debug!(refreshed = writes.len(), "Refreshed stale engagement scores");

        for (id, score) in writes {
            fresh.insert(
                id,
                CachedScore {
                    score,
                    updated_at: now,
                },
            );
        }

        Ok(fresh)
    }

    /// Null the cache pair so the next ranked read recomputes. Backs the
    /// internal HTTP endpoint; write paths that must invalidate atomically
    /// with their counter mutation use the repository's transactional form
    /// instead.
    pub async fn invalidate(&self, post_id: Uuid) -> Result<(), RepoError> {
        self.engagement.invalidate(post_id).await?;
        counter!("corrente_score_cache_invalidate_total").increment(1);
        Ok(())
    }
}
