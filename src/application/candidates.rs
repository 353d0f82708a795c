//! Bounded candidate selection for ranked feeds.
//!
//! Scoring every post in scope would scan the whole table, so the selector
//! unions a handful of capped, independently-indexed buckets: recent posts,
//! the top posts per engagement counter, and engaged replies. Sparse scopes
//! escalate through widening tiers instead of scanning unboundedly.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::repos::{BucketCaps, PostsRepo, RankScope, RepoError, SelectionTier};

/// Tunable knobs for one selector instance.
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    /// Window of the pure-recency bucket.
    pub recency_window_hours: i64,
    pub caps: BucketCaps,
    /// Widening ladder; strictly increasing permissiveness, first non-empty
    /// tier wins. Tiers are never merged, which keeps a post from entering
    /// the candidate set twice through different tiers.
    pub tiers: Vec<SelectionTier>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            recency_window_hours: 72,
            caps: BucketCaps {
                recent: 8000,
                per_counter: 1500,
                replies: 1200,
            },
            tiers: vec![
                SelectionTier {
                    lookback_days: 30,
                    top_level_only: true,
                },
                SelectionTier {
                    lookback_days: 90,
                    top_level_only: true,
                },
                SelectionTier {
                    lookback_days: 90,
                    top_level_only: false,
                },
            ],
        }
    }
}

impl SelectionPolicy {
    /// Each tier must admit at least everything the previous one admitted.
    pub fn tiers_are_widening(&self) -> bool {
        self.tiers.windows(2).all(|pair| {
            let (narrow, wide) = (pair[0], pair[1]);
            wide.lookback_days >= narrow.lookback_days
                && (narrow.top_level_only || !wide.top_level_only)
                && wide != narrow
        })
    }
}

#[derive(Clone)]
pub struct CandidateSelector {
    posts: Arc<dyn PostsRepo>,
    policy: SelectionPolicy,
}

impl CandidateSelector {
    pub fn new(posts: Arc<dyn PostsRepo>, policy: SelectionPolicy) -> Self {
        Self { posts, policy }
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Deduplicated candidate ids for the scope, at most
    /// `policy.caps.total()` of them regardless of table size.
    pub async fn select(
        &self,
        scope: &RankScope,
        as_of: OffsetDateTime,
    ) -> Result<Vec<Uuid>, RepoError> {
        for (rung, tier) in self.policy.tiers.iter().enumerate() {
            let ids = self
                .posts
                .select_candidates(
                    scope,
                    *tier,
                    self.policy.caps,
                    as_of,
                    self.policy.recency_window_hours,
                )
                .await?;

            if !ids.is_empty() {
                if rung > 0 {
                    debug!(
                        rung,
                        lookback_days = tier.lookback_days,
                        top_level_only = tier.top_level_only,
                        candidates = ids.len(),
                        "Candidate selection widened past the primary tier"
                    );
                }
                return Ok(ids);
            }
        }

        Ok(Vec::new())
    }
}
