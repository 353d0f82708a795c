//! Decay-weighted scoring of posts.
//!
//! Everything here is a pure function of its inputs; the same inputs at the
//! same reference instant always produce the same score, which is what lets
//! a scroll session freeze its reference instant and stay stable.

use time::OffsetDateTime;

use crate::domain::types::AccountTier;

/// Half-life applied to individual engagement events (boosts).
pub const BOOST_HALF_LIFE_SECS: f64 = 86_400.0;
/// Half-life applied to post age in the composite score.
pub const AGE_HALF_LIFE_SECS: f64 = 43_200.0;

const BOOKMARK_WEIGHT: f64 = 0.5;
const COMMENT_WEIGHT: f64 = 0.5;
const TAG_BONUS_BASE: f64 = 0.05;
const TAG_BONUS_SPAN: f64 = 0.15;
const TOP_LEVEL_MULTIPLIER: f64 = 1.15;
const DELETED_ANCESTOR_PENALTY: f64 = 0.85;

/// `0.5 ^ (age / half_life)` with the age clamped to zero, so timestamps in
/// the future (clock skew) never amplify a score.
pub fn decay(now: OffsetDateTime, then: OffsetDateTime, half_life_secs: f64) -> f64 {
    let age_secs = (now - then).as_seconds_f64().max(0.0);
    0.5_f64.powf(age_secs / half_life_secs)
}

/// Everything the composite score consumes about one post. The cached boost
/// score and the auxiliary signals are loaded in bulk by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub created_at: OffsetDateTime,
    /// Cached decayed boost aggregate; `None` reads as zero, never as
    /// "unknown, exclude".
    pub boost_score: Option<f64>,
    pub bookmark_count: i32,
    /// Sum of `decay(child.created_at, 12h)` over non-deleted children.
    pub comment_signal: f64,
    /// Best tag trend score over the post's tags divided by the global
    /// maximum, when the post carries at least one trending tag.
    pub tag_trend_ratio: Option<f64>,
    pub pinned: bool,
    pub author_tier: AccountTier,
    pub is_reply: bool,
    /// Soft-deleted ancestors among {parent, root-if-distinct}: 0, 1 or 2.
    pub deleted_ancestors: u32,
}

/// Composite decay-weighted score of one post at the reference instant.
pub fn score(inputs: &ScoreInputs, now: OffsetDateTime) -> f64 {
    let age_decay = decay(now, inputs.created_at, AGE_HALF_LIFE_SECS);

    let boost_term = inputs.boost_score.unwrap_or(0.0) * age_decay;
    let bookmark_term = f64::from(inputs.bookmark_count) * BOOKMARK_WEIGHT * age_decay;
    let comment_term = inputs.comment_signal * COMMENT_WEIGHT;
    let tag_bonus = match inputs.tag_trend_ratio {
        Some(ratio) => TAG_BONUS_BASE + TAG_BONUS_SPAN * ratio.clamp(0.0, 1.0),
        None => 0.0,
    };
    let pinned_bonus = if inputs.pinned {
        inputs.author_tier.weight() * decay(now, inputs.created_at, BOOST_HALF_LIFE_SECS)
    } else {
        0.0
    };

    let raw = boost_term + bookmark_term + comment_term + tag_bonus + pinned_bonus;

    let placement = if inputs.is_reply {
        1.0
    } else {
        TOP_LEVEL_MULTIPLIER
    };
    let orphan_penalty = DELETED_ANCESTOR_PENALTY.powi(inputs.deleted_ancestors as i32);

    raw * placement * orphan_penalty
}
