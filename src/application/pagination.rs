//! Shared cursor pagination helpers.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Cursor payload version. Bump when the scoring epoch semantics change so
/// outstanding client cursors can be told apart from current ones.
const FEED_CURSOR_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct FeedCursorPayload {
    v: u8,
    as_of: OffsetDateTime,
    score: f64,
    created_at: OffsetDateTime,
    id: Uuid,
}

/// Cursor for paginating ranked feeds.
///
/// Carries the scoring epoch (`as_of`) chosen on page one plus the full sort
/// key of the last row handed out, so every later page can resume strictly
/// below it without the epoch ever being recomputed mid-scroll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedCursor {
    as_of: OffsetDateTime,
    score: f64,
    created_at: OffsetDateTime,
    id: Uuid,
}

impl FeedCursor {
    pub fn new(as_of: OffsetDateTime, score: f64, created_at: OffsetDateTime, id: Uuid) -> Self {
        Self {
            as_of,
            score,
            created_at,
            id,
        }
    }

    pub fn as_of(&self) -> OffsetDateTime {
        self.as_of
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True when `(score, created_at, id)` sorts strictly below this cursor
    /// under the feed order (score desc, created_at desc, id desc).
    pub fn admits(&self, score: f64, created_at: OffsetDateTime, id: Uuid) -> bool {
        if score != self.score {
            return score < self.score;
        }
        if created_at != self.created_at {
            return created_at < self.created_at;
        }
        id < self.id
    }

    pub fn encode(&self) -> String {
        let payload = FeedCursorPayload {
            v: FEED_CURSOR_VERSION,
            as_of: self.as_of,
            score: self.score,
            created_at: self.created_at,
            id: self.id,
        };
        let serialized =
            serde_json::to_vec(&payload).expect("serializing feed cursor payload should succeed");
        URL_SAFE_NO_PAD.encode(serialized)
    }

    pub fn decode(cursor: &str) -> Result<Self, PaginationError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|err| PaginationError::InvalidCursor(err.to_string()))?;
        let payload: FeedCursorPayload = serde_json::from_slice(&bytes)
            .map_err(|err| PaginationError::InvalidCursor(err.to_string()))?;
        if payload.v != FEED_CURSOR_VERSION {
            return Err(PaginationError::InvalidCursor(format!(
                "unsupported cursor version {}",
                payload.v
            )));
        }
        Ok(Self {
            as_of: payload.as_of,
            score: payload.score,
            created_at: payload.created_at,
            id: payload.id,
        })
    }
}

/// Cursor-aware pagination request.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<C> {
    pub limit: u32,
    pub cursor: Option<C>,
}

impl<C> PageRequest<C> {
    pub fn new(limit: u32, cursor: Option<C>) -> Self {
        Self { limit, cursor }
    }
}

/// Cursor-aware page result.
#[derive(Debug, Clone, Serialize)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> CursorPage<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }
}

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;
    use time::macros::datetime;

    #[test]
    fn feed_cursor_round_trip() {
        let id = Uuid::new_v4();
        let as_of = datetime!(2025-06-01 12:00 UTC);
        let created_at = as_of - Duration::hours(3);
        let cursor = FeedCursor::new(as_of, 4.25, created_at, id);

        let decoded = FeedCursor::decode(&cursor.encode()).expect("decoded cursor");

        assert_eq!(decoded.as_of(), as_of);
        assert_eq!(decoded.score(), 4.25);
        assert_eq!(decoded.created_at(), created_at);
        assert_eq!(decoded.id(), id);
    }

    #[test]
    fn decoding_invalid_cursor_reports_error() {
        let err = FeedCursor::decode("not-base64!").expect_err("invalid cursor rejected");
        assert!(matches!(err, PaginationError::InvalidCursor(_)));
    }

    #[test]
    fn decoding_truncated_payload_reports_error() {
        let truncated = URL_SAFE_NO_PAD.encode(b"{\"v\":1,\"score\":2.0");
        let err = FeedCursor::decode(&truncated).expect_err("truncated cursor rejected");
        assert!(matches!(err, PaginationError::InvalidCursor(_)));
    }

    #[test]
    fn decoding_unknown_version_reports_error() {
        let as_of = datetime!(2025-06-01 12:00 UTC);
        let payload = FeedCursorPayload {
            v: 9,
            as_of,
            score: 1.0,
            created_at: as_of,
            id: Uuid::new_v4(),
        };
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let err = FeedCursor::decode(&encoded).expect_err("future version rejected");
        assert!(matches!(err, PaginationError::InvalidCursor(_)));
    }

    #[test]
    fn admits_follows_lexicographic_feed_order() {
        let as_of = datetime!(2025-06-01 12:00 UTC);
        let created_at = datetime!(2025-06-01 09:00 UTC);
        let id = Uuid::from_u128(500);
        let cursor = FeedCursor::new(as_of, 3.0, created_at, id);

        // Lower score passes regardless of the tiebreakers.
        assert!(cursor.admits(2.9, created_at + Duration::hours(1), Uuid::from_u128(900)));
        // Equal score falls through to created_at.
        assert!(cursor.admits(3.0, created_at - Duration::minutes(1), Uuid::from_u128(900)));
        assert!(!cursor.admits(3.0, created_at + Duration::minutes(1), Uuid::from_u128(1)));
        // Equal score and created_at falls through to the id.
        assert!(cursor.admits(3.0, created_at, Uuid::from_u128(499)));
        assert!(!cursor.admits(3.0, created_at, id));
        assert!(!cursor.admits(3.0, created_at, Uuid::from_u128(501)));
        // Higher score never passes.
        assert!(!cursor.admits(3.1, created_at - Duration::hours(5), Uuid::from_u128(1)));
    }
}
