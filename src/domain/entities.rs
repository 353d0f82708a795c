//! Domain entities mirrored from persistent storage.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::types::PostVisibility;

/// One precomputed ranking row. All rows sharing an `as_of` form one
/// generation; the columns repeat enough of the post to page without joins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendingEntryRecord {
    pub as_of: OffsetDateTime,
    pub post_id: Uuid,
    pub post_created_at: OffsetDateTime,
    pub score: f64,
    pub author_id: Uuid,
    pub visibility: PostVisibility,
    pub in_reply_to_id: Option<Uuid>,
    pub thread_root_id: Option<Uuid>,
}
