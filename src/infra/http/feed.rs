use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::application::error::HttpError;
use crate::application::pagination::CursorPage;
use crate::application::ranking::RankRequest;
use crate::application::repos::{RankScope, RankedItem};
use crate::domain::types::{FeedMode, PostVisibility};

use super::HttpState;

/// Header carrying the caller's already-resolved visibility allow-list,
/// comma-separated. Resolution happens upstream; absent or empty means
/// public only.
const VISIBILITY_ALLOW_HEADER: &str = "x-visibility-allow";

const DEFAULT_PAGE_LIMIT: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    /// Comma-separated author ids for live feeds (home: the followed set,
    /// profile: a single author).
    pub authors: Option<String>,
}

pub async fn trending(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<CursorPage<RankedItem>>, HttpError> {
    let request = RankRequest {
        mode: FeedMode::Snapshot,
        scope: RankScope {
            visibilities: allowed_visibilities(&headers),
            authors: None,
        },
        cursor: query.cursor,
        limit: query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
    };

    let page = state.rank.rank(request).await?;
    Ok(Json(page))
}

pub async fn home(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<CursorPage<RankedItem>>, HttpError> {
    let authors = parse_authors(query.authors.as_deref())?;
    let request = RankRequest {
        mode: FeedMode::Live,
        scope: RankScope {
            visibilities: allowed_visibilities(&headers),
            authors,
        },
        cursor: query.cursor,
        limit: query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
    };

    let page = state.rank.rank(request).await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct RunBatchQuery {
    /// When set, wait at most this long for the batch; otherwise block
    /// until it finishes or skips.
    pub wait_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunBatchBody {
    /// Whether this call observed the batch to completion.
    pub completed: bool,
    /// Whether a new generation was written (false when the lock was held
    /// or there was nothing to rank).
    pub written: bool,
}

pub async fn run_trending_batch(
    State(state): State<HttpState>,
    Query(query): Query<RunBatchQuery>,
) -> Result<Json<RunBatchBody>, HttpError> {
    let batch = state.batch.clone();
    let handle = tokio::spawn(async move { batch.run_batch().await });

    let outcome = match query.wait_secs {
        Some(wait_secs) => {
            match tokio::time::timeout(Duration::from_secs(wait_secs), handle).await {
                Ok(joined) => Some(joined),
                Err(_elapsed) => {
                    debug!(wait_secs, "Trending batch still running past the wait");
                    None
                }
            }
        }
        None => Some(handle.await),
    };

    match outcome {
        None => Ok(Json(RunBatchBody {
            completed: false,
            written: false,
        })),
        Some(joined) => {
            let written = joined
                .map_err(|err| {
                    HttpError::new(
                        "infra::http::run_trending_batch",
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                        format!("batch task join failed: {err}"),
                    )
                })?
                .map_err(HttpError::from)?;
            Ok(Json(RunBatchBody {
                completed: true,
                written,
            }))
        }
    }
}

pub async fn invalidate_post(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, HttpError> {
    state.score_cache.invalidate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn healthz(State(state): State<HttpState>) -> Result<StatusCode, HttpError> {
    state.db.health_check().await.map_err(|err| {
        HttpError::new(
            "infra::http::healthz",
            StatusCode::SERVICE_UNAVAILABLE,
            "Service temporarily unavailable",
            err.to_string(),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

fn allowed_visibilities(headers: &HeaderMap) -> Vec<PostVisibility> {
    let Some(raw) = headers
        .get(VISIBILITY_ALLOW_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return vec![PostVisibility::Public];
    };

    let mut allowed: Vec<PostVisibility> = raw
        .split(',')
        .filter_map(|tag| PostVisibility::try_from(tag.trim()).ok())
        .collect();
    allowed.dedup();

    if allowed.is_empty() {
        vec![PostVisibility::Public]
    } else {
        allowed
    }
}

fn parse_authors(raw: Option<&str>) -> Result<Option<Vec<Uuid>>, HttpError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut authors = Vec::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let id = Uuid::parse_str(token).map_err(|err| {
            HttpError::new(
                "infra::http::parse_authors",
                StatusCode::BAD_REQUEST,
                "Invalid author id",
                format!("`{token}` is not a uuid: {err}"),
            )
        })?;
        authors.push(id);
    }

    Ok(if authors.is_empty() {
        None
    } else {
        Some(authors)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_defaults_to_public() {
        let headers = HeaderMap::new();
        assert_eq!(allowed_visibilities(&headers), vec![PostVisibility::Public]);
    }

    #[test]
    fn header_tags_are_parsed_and_unknown_ones_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            VISIBILITY_ALLOW_HEADER,
            "public, followers, direct".parse().unwrap(),
        );
        assert_eq!(
            allowed_visibilities(&headers),
            vec![PostVisibility::Public, PostVisibility::Followers]
        );
    }

    #[test]
    fn empty_header_falls_back_to_public() {
        let mut headers = HeaderMap::new();
        headers.insert(VISIBILITY_ALLOW_HEADER, "direct".parse().unwrap());
        assert_eq!(allowed_visibilities(&headers), vec![PostVisibility::Public]);
    }

    #[test]
    fn author_lists_parse_or_reject() {
        let id = Uuid::new_v4();
        let parsed = parse_authors(Some(&format!("{id}, "))).unwrap();
        assert_eq!(parsed, Some(vec![id]));

        assert!(parse_authors(Some("not-a-uuid")).is_err());
        assert_eq!(parse_authors(None).unwrap(), None);
        assert_eq!(parse_authors(Some("")).unwrap(), None);
    }
}
