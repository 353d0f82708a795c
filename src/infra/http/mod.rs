//! HTTP surface: the public feed routes and the internal operations routes.

mod feed;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::application::{
    engagement::ScoreCacheService, ranking::FeedRankService, snapshot::TrendingBatchService,
};
use crate::infra::db::PostgresRepositories;

#[derive(Clone)]
pub struct HttpState {
    pub rank: Arc<FeedRankService>,
    pub score_cache: Arc<ScoreCacheService>,
    pub batch: Arc<TrendingBatchService>,
    pub db: Arc<PostgresRepositories>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/feeds/trending", get(feed::trending))
        .route("/feeds/home", get(feed::home))
        .route("/internal/trending/run", post(feed::run_trending_batch))
        .route("/internal/posts/{id}/invalidate", post(feed::invalidate_post))
        .route("/healthz", get(feed::healthz))
        .with_state(state)
}
