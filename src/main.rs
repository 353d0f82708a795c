use std::{process, sync::Arc};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use corrente::{
    application::{
        candidates::{CandidateSelector, SelectionPolicy},
        engagement::ScoreCacheService,
        error::AppError,
        jobs::{JobWorkerContext, process_trending_batch_job, trending_batch_schedule},
        ranking::FeedRankService,
        repos::{BucketCaps, EngagementRepo, PostsRepo, SelectionTier, TrendingRepo},
        snapshot::{BatchLock, BatchPolicy, ProcessBatchLock, TrendingBatchService},
    },
    config,
    infra::{
        db::{PgAdvisoryBatchLock, PostgresRepositories},
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Snapshot(_) => run_snapshot(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let (http_repositories, job_repositories) = init_repositories(&settings).await?;
    let app = build_application_context(http_repositories, job_repositories, &settings);

    // A restarted instance should not serve a long-stale trending feed;
    // batch failures here are logged, never fatal.
    match app.batch.run_boot_check().await {
        Ok(true) => info!("Boot check committed a fresh trending generation"),
        Ok(false) => {}
        Err(err) => warn!(error = %err, "Boot trending batch failed; serving existing snapshot"),
    }

    let monitor_handle = spawn_job_monitor(app.job_context.clone(), &settings.ranking)?;

    let result = serve_http(&settings, app.http_state).await;

    monitor_handle.abort();
    let _ = monitor_handle.await;

    result
}

async fn run_snapshot(settings: config::Settings) -> Result<(), AppError> {
    let (_, job_repositories) = init_repositories(&settings).await?;
    let app = build_application_context(job_repositories.clone(), job_repositories, &settings);

    let written = app
        .batch
        .run_batch()
        .await
        .map_err(|err| AppError::unexpected(format!("trending batch failed: {err}")))?;

    info!(written, "One-shot trending batch finished");
    Ok(())
}

struct ApplicationContext {
    http_state: HttpState,
    job_context: JobWorkerContext,
    batch: Arc<TrendingBatchService>,
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<(Arc<PostgresRepositories>, Arc<PostgresRepositories>), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let http_pool =
        PostgresRepositories::connect(database_url, settings.database.http_max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&http_pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    let jobs_pool =
        PostgresRepositories::connect(database_url, settings.database.jobs_max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok((
        Arc::new(PostgresRepositories::new(http_pool)),
        Arc::new(PostgresRepositories::new(jobs_pool)),
    ))
}

fn selection_policy(ranking: &config::RankingSettings) -> SelectionPolicy {
    SelectionPolicy {
        recency_window_hours: i64::from(ranking.recency_window_hours.get()),
        caps: BucketCaps {
            recent: i64::from(ranking.recent_bucket_cap.get()),
            per_counter: i64::from(ranking.counter_bucket_cap.get()),
            replies: i64::from(ranking.reply_bucket_cap.get()),
        },
        tiers: vec![
            SelectionTier {
                lookback_days: i64::from(ranking.primary_lookback_days.get()),
                top_level_only: true,
            },
            SelectionTier {
                lookback_days: i64::from(ranking.widened_lookback_days.get()),
                top_level_only: true,
            },
            SelectionTier {
                lookback_days: i64::from(ranking.widened_lookback_days.get()),
                top_level_only: false,
            },
        ],
    }
}

fn build_application_context(
    http_repositories: Arc<PostgresRepositories>,
    job_repositories: Arc<PostgresRepositories>,
    settings: &config::Settings,
) -> ApplicationContext {
    let ranking = &settings.ranking;

    let http_posts: Arc<dyn PostsRepo> = http_repositories.clone();
    let http_engagement: Arc<dyn EngagementRepo> = http_repositories.clone();
    let http_trending: Arc<dyn TrendingRepo> = http_repositories.clone();

    let rank_service = Arc::new(FeedRankService::new(
        CandidateSelector::new(http_posts.clone(), selection_policy(ranking)),
        ScoreCacheService::new(http_engagement.clone(), ranking.score_cache_ttl),
        http_posts,
        http_trending,
    ));
    let score_cache = Arc::new(ScoreCacheService::new(
        http_engagement,
        ranking.score_cache_ttl,
    ));

    // The batch runs on the jobs pool; the HTTP trigger shares the same
    // service instance so both paths contend on one lock.
    let job_posts: Arc<dyn PostsRepo> = job_repositories.clone();
    let job_engagement: Arc<dyn EngagementRepo> = job_repositories.clone();
    let job_trending: Arc<dyn TrendingRepo> = job_repositories.clone();
    let batch_lock: Arc<dyn BatchLock> = if ranking.trending_advisory_lock {
        Arc::new(PgAdvisoryBatchLock::new(job_repositories.pool().clone()))
    } else {
        Arc::new(ProcessBatchLock::default())
    };
    let batch = Arc::new(TrendingBatchService::new(
        CandidateSelector::new(job_posts.clone(), selection_policy(ranking)),
        ScoreCacheService::new(job_engagement.clone(), ranking.score_cache_ttl),
        job_posts,
        job_engagement,
        job_trending,
        batch_lock,
        BatchPolicy {
            max_rows: ranking.trending_max_rows.get() as usize,
            retention: ranking.trending_retention,
            warm_cap: i64::from(ranking.trending_warm_cap.get()),
            interval: ranking.trending_interval,
        },
    ));

    let http_state = HttpState {
        rank: rank_service,
        score_cache,
        batch: batch.clone(),
        db: http_repositories,
    };

    let job_context = JobWorkerContext {
        batch: batch.clone(),
    };

    ApplicationContext {
        http_state,
        job_context,
        batch,
    }
}

fn spawn_job_monitor(
    context: JobWorkerContext,
    ranking: &config::RankingSettings,
) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let schedule = trending_batch_schedule(&ranking.trending_cron)
        .map_err(|err| AppError::unexpected(format!("invalid trending cron: {err}")))?;

    let trending_worker = WorkerBuilder::new("trending-batch-worker")
        .enable_tracing()
        .data(context)
        .backend(CronStream::new(schedule))
        .build_fn(process_trending_batch_job);

    let monitor = Monitor::new().register(trending_worker);

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    }))
}

async fn serve_http(settings: &config::Settings, http_state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(http_state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(addr = %settings.server.addr, "Serving ranked feeds");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}
