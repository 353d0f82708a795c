use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "corrente_score_cache_hit_total",
            Unit::Count,
            "Engagement score cache entries served while still fresh."
        );
        describe_counter!(
            "corrente_score_cache_miss_total",
            Unit::Count,
            "Engagement score cache entries found stale or never computed."
        );
        describe_counter!(
            "corrente_score_cache_refresh_total",
            Unit::Count,
            "Engagement scores recomputed and written back."
        );
        describe_counter!(
            "corrente_score_cache_invalidate_total",
            Unit::Count,
            "Engagement score cache pairs nulled by write paths."
        );
        describe_histogram!(
            "corrente_trending_batch_ms",
            Unit::Milliseconds,
            "Trending batch duration in milliseconds."
        );
        describe_gauge!(
            "corrente_trending_rows",
            Unit::Count,
            "Rows in the most recently committed trending generation."
        );
    });
}
