//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "corrente";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_HTTP_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_JOBS_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_SCORE_CACHE_TTL_SECS: u64 = 600;
const DEFAULT_TRENDING_CRON: &str = "0 */10 * * * *";
const DEFAULT_TRENDING_INTERVAL_SECS: u64 = 600;
const DEFAULT_TRENDING_RETENTION_SECS: u64 = 3600;
const DEFAULT_TRENDING_MAX_ROWS: u32 = 15_000;
const DEFAULT_TRENDING_WARM_CAP: u32 = 2000;
const DEFAULT_RECENCY_WINDOW_HOURS: u32 = 72;
const DEFAULT_RECENT_BUCKET_CAP: u32 = 8000;
const DEFAULT_COUNTER_BUCKET_CAP: u32 = 1500;
const DEFAULT_REPLY_BUCKET_CAP: u32 = 1200;
const DEFAULT_PRIMARY_LOOKBACK_DAYS: u32 = 30;
const DEFAULT_WIDENED_LOOKBACK_DAYS: u32 = 90;

/// Command-line arguments for the Corrente binary.
#[derive(Debug, Parser)]
#[command(name = "corrente", version, about = "Corrente feed ranking server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CORRENTE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the Corrente HTTP service and the batch worker.
    Serve(Box<ServeArgs>),
    /// Run one trending batch and exit.
    #[command(name = "snapshot")]
    Snapshot(SnapshotArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the HTTP database pool size.
    #[arg(long = "database-http-max-connections", value_name = "COUNT")]
    pub database_http_max_connections: Option<u32>,

    /// Override the jobs database pool size.
    #[arg(long = "database-jobs-max-connections", value_name = "COUNT")]
    pub database_jobs_max_connections: Option<u32>,

    /// Override the trending batch cron expression.
    #[arg(long = "trending-cron", value_name = "CRON")]
    pub trending_cron: Option<String>,

    /// Override the trending batch cadence used by the boot staleness check.
    #[arg(long = "trending-interval-seconds", value_name = "SECONDS")]
    pub trending_interval_seconds: Option<u64>,

    /// Guard the trending batch with a Postgres advisory lock instead of
    /// the in-process flag (required when several instances share one
    /// database).
    #[arg(
        long = "trending-advisory-lock",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub trending_advisory_lock: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub ranking: RankingSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub http_max_connections: NonZeroU32,
    pub jobs_max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RankingSettings {
    pub score_cache_ttl: Duration,
    pub trending_cron: String,
    pub trending_interval: Duration,
    pub trending_retention: Duration,
    pub trending_max_rows: NonZeroU32,
    pub trending_warm_cap: NonZeroU32,
    pub trending_advisory_lock: bool,
    pub recency_window_hours: NonZeroU32,
    pub recent_bucket_cap: NonZeroU32,
    pub counter_bucket_cap: NonZeroU32,
    pub reply_bucket_cap: NonZeroU32,
    pub primary_lookback_days: NonZeroU32,
    pub widened_lookback_days: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse the CLI and load settings with the configured precedence.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CORRENTE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Snapshot(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    ranking: RawRankingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    http_max_connections: Option<u32>,
    jobs_max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRankingSettings {
    score_cache_ttl_seconds: Option<u64>,
    trending_cron: Option<String>,
    trending_interval_seconds: Option<u64>,
    trending_retention_seconds: Option<u64>,
    trending_max_rows: Option<u32>,
    trending_warm_cap: Option<u32>,
    trending_advisory_lock: Option<bool>,
    recency_window_hours: Option<u32>,
    recent_bucket_cap: Option<u32>,
    counter_bucket_cap: Option<u32>,
    reply_bucket_cap: Option<u32>,
    primary_lookback_days: Option<u32>,
    widened_lookback_days: Option<u32>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_http_max_connections {
            self.database.http_max_connections = Some(max);
        }
        if let Some(max) = overrides.database_jobs_max_connections {
            self.database.jobs_max_connections = Some(max);
        }
        if let Some(cron) = overrides.trending_cron.as_ref() {
            self.ranking.trending_cron = Some(cron.clone());
        }
        if let Some(seconds) = overrides.trending_interval_seconds {
            self.ranking.trending_interval_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.trending_advisory_lock {
            self.ranking.trending_advisory_lock = Some(enabled);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            ranking,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            ranking: build_ranking_settings(ranking)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str())
            .map_err(|err| LoadError::invalid("logging.level", format!("failed to parse: {err}")))?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let http_value = database
        .http_max_connections
        .unwrap_or(DEFAULT_DB_HTTP_MAX_CONNECTIONS);
    let jobs_value = database
        .jobs_max_connections
        .unwrap_or(DEFAULT_DB_JOBS_MAX_CONNECTIONS);

    Ok(DatabaseSettings {
        url,
        http_max_connections: non_zero_u32(http_value, "database.http_max_connections")?,
        jobs_max_connections: non_zero_u32(jobs_value, "database.jobs_max_connections")?,
    })
}

fn build_ranking_settings(ranking: RawRankingSettings) -> Result<RankingSettings, LoadError> {
    let ttl_secs = non_zero_u64(
        ranking
            .score_cache_ttl_seconds
            .unwrap_or(DEFAULT_SCORE_CACHE_TTL_SECS),
        "ranking.score_cache_ttl_seconds",
    )?;
    let interval_secs = non_zero_u64(
        ranking
            .trending_interval_seconds
            .unwrap_or(DEFAULT_TRENDING_INTERVAL_SECS),
        "ranking.trending_interval_seconds",
    )?;
    let retention_secs = non_zero_u64(
        ranking
            .trending_retention_seconds
            .unwrap_or(DEFAULT_TRENDING_RETENTION_SECS),
        "ranking.trending_retention_seconds",
    )?;

    let trending_cron = ranking
        .trending_cron
        .unwrap_or_else(|| DEFAULT_TRENDING_CRON.to_string());
    apalis_cron::Schedule::from_str(&trending_cron).map_err(|err| {
        LoadError::invalid("ranking.trending_cron", format!("failed to parse: {err}"))
    })?;

    let primary_lookback_days = non_zero_u32(
        ranking
            .primary_lookback_days
            .unwrap_or(DEFAULT_PRIMARY_LOOKBACK_DAYS),
        "ranking.primary_lookback_days",
    )?;
    let widened_lookback_days = non_zero_u32(
        ranking
            .widened_lookback_days
            .unwrap_or(DEFAULT_WIDENED_LOOKBACK_DAYS),
        "ranking.widened_lookback_days",
    )?;
    if widened_lookback_days < primary_lookback_days {
        return Err(LoadError::invalid(
            "ranking.widened_lookback_days",
            "must not be narrower than the primary lookback",
        ));
    }

    Ok(RankingSettings {
        score_cache_ttl: Duration::from_secs(ttl_secs.get()),
        trending_cron,
        trending_interval: Duration::from_secs(interval_secs.get()),
        trending_retention: Duration::from_secs(retention_secs.get()),
        trending_max_rows: non_zero_u32(
            ranking.trending_max_rows.unwrap_or(DEFAULT_TRENDING_MAX_ROWS),
            "ranking.trending_max_rows",
        )?,
        trending_warm_cap: non_zero_u32(
            ranking.trending_warm_cap.unwrap_or(DEFAULT_TRENDING_WARM_CAP),
            "ranking.trending_warm_cap",
        )?,
        trending_advisory_lock: ranking.trending_advisory_lock.unwrap_or(false),
        recency_window_hours: non_zero_u32(
            ranking
                .recency_window_hours
                .unwrap_or(DEFAULT_RECENCY_WINDOW_HOURS),
            "ranking.recency_window_hours",
        )?,
        recent_bucket_cap: non_zero_u32(
            ranking.recent_bucket_cap.unwrap_or(DEFAULT_RECENT_BUCKET_CAP),
            "ranking.recent_bucket_cap",
        )?,
        counter_bucket_cap: non_zero_u32(
            ranking
                .counter_bucket_cap
                .unwrap_or(DEFAULT_COUNTER_BUCKET_CAP),
            "ranking.counter_bucket_cap",
        )?,
        reply_bucket_cap: non_zero_u32(
            ranking.reply_bucket_cap.unwrap_or(DEFAULT_REPLY_BUCKET_CAP),
            "ranking.reply_bucket_cap",
        )?,
        primary_lookback_days,
        widened_lookback_days,
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    format!("{host}:{port}")
        .parse()
        .map_err(|err| format!("failed to parse `{host}:{port}`: {err}"))
}

fn non_zero_u32(value: u32, key: &'static str) -> Result<NonZeroU32, LoadError> {
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_without_any_sources() {
        let settings = Settings::from_raw(RawSettings::default()).expect("default settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.ranking.score_cache_ttl, Duration::from_secs(600));
        assert_eq!(settings.ranking.trending_interval, Duration::from_secs(600));
        assert_eq!(settings.ranking.trending_retention, Duration::from_secs(3600));
        assert_eq!(settings.ranking.trending_max_rows.get(), 15_000);
        assert!(!settings.ranking.trending_advisory_lock);
        assert_eq!(settings.ranking.trending_cron, DEFAULT_TRENDING_CRON);
    }

    #[test]
    fn serve_overrides_take_precedence() {
        let mut raw = RawSettings::default();
        raw.apply_serve_overrides(&ServeOverrides {
            server_port: Some(8080),
            log_level: Some("debug".to_string()),
            trending_advisory_lock: Some(true),
            ..ServeOverrides::default()
        });

        let settings = Settings::from_raw(raw).expect("settings with overrides");
        assert_eq!(settings.server.addr.port(), 8080);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(settings.ranking.trending_advisory_lock);
    }

    #[test]
    fn malformed_cron_is_rejected() {
        let raw = RawSettings {
            ranking: RawRankingSettings {
                trending_cron: Some("whenever".to_string()),
                ..RawRankingSettings::default()
            },
            ..RawSettings::default()
        };

        assert!(matches!(
            Settings::from_raw(raw),
            Err(LoadError::Invalid { key, .. }) if key == "ranking.trending_cron"
        ));
    }

    #[test]
    fn shrinking_lookback_is_rejected() {
        let raw = RawSettings {
            ranking: RawRankingSettings {
                primary_lookback_days: Some(60),
                widened_lookback_days: Some(30),
                ..RawRankingSettings::default()
            },
            ..RawSettings::default()
        };

        assert!(Settings::from_raw(raw).is_err());
    }
}
