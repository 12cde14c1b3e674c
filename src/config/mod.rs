//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::Window;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "storefront-query";
const ENV_PREFIX: &str = "STOREFRONT_QUERY";
const DEFAULT_STALE_TIME_MS: u64 = 0;
const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_RETRY_COUNT: u32 = 0;
const INFINITE_WINDOW: &str = "infinite";

/// Command-line arguments for the storefront-query binary.
#[derive(Debug, Parser)]
#[command(
    name = "storefront-query",
    version,
    about = "Storefront query cache diagnostics"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "STOREFRONT_QUERY_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Load a catalog snapshot into a query cache and print every entry.
    Inspect(Box<InspectArgs>),
    /// Print the resolved settings.
    Config(ConfigArgs),
}

#[derive(Debug, Args, Clone)]
pub struct InspectArgs {
    #[command(flatten)]
    pub overrides: QueryOverrides,

    /// JSON catalog snapshot to load.
    #[arg(long, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub snapshot: PathBuf,

    /// Invalidate keys matching this JSON array prefix after loading; repeatable.
    #[arg(long = "invalidate", value_name = "KEY_JSON")]
    pub invalidate: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub overrides: QueryOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct QueryOverrides {
    /// Override the default stale window in milliseconds, or `infinite`.
    #[arg(long = "stale-time-ms", value_name = "MS")]
    pub stale_time_ms: Option<String>,

    /// Override the default garbage-collection window in milliseconds, or `infinite`.
    #[arg(long = "gc-time-ms", value_name = "MS")]
    pub gc_time_ms: Option<String>,

    /// Override the default retry count.
    #[arg(long = "retry-count", value_name = "COUNT")]
    pub retry_count: Option<u32>,

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
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub query: QuerySettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Global query defaults handed to [`crate::cache::CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    pub stale_time: Window,
    pub gc_time: Window,
    pub retry_count: u32,
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Inspect(args)) => raw.apply_query_overrides(&args.overrides),
        Some(Command::Config(args)) => raw.apply_query_overrides(&args.overrides),
        None => raw.apply_query_overrides(&QueryOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    query: RawQuerySettings,
}

impl RawSettings {
    fn apply_query_overrides(&mut self, overrides: &QueryOverrides) {
        if let Some(stale) = overrides.stale_time_ms.as_ref() {
            self.query.stale_time_ms = Some(RawWindow::Named(stale.clone()));
        }
        if let Some(gc) = overrides.gc_time_ms.as_ref() {
            self.query.gc_time_ms = Some(RawWindow::Named(gc.clone()));
        }
        if let Some(retry_count) = overrides.retry_count {
            self.query.retry_count = Some(retry_count);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, query } = raw;

        let logging = build_logging_settings(logging)?;
        let query = build_query_settings(query)?;

        Ok(Self { logging, query })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let stale_time = match query.stale_time_ms {
        Some(raw) => parse_window(raw, "query.stale_time_ms")?,
        None => Window::from_millis(DEFAULT_STALE_TIME_MS),
    };
    let gc_time = match query.gc_time_ms {
        Some(raw) => parse_window(raw, "query.gc_time_ms")?,
        None => Window::from_millis(DEFAULT_GC_TIME_MS),
    };

    Ok(QuerySettings {
        stale_time,
        gc_time,
        retry_count: query.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
    })
}

/// Windows are milliseconds or the literal `infinite`. Environment and CLI
/// values arrive as strings, so numeric strings are accepted as well.
fn parse_window(raw: RawWindow, key: &'static str) -> Result<Window, LoadError> {
    match raw {
        RawWindow::Millis(ms) => Ok(Window::from_millis(ms)),
        RawWindow::Named(value) => {
            let value = value.trim();
            if value.eq_ignore_ascii_case(INFINITE_WINDOW) {
                return Ok(Window::Infinite);
            }
            value.parse::<u64>().map(Window::from_millis).map_err(|_| {
                LoadError::invalid(
                    key,
                    format!("expected milliseconds or \"{INFINITE_WINDOW}\", got `{value}`"),
                )
            })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    stale_time_ms: Option<RawWindow>,
    gc_time_ms: Option<RawWindow>,
    retry_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawWindow {
    Millis(u64),
    Named(String),
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
