use config::{Config, Environment, File};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod calendar;
pub mod commands;
pub mod metrics;
pub mod scheduler;
pub mod sink;
pub mod subscriptions;

#[cfg(test)]
mod testing;

use subscriptions::{ChannelId, SubscriptionRole};

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by all fallible operations within this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("invalid feed URL `{0}`, expected an http, https or webcal URL")]
    InvalidUrl(String),
    #[error("unknown role `{0}`, expected `event_source` or `exclusion_list`")]
    UnknownRole(String),
    #[error("{url} is already registered as {role} for channel {channel}")]
    DuplicateRecord {
        channel: ChannelId,
        url: String,
        role: SubscriptionRole,
    },
    #[error("no destination found for channel {0}")]
    ChannelNotFound(ChannelId),
    #[error("no calendar registered for channel {0}")]
    NoSubscriptions(ChannelId),
    #[error("couldn't parse `{0}` as a day, accepted values: `today`, `tomorrow`, integers")]
    InvalidDay(String),
    #[error("invalid channel id `{0}`")]
    InvalidChannelId(String),
    #[error("subscription store {} is corrupt: {source}", path.display())]
    StoreCorruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deliver digest to channel {channel}: {source}")]
    Sink {
        channel: ChannelId,
        #[source]
        source: reqwest::Error,
    },
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ServerConfig {
    /// Address on which the command server will listen.
    pub listen_addr: SocketAddr,
}

/// Subscription store configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StoreConfig {
    /// Path of the JSON file holding all subscription records.
    pub path: PathBuf,
}

/// Scheduler configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SchedulerConfig {
    /// Whether the daily digest loop runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local time of day at which the digests for the following day are sent.
    #[serde(default = "default_run_at")]
    pub run_at: chrono::NaiveTime,
    /// Reference timezone for day boundaries and displayed times.
    #[serde(default = "default_timezone")]
    pub timezone: chrono_tz::Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            run_at: default_run_at(),
            timezone: default_timezone(),
        }
    }
}

/// Calendar feed configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct FeedsConfig {
    /// Upper bound for a single feed request, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional `User-Agent` header sent with feed requests.
    pub user_agent: Option<String>,
}

impl Default for FeedsConfig {
    fn default() -> Self {
        FeedsConfig {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

/// Global application configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct AppConfig {
    /// Server configuration section.
    pub server: ServerConfig,
    /// Subscription store section.
    pub store: StoreConfig,
    /// Scheduler section.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Feed fetching section.
    #[serde(default)]
    pub feeds: FeedsConfig,
    /// Mapping of channel id to the webhook URL digests are posted to.
    #[serde(default)]
    pub destinations: IndexMap<String, String>,
}

impl AppConfig {
    /// Loads the application configuration from files in `dir` and environment variables.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<AppConfig> {
        let dir = dir.as_ref();
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".into());

        log::info!(
            "loading configuration from {} using {} environment",
            dir.display(),
            app_env
        );

        let config = Config::builder()
            // Configuration defaults from `default.toml`.
            .add_source(File::from(dir.join("default")))
            // Optional environment specific config overrides, e.g. `production.toml`.
            .add_source(File::from(dir.join(&app_env)).required(false))
            // Optional local config overrides from `local.toml` (on .gitignore).
            .add_source(File::from(dir.join("local")).required(false))
            // Config from environment variables.
            .add_source(Environment::default().separator("__"))
            // Config from environment variables prefixed with `AGENDA_`.
            .add_source(
                Environment::with_prefix("AGENDA")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        log::debug!("loaded configuration: {:?}", config);

        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_run_at() -> chrono::NaiveTime {
    chrono::NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default()
}

fn default_timezone() -> chrono_tz::Tz {
    chrono_tz::CET
}

fn default_timeout_secs() -> u64 {
    10
}
