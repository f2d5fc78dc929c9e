//! Configuration loader and validator for the events/scrobbles sync service.
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::fetch::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub kudago: Kudago,
    pub lastfm: Lastfm,
    pub telegram: Telegram,
}

/// App-level settings: storage location, schedules and cache lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_events_interval")]
    pub events_interval_secs: u64,
    #[serde(default = "default_scrobbles_interval")]
    pub scrobbles_interval_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

/// Shared HTTP behaviour for every provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Http {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_retry_rounds")]
    pub retry_rounds: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Events catalog provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Kudago {
    /// Must contain `{page}` and `{since}`.
    #[serde(default = "default_events_url")]
    pub events_url: String,
    /// Must contain `{id}`.
    #[serde(default = "default_place_url")]
    pub place_url: String,
    #[serde(default = "default_place_concurrency")]
    pub place_concurrency: usize,
}

/// Listening-history and interest-source provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lastfm {
    #[serde(default = "default_lastfm_url")]
    pub base_url: String,
    pub username: String,
    pub api_key: String,
    #[serde(default = "default_top_artists_limit")]
    pub top_artists_limit: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_lastfm_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// Telegram notifier settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub chat_id: i64,
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
}

fn default_events_interval() -> u64 {
    3600
}

fn default_scrobbles_interval() -> u64 {
    18000
}

fn default_cache_ttl() -> u64 {
    604800
}

fn default_timeout() -> u64 {
    20
}

fn default_user_agent() -> String {
    "gigwatch/0.1".to_string()
}

fn default_retry_rounds() -> usize {
    5
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_events_url() -> String {
    "https://kudago.com/public-api/v1.4/events/?lang=&page={page}&page_size=100&fields=id,dates,title,place,slug,price&location=msk&actual_since={since}&categories=concert".to_string()
}

fn default_place_url() -> String {
    "https://kudago.com/public-api/v1.4/places/{id}/?lang=&fields=id,title,address&location=msk"
        .to_string()
}

fn default_place_concurrency() -> usize {
    6
}

fn default_lastfm_url() -> String {
    "http://ws.audioscrobbler.com/2.0/".to_string()
}

fn default_top_artists_limit() -> u32 {
    300
}

fn default_page_size() -> u32 {
    200
}

fn default_lastfm_concurrency() -> usize {
    5
}

fn default_utc_offset() -> i32 {
    180
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            retry_rounds: default_retry_rounds(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for Kudago {
    fn default() -> Self {
        Self {
            events_url: default_events_url(),
            place_url: default_place_url(),
            place_concurrency: default_place_concurrency(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default SQLite URL under `app.data_dir`; `DATABASE_URL` wins when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/gigwatch.db", self.app.data_dir))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            rounds: self.http.retry_rounds,
            delay: Duration::from_millis(self.http.retry_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    /// Offset used to render event times in notifications.
    pub fn utc_offset(&self) -> FixedOffset {
        self.telegram
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or(Utc.fix())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.app.cache_ttl_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.events_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.events_interval_secs must be > 0"));
    }
    if cfg.app.scrobbles_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.scrobbles_interval_secs must be > 0"));
    }

    if cfg.http.timeout_secs == 0 {
        return Err(ConfigError::Invalid("http.timeout_secs must be > 0"));
    }

    let k = &cfg.kudago;
    if !k.events_url.contains("{page}") || !k.events_url.contains("{since}") {
        return Err(ConfigError::Invalid(
            "kudago.events_url must contain {page} and {since}",
        ));
    }
    if !k.place_url.contains("{id}") {
        return Err(ConfigError::Invalid("kudago.place_url must contain {id}"));
    }
    if k.place_concurrency == 0 {
        return Err(ConfigError::Invalid("kudago.place_concurrency must be > 0"));
    }

    let l = &cfg.lastfm;
    if l.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("lastfm.base_url must be non-empty"));
    }
    if l.username.trim().is_empty() {
        return Err(ConfigError::Invalid("lastfm.username must be non-empty"));
    }
    if l.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("lastfm.api_key must be non-empty"));
    }
    if l.page_size == 0 || l.top_artists_limit == 0 {
        return Err(ConfigError::Invalid(
            "lastfm.page_size and lastfm.top_artists_limit must be > 0",
        ));
    }
    if l.concurrency == 0 {
        return Err(ConfigError::Invalid("lastfm.concurrency must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    if cfg.telegram.utc_offset_minutes.unsigned_abs() >= 24 * 60 {
        return Err(ConfigError::Invalid(
            "telegram.utc_offset_minutes must be within one day",
        ));
    }

    Ok(())
}

/// Returns an example YAML document that passes validation.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  events_interval_secs: 3600
  scrobbles_interval_secs: 18000
  cache_ttl_secs: 604800

http:
  timeout_secs: 20
  user_agent: "gigwatch/0.1"
  retry_rounds: 5
  retry_delay_ms: 1000

kudago:
  place_concurrency: 6

lastfm:
  username: "YOUR_LASTFM_USER"
  api_key: "YOUR_LASTFM_API_KEY"
  top_artists_limit: 300
  page_size: 200
  concurrency: 5

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  chat_id: 123456789
  utc_offset_minutes: 180
"#
}
