//! Configuration loader and validator for the collector.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::significance::SignificanceRule;

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub youtube: Youtube,
    pub run: RunConfig,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Top-level identifiers collected concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

/// YouTube Data API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Youtube {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Per-run knobs handed to `start_or_resume_run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub budget_ceiling: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_page: u32,
    #[serde(default = "default_true")]
    pub child_fetch_enabled: bool,
    #[serde(default = "default_true")]
    pub grandchild_fetch_enabled: bool,
    #[serde(default)]
    pub significance_rules: Vec<SignificanceRule>,
    /// Field path patterns whose lists compare as multisets.
    #[serde(default)]
    pub order_insensitive_fields: Vec<String>,
    #[serde(default)]
    pub emit_container_markers: bool,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Applies to each fetch call individually.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}
fn default_base_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_request_timeout_ms() -> u64 {
    15_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget_ceiling: 10_000,
            max_retries_per_page: default_max_retries(),
            child_fetch_enabled: true,
            grandchild_fetch_enabled: true,
            significance_rules: Vec::new(),
            order_insensitive_fields: Vec::new(),
            emit_container_markers: false,
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl RunConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries_per_page,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.resolved_data_dir())
    }

    /// `app.data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match self.app.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.app.data_dir.clone(),
            },
            None => self.app.data_dir.clone(),
        }
    }

    /// `DATABASE_URL` when set, else the SQLite file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/yt-watch.db", self.resolved_data_dir()))
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
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }

    if cfg.youtube.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.api_key must be non-empty"));
    }
    if let Some(base) = &cfg.youtube.base_url {
        if !base.ends_with('/') {
            return Err(ConfigError::Invalid("youtube.base_url must end with '/'"));
        }
    }

    if cfg.run.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("run.request_timeout_ms must be > 0"));
    }
    if cfg.run.max_backoff_ms < cfg.run.base_backoff_ms {
        return Err(ConfigError::Invalid(
            "run.max_backoff_ms must be >= run.base_backoff_ms",
        ));
    }
    if cfg.run.significance_rules.iter().any(|r| r.path.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "run.significance_rules[].path must be non-empty",
        ));
    }

    if cfg.channels.iter().any(|c| c.trim().is_empty()) {
        return Err(ConfigError::Invalid("channels[] must be non-empty ids"));
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  workers: 4

youtube:
  api_key: "YOUR_YOUTUBE_DATA_API_KEY"

run:
  budget_ceiling: 2000
  max_retries_per_page: 3
  child_fetch_enabled: true
  grandchild_fetch_enabled: false
  base_backoff_ms: 1000
  max_backoff_ms: 60000
  request_timeout_ms: 15000
  order_insensitive_fields:
    - "snippet.tags"
  significance_rules:
    # ownership-indicating fields
    - path: "snippet.customUrl"
      entity: channel
      kinds: [modified, removed]
      tier: critical
    - path: "snippet.title"
      tier: significant
    - path: "statistics.*"
      kinds: [modified]
      when: { op: percent_change_over, value: 30 }
      tier: significant
    - path: "statistics.subscriberCount"
      when: { op: crosses, value: 100000 }
      tier: significant
    - path: "textDisplay"
      entity: comment
      when: { op: matches, value: "(?i)giveaway|free crypto" }
      tier: critical

channels:
  - "UC_x5XG1OV2P6uZZ5FSM9Ttw"
"#
}
