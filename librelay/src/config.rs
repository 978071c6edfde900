//! Configuration management for the relay job

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::rate_limit::{RateLimitPolicy, RetryPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub post: PostConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Ordered rotation pool of source handles (no leading @)
    pub pool: Vec<String>,
    /// Posts requested from the source per run
    pub max_posts: u32,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            pool: Vec::new(),
            max_posts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostConfig {
    /// First line of the relayed post; `{orig}` is replaced by the source handle
    pub prefix: String,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            prefix: "Repost (via @{orig})".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub policy: RateLimitPolicy,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_cap_secs: u64,
    pub reset_margin_secs: u64,
    pub max_reset_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::Backoff,
            max_retries: 4,
            backoff_base: 2.0,
            backoff_cap_secs: 300,
            reset_margin_secs: 2,
            max_reset_wait_secs: 900,
        }
    }
}

impl RateLimitConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            on_rate_limit: self.policy,
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            reset_margin: Duration::from_secs(self.reset_margin_secs),
            max_reset_wait: Duration::from_secs(self.max_reset_wait_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub history_path: String,
    pub cursor_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            history_path: "posted_history.json".to_string(),
            cursor_path: "since_ids.json".to_string(),
        }
    }
}

impl StateConfig {
    pub fn history_file(&self) -> PathBuf {
        expand_path(&self.history_path)
    }

    pub fn cursor_file(&self) -> PathBuf {
        expand_path(&self.cursor_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout for API calls and downloads
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound of the random delay before a run starts
    pub startup_jitter_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            startup_jitter_secs: 8,
        }
    }
}

impl Config {
    /// Load configuration from the default location, then apply env overrides
    ///
    /// A missing file is not an error: the defaults are used.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Apply the environment variables the job has always honored
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var("SOURCE_USERNAMES") {
            self.sources.pool = parse_pool(&raw);
        }

        if let Ok(raw) = std::env::var("MAX_TWEETS_TO_FETCH") {
            self.sources.max_posts = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                field: "MAX_TWEETS_TO_FETCH".to_string(),
                reason: format!("{}", e),
            })?;
        }

        if let Ok(prefix) = std::env::var("TWEET_PREFIX") {
            self.post.prefix = prefix;
        }

        if let Ok(path) = std::env::var("HISTORY_FILE") {
            self.state.history_path = path;
        }

        if let Ok(path) = std::env::var("SINCE_FILE") {
            self.state.cursor_path = path;
        }

        if let Ok(raw) = std::env::var("RELAY_RATE_LIMIT_POLICY") {
            self.rate_limit.policy = raw.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "RELAY_RATE_LIMIT_POLICY".to_string(),
                reason,
            })?;
        }

        Ok(())
    }

    /// Reject values the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sources.max_posts == 0 {
            return Err(invalid("sources.max_posts", "must be at least 1"));
        }

        if self.rate_limit.backoff_base < 1.0 {
            return Err(invalid("rate_limit.backoff_base", "must be >= 1.0"));
        }

        if self.post.prefix.trim().is_empty() {
            return Err(invalid("post.prefix", "cannot be empty"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::RelayError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Split a comma-separated handle list, dropping blanks and leading @
pub fn parse_pool(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('@'))
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path (`$RELAY_CONFIG` or the XDG config dir)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("RELAY_CONFIG") {
        return Ok(expand_path(&path));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("relay").join("config.toml"))
}
