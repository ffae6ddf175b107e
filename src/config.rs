//! YAML configuration.
//!
//! A single [`AppConfig`] is loaded at start-up and passed by reference to
//! every component that needs it. Every section is optional; missing keys
//! fall back to the defaults below.
//!
//! ```yaml
//! llm:
//!   base_url: https://api.openai.com/v1
//!   model: gpt-4o-mini
//!   timeout_secs: 120
//! rate_limit:
//!   policy: refill_bucket
//!   tokens_per_minute: 90000
//!   requests_per_minute: 500
//! batch:
//!   size: 20
//!   cooldown_secs: 1
//! retry:
//!   max_attempts: 5
//!   backoff_secs: 10
//! store:
//!   path: ./data/store.json
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Usually supplied through `OPENAI_API_KEY` instead.
    pub api_key: Option<String>,
    /// Deadline for a single completion call.
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 120,
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which budget strategy backs the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicyKind {
    #[default]
    RefillBucket,
    RollingWindow,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub policy: BudgetPolicyKind,
    pub tokens_per_minute: u64,
    pub requests_per_minute: Option<u64>,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            policy: BudgetPolicyKind::RefillBucket,
            tokens_per_minute: 90_000,
            requests_per_minute: None,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
    pub cooldown_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 20,
            cooldown_secs: 1,
        }
    }
}

impl BatchConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Attempt `n` sleeps `n * backoff_secs` before retrying.
    pub backoff_secs: u64,
    /// Upper bound for random jitter added to each backoff.
    pub jitter_ms: u64,
    /// Also retry timeouts, network failures and 5xx responses.
    pub retry_transient: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_secs: 10,
            jitter_ms: 0,
            retry_transient: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
    /// Commit threshold for batched writes. Must stay under the provider's
    /// hard limit of 500 operations.
    pub write_batch_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "./data/store.json".to_string(),
            write_batch_limit: 400,
        }
    }
}

impl AppConfig {
    /// Reject settings that would stall or overflow the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(e) = url::Url::parse(&self.llm.base_url) {
            return Err(ConfigError::Invalid(format!(
                "llm.base_url {:?} is not a valid URL: {e}",
                self.llm.base_url
            )));
        }
        if self.rate_limit.tokens_per_minute < 2 {
            return Err(ConfigError::Invalid(
                "rate_limit.tokens_per_minute must be at least 2".to_string(),
            ));
        }
        if self.rate_limit.requests_per_minute == Some(0) {
            return Err(ConfigError::Invalid(
                "rate_limit.requests_per_minute must be positive".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be positive".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be positive".to_string()));
        }
        if self.store.write_batch_limit == 0 || self.store.write_batch_limit > crate::store::MAX_BATCH_OPS {
            return Err(ConfigError::Invalid(format!(
                "store.write_batch_limit must be between 1 and {}",
                crate::store::MAX_BATCH_OPS
            )));
        }
        Ok(())
    }
}

/// Load and validate a YAML config file.
#[instrument(level = "info")]
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let config = parse_config(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })?;
    config.validate()?;
    info!(path, policy = ?config.rate_limit.policy, tpm = config.rate_limit.tokens_per_minute, "Loaded configuration");
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &str) -> Result<AppConfig, ConfigError> {
    if Path::new(path).exists() {
        load_config(path)
    } else {
        info!(path, "No config file found; using defaults");
        Ok(AppConfig::default())
    }
}

fn parse_config(raw: &str) -> Result<AppConfig, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(raw)
}
