/*!
common/src/lib.rs

Shared configuration types for research-monitor.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an optional override file
- Validation of the values the filtering core depends on
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_REQUEST_DELAY_SECONDS: f64 = 1.5;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_RETRY_DELAY_SECONDS: f64 = 2.0;
pub const DEFAULT_RELEVANCE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_MAX_ITEMS_PER_SOURCE: usize = 30;

/// LLM endpoint used by the relevance judge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "anthropic", "openai"
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Throughput limits imposed on judge calls
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of judge calls in flight at once
    pub concurrency: Option<usize>,
    /// Minimum spacing between two call starts, in seconds
    pub request_delay_seconds: Option<f64>,
    /// Retries allowed after a rate-limited attempt
    pub max_retries: Option<u32>,
    /// Base of the exponential backoff, in seconds
    pub initial_retry_delay_seconds: Option<f64>,
    /// Optional ceiling on a single attempt
    pub call_timeout_seconds: Option<u64>,
}

impl RateLimitConfig {
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    pub fn request_delay(&self) -> Duration {
        seconds_or_default(self.request_delay_seconds, DEFAULT_REQUEST_DELAY_SECONDS)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        seconds_or_default(self.initial_retry_delay_seconds, DEFAULT_INITIAL_RETRY_DELAY_SECONDS)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_seconds.map(Duration::from_secs)
    }
}

/// Out-of-range values fall back to the default; `Config::validate` reports them.
fn seconds_or_default(value: Option<f64>, default: f64) -> Duration {
    value
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_else(|| Duration::from_secs_f64(default))
}

/// What to judge and how strictly
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub relevance_threshold: Option<f64>,
    pub max_items_per_source: Option<usize>,
    /// Inline interest profile
    pub interests: Option<String>,
    /// Interest profile read from a file (takes precedence over `interests`)
    pub interests_file: Option<String>,
}

impl MonitoringConfig {
    pub fn relevance_threshold(&self) -> f64 {
        self.relevance_threshold
            .unwrap_or(DEFAULT_RELEVANCE_THRESHOLD)
    }

    pub fn max_items_per_source(&self) -> usize {
        self.max_items_per_source
            .unwrap_or(DEFAULT_MAX_ITEMS_PER_SOURCE)
    }

    /// Resolve the interest profile text, reading `interests_file` if set.
    pub async fn load_interests(&self) -> Result<String> {
        if let Some(path) = &self.interests_file {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read interests file: {}", path))?;
            return Ok(text.trim().to_string());
        }
        match &self.interests {
            Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            _ => bail!("No interest profile configured (set monitoring.interests or monitoring.interests_file)"),
        }
    }
}

/// GitHub repository search
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubSourceConfig {
    pub enabled: Option<bool>,
    pub api_url: Option<String>,
    /// Name of the env var holding a GitHub token (optional, raises API limits)
    pub token_env: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub min_stars: Option<u32>,
    pub max_items: Option<usize>,
}

/// Hugging Face daily papers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HfPapersSourceConfig {
    pub enabled: Option<bool>,
    pub api_url: Option<String>,
    pub filter_by_keywords: Option<bool>,
    pub max_items: Option<usize>,
}

/// Hugging Face trending models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HfTrendingSourceConfig {
    pub enabled: Option<bool>,
    pub api_url: Option<String>,
    pub pipeline_tag: Option<String>,
    pub max_days_old: Option<i64>,
    pub max_items: Option<usize>,
}

/// Source section; each source is enabled unless `enabled = false`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Keywords shared by sources that pre-filter locally
    #[serde(default)]
    pub keywords: Vec<String>,
    pub github: Option<GithubSourceConfig>,
    pub hf_papers: Option<HfPapersSourceConfig>,
    pub hf_trending: Option<HfTrendingSourceConfig>,
}

/// Output locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub output_dir: Option<String>,
    pub debug_dir: Option<String>,
    pub artifacts_dir: Option<String>,
}

impl PathsConfig {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(self.output_dir.as_deref().unwrap_or("digests"))
    }

    pub fn debug_dir(&self) -> PathBuf {
        PathBuf::from(self.debug_dir.as_deref().unwrap_or("debug"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        PathBuf::from(self.artifacts_dir.as_deref().unwrap_or("artifacts"))
    }
}

/// Prompt overrides for the relevance judge and the digest enrichment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    pub relevance_system: Option<String>,
    /// Template with `{interests}`, `{title}`, `{source}`, `{url}`, `{summary}` placeholders
    pub relevance_user: Option<String>,
    pub enrich_system: Option<String>,
    /// Template with `{title}`, `{source}`, `{url}`, `{summary}` placeholders
    pub enrich_user: Option<String>,
}

/// Digest rendering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestConfig {
    pub title: Option<String>,
    /// Ask the LLM for a summary and highlights of every kept item
    pub enrich: Option<bool>,
    pub max_highlights: Option<usize>,
}

impl DigestConfig {
    pub fn enrich(&self) -> bool {
        self.enrich.unwrap_or(true)
    }

    pub fn max_highlights(&self) -> usize {
        self.max_highlights.unwrap_or(5)
    }
}

/// Slack incoming webhook
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    pub enabled: Option<bool>,
    /// Name of the env var holding the webhook URL
    pub webhook_url_env: Option<String>,
    /// Entries listed in the message
    pub max_entries: Option<usize>,
}

impl SlackConfig {
    pub fn webhook_url_env(&self) -> &str {
        self.webhook_url_env.as_deref().unwrap_or("SLACK_WEBHOOK_URL")
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.unwrap_or(10)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub slack: Option<SlackConfig>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub monitoring: MonitoringConfig,
    pub sources: SourcesConfig,
    pub paths: PathsConfig,
    pub prompts: PromptsConfig,
    pub digest: DigestConfig,
    pub notifications: NotificationsConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Reject values the filtering core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.concurrency() == 0 {
            bail!("rate_limit.concurrency must be at least 1");
        }
        for (name, secs) in [
            ("rate_limit.request_delay_seconds", self.rate_limit.request_delay_seconds),
            ("rate_limit.initial_retry_delay_seconds", self.rate_limit.initial_retry_delay_seconds),
        ] {
            if let Some(v) = secs {
                if !v.is_finite() || v < 0.0 {
                    bail!("{} must be a non-negative number, got {}", name, v);
                }
                if Duration::try_from_secs_f64(v).is_err() {
                    bail!("{} is too large, got {}", name, v);
                }
            }
        }
        let threshold = self.monitoring.relevance_threshold();
        if !(0.0..=1.0).contains(&threshold) {
            bail!("monitoring.relevance_threshold must be within [0, 1], got {}", threshold);
        }
        if let Some(api_url) = &self.llm.api_url {
            url::Url::parse(api_url).with_context(|| format!("Invalid llm.api_url: {}", api_url))?;
        }
        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}
