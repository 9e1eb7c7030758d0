use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::jobs::queue::Backoff;
use crate::jobs::rate_limiter::WINDOW;
use crate::jobs::JobSystemConfig;
use crate::llm_client::openai::DEFAULT_OPENAI_MODEL;
use crate::llm_client::DEFAULT_ANTHROPIC_MODEL;

const DEFAULT_RATE_LIMIT: NonZeroU32 = match NonZeroU32::new(60) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" | "chatgpt" => Ok(ProviderKind::OpenAi),
            other => bail!("GENERATION_PROVIDER must be 'anthropic' or 'openai', got '{other}'"),
        }
    }
}

impl ProviderKind {
    fn api_key_var(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            ProviderKind::OpenAi => DEFAULT_OPENAI_MODEL,
        }
    }
}

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Clone)]
pub struct Config {
    /// `redis://...` for the durable store, or `memory://` for a throwaway local store.
    pub redis_url: String,
    pub provider: ProviderKind,
    pub provider_api_key: String,
    pub model: String,
    pub rate_limit_per_minute: NonZeroU32,
    pub max_attempts: u32,
    pub worker_concurrency: usize,
    pub provider_timeout: Duration,
    pub retry_backoff: Duration,
    pub job_retention: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("max_attempts", &self.max_attempts)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("provider_timeout", &self.provider_timeout)
            .field("retry_backoff", &self.retry_backoff)
            .field("job_retention", &self.job_retention)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("GENERATION_PROVIDER") {
            Some(raw) => raw.parse()?,
            None => ProviderKind::Anthropic,
        };

        let max_attempts: u32 = parse_or(&get, "MESSAGE_WORKER_RETRIES", 3)?;
        if max_attempts == 0 {
            bail!("MESSAGE_WORKER_RETRIES must be at least 1");
        }

        let worker_concurrency: usize = parse_or(&get, "WORKER_CONCURRENCY", 1)?;
        if worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }

        let provider_timeout = Duration::from_secs(parse_or(&get, "PROVIDER_TIMEOUT_SECS", 60)?);
        if provider_timeout.is_zero() {
            bail!("PROVIDER_TIMEOUT_SECS must be at least 1");
        }

        let retry_backoff = Duration::from_millis(parse_or(&get, "RETRY_BACKOFF_MS", 1000)?);
        if retry_backoff.is_zero() {
            bail!("RETRY_BACKOFF_MS must be at least 1");
        }

        // A pending record is rewritten at least once per backoff plus one attempt.
        let job_retention = Duration::from_secs(parse_or(&get, "JOB_RETENTION_SECS", 86_400)?);
        let min_retention = Backoff::DEFAULT_MAX + WINDOW + provider_timeout;
        if job_retention <= min_retention {
            bail!(
                "JOB_RETENTION_SECS must be greater than {}s (max retry backoff, rate-limit window and provider timeout)",
                min_retention.as_secs()
            );
        }

        Ok(Config {
            redis_url: require(&get, "REDIS_URL")?,
            provider,
            provider_api_key: require(&get, provider.api_key_var())?,
            model: get("GENERATION_MODEL").unwrap_or_else(|| provider.default_model().to_string()),
            rate_limit_per_minute: get("RATE_LIMIT_PER_MINUTE")
                .map(|v| v.trim().parse::<NonZeroU32>())
                .transpose()
                .context("RATE_LIMIT_PER_MINUTE must be a positive integer")?
                .unwrap_or(DEFAULT_RATE_LIMIT),
            max_attempts,
            worker_concurrency,
            provider_timeout,
            retry_backoff,
            job_retention,
            port: parse_or(&get, "PORT", 8080)?,
            rust_log: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn job_system(&self) -> JobSystemConfig {
        JobSystemConfig {
            workers: self.worker_concurrency,
            rate_limit_per_minute: self.rate_limit_per_minute,
            max_attempts: self.max_attempts,
            provider_timeout: self.provider_timeout,
            retry_backoff: self.retry_backoff,
        }
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url.starts_with("memory://")
    }
}

fn require(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    get(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}
