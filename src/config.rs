use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::worker::{RateLimit, WorkerOptions};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Process configuration, read once at startup.
///
/// The queue URL and the shared secret are required: the relay refuses to
/// start without a queue or without authentication rather than degrade.
#[derive(Clone)]
pub struct RelayConfig {
    /// Queue store connection URL (`RELAY_REDIS_URL`, falling back to
    /// `REDIS_URL`)
    pub redis_url: String,

    /// Downstream processing service base URL
    pub downstream_url: String,

    /// Bearer credential for the downstream service
    pub shared_secret: String,

    /// Queue to claim from
    pub queue_name: String,

    /// Maximum jobs in flight
    pub concurrency: usize,

    /// Rate limit: jobs per window
    pub rate_limit_max: usize,

    /// Rate limit window
    pub rate_limit_duration: Duration,

    /// Per-request downstream timeout
    pub request_timeout: Duration,

    /// Drain bound on shutdown
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let redis_url = require_one_of(&lookup, &["RELAY_REDIS_URL", "REDIS_URL"])?;
        let shared_secret = require(&lookup, "SHARED_SECRET")?;

        let downstream_url = lookup("DOWNSTREAM_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "http://localhost:8000".to_string());
        let queue_name = lookup("QUEUE_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "ai-tasks".to_string());

        Ok(Self {
            redis_url,
            downstream_url,
            shared_secret,
            queue_name,
            concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 5)?,
            rate_limit_max: parse_or(&lookup, "RATE_LIMIT_MAX", 10)?,
            rate_limit_duration: Duration::from_millis(parse_or(
                &lookup,
                "RATE_LIMIT_DURATION_MS",
                1000,
            )?),
            request_timeout: Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECS", 30)?),
        })
    }

    /// Worker options derived from this configuration
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency,
            limiter: Some(RateLimit {
                max: self.rate_limit_max,
                duration: self.rate_limit_duration,
            }),
            shutdown_grace: self.shutdown_grace,
            ..WorkerOptions::default()
        }
    }
}

// The bearer credential must never leak through logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("redis_url", &self.redis_url)
            .field("downstream_url", &self.downstream_url)
            .field("shared_secret", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .field("concurrency", &self.concurrency)
            .field("rate_limit_max", &self.rate_limit_max)
            .field("rate_limit_duration", &self.rate_limit_duration)
            .field("request_timeout", &self.request_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

fn require(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    lookup(var)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn require_one_of(
    lookup: &impl Fn(&str) -> Option<String>,
    vars: &[&'static str],
) -> Result<String, ConfigError> {
    vars.iter()
        .find_map(|var| lookup(var).filter(|value| !value.is_empty()))
        .ok_or(ConfigError::Missing(vars[vars.len() - 1]))
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}
