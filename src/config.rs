//! Process-wide configuration.
//!
//! Resolved once at process start from the environment (see Environment Inputs) and
//! handed by reference to every component afterwards. There is no live reload; a
//! SIGHUP-style mechanism is explicitly out of scope.

use std::time::Duration;

use anyhow::{Context, Result};
use getset::{CopyGetters, Getters};
use humantime::parse_duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(anyhow::Error::from(e)).with_context(|| format!("Reading {}", key)),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(v) => parse_duration(&v).with_context(|| format!("Parsing {} as a duration", key)),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(anyhow::Error::from(e)).with_context(|| format!("Reading {}", key)),
    }
}

/// Tunables from Environment Inputs, plus the database/broker connection strings
/// every component needs to start at all.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Configuration {
    #[getset(get = "pub")]
    database_url: String,

    #[getset(get_copy = "pub")]
    max_retries: u32,

    #[getset(get_copy = "pub")]
    visibility_timeout_extract: Duration,

    #[getset(get_copy = "pub")]
    visibility_timeout_transform: Duration,

    #[getset(get_copy = "pub")]
    visibility_timeout_embed: Duration,

    #[getset(get_copy = "pub")]
    orchestrator_tick_interval: Duration,

    #[getset(get_copy = "pub")]
    extract_queue_hwm: usize,

    #[getset(get_copy = "pub")]
    extract_queue_lwm: usize,

    #[getset(get_copy = "pub")]
    default_batch_size: usize,

    #[getset(get_copy = "pub")]
    runaway_threshold: Duration,

    #[getset(get_copy = "pub")]
    transform_queue_backpressure_threshold: usize,

    #[getset(get_copy = "pub")]
    api_bind_addr: std::net::SocketAddr,
}

impl Configuration {
    /// Resolve configuration from the process environment. Fails loudly (non-zero
    /// exit per Environment Inputs) on a missing `DATABASE_URL`.
    pub fn load_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set (missing required env is a fatal init error)")?;

        let api_bind_addr = env_or("API_BIND_ADDR", "0.0.0.0:8080")
            .parse()
            .context("Parsing API_BIND_ADDR")?;

        Ok(Configuration {
            database_url,
            max_retries: env_parse("MAX_RETRIES", 5)?,
            visibility_timeout_extract: env_duration("VISIBILITY_TIMEOUT_EXTRACT", Duration::from_secs(600))?,
            visibility_timeout_transform: env_duration("VISIBILITY_TIMEOUT_TRANSFORM", Duration::from_secs(120))?,
            visibility_timeout_embed: env_duration("VISIBILITY_TIMEOUT_EMBED", Duration::from_secs(120))?,
            orchestrator_tick_interval: env_duration("TICK_INTERVAL", Duration::from_secs(30))?,
            extract_queue_hwm: env_parse("EXTRACT_QUEUE_HWM", 10_000)?,
            extract_queue_lwm: env_parse("EXTRACT_QUEUE_LWM", 5_000)?,
            default_batch_size: env_parse("DEFAULT_BATCH_SIZE", 100)?,
            runaway_threshold: env_duration("RUNAWAY_THRESHOLD", Duration::from_secs(3600 * 6))?,
            transform_queue_backpressure_threshold: env_parse("TRANSFORM_QUEUE_BACKPRESSURE_THRESHOLD", 20_000)?,
            api_bind_addr,
        })
    }

    /// The retry/backoff schedule used for NACK-requeue, per Cancellation/Timeouts:
    /// 1s, 5s, 30s, 2m, 10m, then dead-letter.
    pub fn backoff_schedule(&self) -> &'static [Duration] {
        &[
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(120),
            Duration::from_secs(600),
        ]
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Configuration {
            database_url: "postgres://localhost/test".to_string(),
            max_retries: 5,
            visibility_timeout_extract: Duration::from_secs(600),
            visibility_timeout_transform: Duration::from_secs(120),
            visibility_timeout_embed: Duration::from_secs(120),
            orchestrator_tick_interval: Duration::from_millis(10),
            extract_queue_hwm: 10,
            extract_queue_lwm: 5,
            default_batch_size: 100,
            runaway_threshold: Duration::from_secs(3600),
            transform_queue_backpressure_threshold: 1000,
            api_bind_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }
}
