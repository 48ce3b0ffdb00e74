//! Queue configuration.
//!
//! Values come from the environment (see [`QueueConfig::from_env`]); anything
//! missing or unparsable falls back to the default with a warning.

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use tradeflow_events::queues;

use crate::consumer::ConsumerConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Approximate length bound applied on every append.
pub const DEFAULT_MAX_LEN: usize = 10_000;

pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Failed deliveries before an event is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_GROUP: &str = "workers";

/// Pending entries unacknowledged this long are claimed by the next poll.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: String,
    pub max_len: usize,
    pub block_timeout: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub group: String,
    pub consumer: String,
    pub claim_idle: Duration,
    /// Queues reported by the health check.
    pub monitored_queues: Vec<String>,
    /// Run a retry processor next to each primary consumer.
    pub retry_enabled: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            max_len: DEFAULT_MAX_LEN,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            group: DEFAULT_GROUP.to_string(),
            consumer: default_consumer_name(),
            claim_idle: DEFAULT_CLAIM_IDLE,
            monitored_queues: queues::MONITORED.iter().map(|q| q.to_string()).collect(),
            retry_enabled: false,
        }
    }
}

/// Unique per process so consumers sharing a group never collide.
pub fn default_consumer_name() -> String {
    format!("consumer-{}", Uuid::now_v7())
}

impl QueueConfig {
    /// Read configuration from process environment variables:
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `REDIS_URL` | `redis://127.0.0.1:6379` |
    /// | `QUEUE_MAX_LEN` | `10000` |
    /// | `QUEUE_BLOCK_TIMEOUT_MS` | `2000` |
    /// | `QUEUE_BATCH_SIZE` | `10` |
    /// | `QUEUE_MAX_RETRIES` | `3` |
    /// | `QUEUE_CONSUMER_GROUP` | `workers` |
    /// | `QUEUE_CONSUMER_NAME` | `consumer-<uuid>` |
    /// | `QUEUE_CLAIM_IDLE_MS` | `60000` |
    /// | `QUEUE_MONITORED` | comma-separated, the five core queues |
    /// | `QUEUE_RETRY_ENABLED` | `false` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let parsed = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!(key, value = %raw, default, "invalid queue setting; using default");
                    default
                }),
                None => default,
            }
        };

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| {
            warn!("REDIS_URL not set; using {}", DEFAULT_REDIS_URL);
            defaults.redis_url.clone()
        });

        let monitored_queues = lookup("QUEUE_MONITORED")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.monitored_queues);

        let retry_enabled = match lookup("QUEUE_RETRY_ENABLED") {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    warn!(value = %raw, "invalid QUEUE_RETRY_ENABLED; retry processors disabled");
                    false
                }
            },
            None => defaults.retry_enabled,
        };

        Self {
            redis_url,
            max_len: parsed("QUEUE_MAX_LEN", defaults.max_len as u64) as usize,
            block_timeout: Duration::from_millis(parsed(
                "QUEUE_BLOCK_TIMEOUT_MS",
                defaults.block_timeout.as_millis() as u64,
            )),
            batch_size: parsed("QUEUE_BATCH_SIZE", defaults.batch_size as u64) as usize,
            max_retries: u32::try_from(parsed("QUEUE_MAX_RETRIES", defaults.max_retries.into()))
                .unwrap_or(DEFAULT_MAX_RETRIES),
            group: lookup("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.group),
            consumer: lookup("QUEUE_CONSUMER_NAME").unwrap_or(defaults.consumer),
            claim_idle: Duration::from_millis(parsed(
                "QUEUE_CLAIM_IDLE_MS",
                defaults.claim_idle.as_millis() as u64,
            )),
            monitored_queues,
            retry_enabled,
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn with_monitored_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.monitored_queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Consumer settings derived from this configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default()
            .with_group(self.group.clone())
            .with_consumer(self.consumer.clone())
            .with_batch_size(self.batch_size)
            .with_block_timeout(self.block_timeout)
            .with_max_retries(self.max_retries)
            .with_max_len(Some(self.max_len))
            .with_claim_idle(self.claim_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = QueueConfig::from_lookup(lookup(&[]));
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.max_len, DEFAULT_MAX_LEN);
        assert_eq!(config.block_timeout, DEFAULT_BLOCK_TIMEOUT);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.monitored_queues.len(), 5);
        assert!(config.consumer.starts_with("consumer-"));
        assert!(!config.retry_enabled);
        assert_eq!(config.claim_idle, DEFAULT_CLAIM_IDLE);
    }

    #[test]
    fn reads_overrides() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6380"),
            ("QUEUE_BLOCK_TIMEOUT_MS", "250"),
            ("QUEUE_MAX_RETRIES", "5"),
            ("QUEUE_CONSUMER_GROUP", "settlement"),
            ("QUEUE_MONITORED", "queue:trades, queue:wallet,"),
            ("QUEUE_RETRY_ENABLED", "true"),
            ("QUEUE_CLAIM_IDLE_MS", "15000"),
        ]));
        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.block_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.group, "settlement");
        assert_eq!(config.monitored_queues, vec!["queue:trades", "queue:wallet"]);
        assert!(config.retry_enabled);
        assert_eq!(config.claim_idle, Duration::from_secs(15));
        assert_eq!(config.consumer_config().claim_idle, Duration::from_secs(15));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = QueueConfig::from_lookup(lookup(&[("QUEUE_BATCH_SIZE", "lots")]));
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn consumer_config_inherits_settings() {
        let config = QueueConfig::default()
            .with_block_timeout(Duration::from_millis(100))
            .with_max_retries(2);
        let consumer = config.consumer_config();
        assert_eq!(consumer.block_timeout, Duration::from_millis(100));
        assert_eq!(consumer.max_retries, 2);
        assert_eq!(consumer.group, DEFAULT_GROUP);
        assert_eq!(consumer.consumer, config.consumer);
    }
}
