use anyhow::{Context, Result, anyhow};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: String,
    pub kafka_group_id: String,
    pub kafka_topics: Vec<String>,
    pub kafka_auto_offset_reset: String,
    pub kafka_enable_auto_commit: bool,
    pub kafka_key_deserializer: String,
    pub kafka_value_deserializer: String,
    pub kafka_op_timeout_ms: u64,
    pub poll_window_ms: u64,
    pub batch_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            kafka_brokers: required_env("KAFKA_BROKERS")?,
            kafka_group_id: env::var("KAFKA_GROUP_ID").unwrap_or_else(|_| "dlq-drain".to_string()),
            kafka_topics: split_topics(&required_env("KAFKA_TOPICS")?),
            kafka_auto_offset_reset: env::var("KAFKA_AUTO_OFFSET_RESET")
                .unwrap_or_else(|_| "earliest".to_string()),
            kafka_enable_auto_commit: env_bool("KAFKA_ENABLE_AUTO_COMMIT", false),
            kafka_key_deserializer: env::var("KAFKA_KEY_DESERIALIZER")
                .unwrap_or_else(|_| "bytes".to_string()),
            kafka_value_deserializer: env::var("KAFKA_VALUE_DESERIALIZER")
                .unwrap_or_else(|_| "bytes".to_string()),
            kafka_op_timeout_ms: env_u64("KAFKA_OP_TIMEOUT_MS", 5_000)?,
            poll_window_ms: env_u64("DRAIN_POLL_WINDOW_MS", 100)?,
            batch_size: env_usize("DRAIN_BATCH_SIZE", 500)?,
        };

        if config.kafka_topics.is_empty() {
            return Err(anyhow!("KAFKA_TOPICS must name at least one topic"));
        }

        if !matches!(config.kafka_auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(anyhow!(
                "KAFKA_AUTO_OFFSET_RESET must be 'earliest' or 'latest', got '{}'",
                config.kafka_auto_offset_reset
            ));
        }

        if config.poll_window_ms == 0 {
            return Err(anyhow!("DRAIN_POLL_WINDOW_MS must be a positive integer"));
        }

        if config.batch_size == 0 {
            return Err(anyhow!("DRAIN_BATCH_SIZE must be a positive integer"));
        }

        if config.kafka_op_timeout_ms == 0 {
            return Err(anyhow!("KAFKA_OP_TIMEOUT_MS must be a positive integer"));
        }

        Ok(config)
    }

    /// Lag is measured against the first subscribed topic; multi-topic
    /// subscriptions still commit per record topic.
    pub fn lag_topic(&self) -> &str {
        &self.kafka_topics[0]
    }
}

fn split_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect()
}

fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required env var {name} cannot be empty"));
    }
    Ok(value)
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<u64>()
                .with_context(|| format!("invalid u64 for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .parse::<usize>()
                .with_context(|| format!("invalid usize for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
