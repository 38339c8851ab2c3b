//! Environment configuration.
//!
//! Every key is optional. Numeric keys that are present but malformed fail
//! start-up instead of falling back to the default.

use crate::breaker::BreakerConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TOPICS: &str =
    "restaurants:restaurants.created,restaurants.updated,restaurants.deleted";
pub const DEFAULT_ALLOWED_ACTIONS: &str = "created,updated,deleted,snapshot";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{key}: malformed binding {binding:?}, expected entity:topic[,topic]")]
    InvalidBinding { key: &'static str, binding: String },
}

/// One entity and the log topics consumed for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBinding {
    pub entity: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub nats_url: String,
    pub nats_durable: String,
    pub topics: Vec<TopicBinding>,
    pub rest_base_url: String,
    pub rest_timeout: Duration,
    pub jwt_secret: String,
    pub jwt_public_key: String,
    pub default_entity: String,
    pub allowed_actions: Vec<String>,
    pub send_buffer: usize,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub command_timeout: Duration,
    pub breaker: BreakerConfig,
    pub json_logs: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        Ok(Self {
            http_port: env.number("HTTP_PORT", 8082)?,
            metrics_port: env.number("METRICS_PORT", 9093)?,
            nats_url: env.string("NATS_URL", "nats://localhost:4222"),
            nats_durable: env.string("NATS_DURABLE", "realtime-gateway"),
            topics: parse_bindings("GATEWAY_TOPICS", &env.string("GATEWAY_TOPICS", DEFAULT_TOPICS))?,
            rest_base_url: env.string("REST_BASE_URL", "http://localhost:3000"),
            rest_timeout: Duration::from_millis(env.number("REST_TIMEOUT_MS", 5000)?),
            jwt_secret: env.string("JWT_SECRET", ""),
            jwt_public_key: env.string("JWT_PUBLIC_KEY", ""),
            default_entity: env.string("WS_DEFAULT_ENTITY", "restaurants"),
            allowed_actions: split_list(&env.string("WS_ALLOWED_ACTIONS", DEFAULT_ALLOWED_ACTIONS)),
            send_buffer: env.positive("WS_SEND_BUFFER", 8)?,
            ping_interval: Duration::from_secs(env.positive("WS_PING_INTERVAL_SECS", 30)?),
            idle_timeout: Duration::from_secs(env.positive("WS_IDLE_TIMEOUT_SECS", 60)?),
            command_timeout: Duration::from_secs(env.positive("WS_COMMAND_TIMEOUT_SECS", 10)?),
            breaker: BreakerConfig {
                threshold: env.number("BREAKER_THRESHOLD", 3)?,
                backoff_floor: Duration::from_millis(env.number("BREAKER_BACKOFF_FLOOR_MS", 1000)?),
                backoff_ceiling: Duration::from_millis(
                    env.number("BREAKER_BACKOFF_CEILING_MS", 60_000)?,
                ),
                log_interval: Duration::from_secs(env.number("BREAKER_LOG_INTERVAL_SECS", 30)?),
            },
            json_logs: env.string("LOG_FORMAT", "").eq_ignore_ascii_case("json"),
        })
    }

    /// Every configured topic, in declaration order.
    pub fn all_topics(&self) -> impl Iterator<Item = (&str, &str)> {
        self.topics.iter().flat_map(|binding| {
            binding
                .topics
                .iter()
                .map(move |topic| (binding.entity.as_str(), topic.as_str()))
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn number<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidNumber { key, value }),
        }
    }

    /// Intervals, timeouts and channel sizes where zero is unusable.
    fn positive<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Default + PartialEq,
    {
        let value = self.number(key, default)?;
        if value == T::default() {
            return Err(ConfigError::Zero { key });
        }
        Ok(value)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `entity:topic,topic;entity:topic`.
fn parse_bindings(key: &'static str, raw: &str) -> Result<Vec<TopicBinding>, ConfigError> {
    let mut bindings = Vec::new();
    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let invalid = || ConfigError::InvalidBinding {
            key,
            binding: part.to_string(),
        };
        let (entity, topics) = part.split_once(':').ok_or_else(invalid)?;
        let entity = entity.trim();
        let topics = split_list(topics);
        if entity.is_empty() || topics.is_empty() {
            return Err(invalid());
        }
        bindings.push(TopicBinding {
            entity: entity.to_string(),
            topics,
        });
    }
    Ok(bindings)
}
