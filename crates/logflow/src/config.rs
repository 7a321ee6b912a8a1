// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

pub const ENV_LOG_LEVEL: &str = "LOGFLOW_LOG_LEVEL";
pub const ENV_KAFKA_BROKERS: &str = "LOGFLOW_KAFKA_BROKERS";

pub const ENV_PRODUCER_ADDRESS: &str = "LOGFLOW_PRODUCER_ADDRESS";
pub const ENV_PRODUCER_MAX_RETRY: &str = "LOGFLOW_PRODUCER_MAX_RETRY";
pub const ENV_PRODUCER_RETRY_INTERVAL_SECS: &str = "LOGFLOW_PRODUCER_RETRY_INTERVAL_SECS";
pub const ENV_PRODUCER_MAX_TPS: &str = "LOGFLOW_PRODUCER_MAX_TPS";
pub const ENV_PRODUCER_RATE_LIMIT_RESET_INTERVAL_SECS: &str =
    "LOGFLOW_PRODUCER_RATE_LIMIT_RESET_INTERVAL_SECS";
pub const ENV_KAFKA_TOPIC_SUFFIX: &str = "LOGFLOW_KAFKA_TOPIC_SUFFIX";
pub const ENV_KAFKA_NEW_TOPIC_EVENT: &str = "LOGFLOW_KAFKA_NEW_TOPIC_EVENT";
pub const ENV_KAFKA_PARTITIONS: &str = "LOGFLOW_KAFKA_PARTITIONS";
pub const ENV_KAFKA_REPLICATION_FACTOR: &str = "LOGFLOW_KAFKA_REPLICATION_FACTOR";
pub const ENV_MAX_REQUEST_CONTENT_LENGTH: &str = "LOGFLOW_MAX_REQUEST_CONTENT_LENGTH";

pub const ENV_KAFKA_CONSUMER_GROUP_ID: &str = "LOGFLOW_KAFKA_CONSUMER_GROUP_ID";
pub const ENV_KAFKA_CONSUMER_TOPICS: &str = "LOGFLOW_KAFKA_CONSUMER_TOPICS";
pub const ENV_ELASTICSEARCH_URL: &str = "LOGFLOW_ELASTICSEARCH_URL";
pub const ENV_ES_RETRY_INTERVAL_SECS: &str = "LOGFLOW_ES_RETRY_INTERVAL_SECS";
pub const ENV_ES_MAX_RETRY: &str = "LOGFLOW_ES_MAX_RETRY";
pub const ENV_PUSH_METRIC_URL: &str = "LOGFLOW_PUSH_METRIC_URL";
pub const ENV_PUSH_METRIC_TOKEN: &str = "LOGFLOW_PUSH_METRIC_TOKEN";
pub const ENV_PUSH_METRIC_INTERVAL_SECS: &str = "LOGFLOW_PUSH_METRIC_INTERVAL_SECS";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_string(key, default)
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn log_level_from_env() -> String {
    env::var(ENV_LOG_LEVEL)
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string())
}

pub fn validate_log_level(log_level: &str) -> Result<(), ConfigError> {
    if VALID_LOG_LEVELS.contains(&log_level) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "Invalid log level '{log_level}'. Must be one of: trace, debug, info, warn, error"
        )))
    }
}

/// Configuration of the producer front end.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Address the RPC surface listens on (e.g., "0.0.0.0:8080")
    pub address: String,
    pub kafka_brokers: Vec<String>,
    /// Connection attempts when building kafka clients
    pub kafka_max_retry: u32,
    pub kafka_retry_interval: Duration,
    /// Default admission ceiling per topic and rate window
    pub max_tps: u32,
    pub rate_limit_reset_interval: Duration,
    pub topic_suffix: String,
    /// Topic announcing newly created topics, None disables the announcements
    pub new_event_topic: Option<String>,
    pub default_partitions: i32,
    pub default_replication_factor: i32,
    pub max_request_content_length: usize,
    pub push_metric: Option<PushMetricConfig>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            kafka_brokers: vec!["localhost:9092".to_string()],
            kafka_max_retry: 10,
            kafka_retry_interval: Duration::from_secs(10),
            max_tps: 100,
            rate_limit_reset_interval: Duration::from_secs(10),
            topic_suffix: "_logs".to_string(),
            new_event_topic: Some("new_topic_events".to_string()),
            default_partitions: 1,
            default_replication_factor: 1,
            max_request_content_length: 10 * 1024 * 1024, // 10MB in Bytes
            push_metric: None,
        }
    }
}

impl ProducerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let new_event_topic = env_string(ENV_KAFKA_NEW_TOPIC_EVENT, "new_topic_events");

        let config = Self {
            address: env_string(ENV_PRODUCER_ADDRESS, &defaults.address),
            kafka_brokers: env_list(ENV_KAFKA_BROKERS, "localhost:9092"),
            kafka_max_retry: env_parse(ENV_PRODUCER_MAX_RETRY, defaults.kafka_max_retry),
            kafka_retry_interval: Duration::from_secs(env_parse(
                ENV_PRODUCER_RETRY_INTERVAL_SECS,
                defaults.kafka_retry_interval.as_secs(),
            )),
            max_tps: env_parse(ENV_PRODUCER_MAX_TPS, defaults.max_tps),
            rate_limit_reset_interval: Duration::from_secs(env_parse(
                ENV_PRODUCER_RATE_LIMIT_RESET_INTERVAL_SECS,
                defaults.rate_limit_reset_interval.as_secs(),
            )),
            topic_suffix: env_string(ENV_KAFKA_TOPIC_SUFFIX, &defaults.topic_suffix),
            new_event_topic: Some(new_event_topic).filter(|topic| !topic.trim().is_empty()),
            default_partitions: env_parse(ENV_KAFKA_PARTITIONS, defaults.default_partitions),
            default_replication_factor: env_parse(
                ENV_KAFKA_REPLICATION_FACTOR,
                defaults.default_replication_factor,
            ),
            max_request_content_length: env_parse(
                ENV_MAX_REQUEST_CONTENT_LENGTH,
                defaults.max_request_content_length,
            ),
            push_metric: push_metric_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Producer address cannot be empty".to_string(),
            ));
        }
        if self.kafka_brokers.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one kafka broker is required".to_string(),
            ));
        }
        if self.max_tps == 0 {
            return Err(ConfigError::Invalid(
                "Max TPS must be greater than 0".to_string(),
            ));
        }
        if self.rate_limit_reset_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Rate limit reset interval must be greater than 0".to_string(),
            ));
        }
        if self.default_partitions <= 0 || self.default_replication_factor <= 0 {
            return Err(ConfigError::Invalid(
                "Partitions and replication factor must be greater than 0".to_string(),
            ));
        }
        if let Some(push_metric) = &self.push_metric {
            push_metric.validate()?;
        }
        Ok(())
    }
}

/// Where and how often throughput counters are pushed.
#[derive(Debug, Clone)]
pub struct PushMetricConfig {
    pub url: String,
    pub token: String,
    pub interval: Duration,
}

impl PushMetricConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Metric push interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pushing needs both a collector and a token.
fn push_metric_from_env() -> Option<PushMetricConfig> {
    let url = env_string(ENV_PUSH_METRIC_URL, "");
    let token = env_string(ENV_PUSH_METRIC_TOKEN, "");
    if url.is_empty() || token.is_empty() {
        return None;
    }
    Some(PushMetricConfig {
        url,
        token,
        interval: Duration::from_secs(env_parse(ENV_PUSH_METRIC_INTERVAL_SECS, 30)),
    })
}

/// Configuration of the Kafka to Elasticsearch forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub kafka_brokers: Vec<String>,
    pub consumer_group_id: String,
    pub consumer_topics: Vec<String>,
    pub elasticsearch_url: String,
    pub es_retry_interval: Duration,
    /// 0 retries forever
    pub es_max_retry: u32,
    pub push_metric: Option<PushMetricConfig>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            kafka_brokers: vec!["localhost:9092".to_string()],
            consumer_group_id: "logflow-group".to_string(),
            consumer_topics: vec!["topic01".to_string()],
            elasticsearch_url: "http://localhost:9200".to_string(),
            es_retry_interval: Duration::from_secs(5),
            es_max_retry: 0,
            push_metric: None,
        }
    }
}

impl ForwarderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            kafka_brokers: env_list(ENV_KAFKA_BROKERS, "localhost:9092"),
            consumer_group_id: env_string(ENV_KAFKA_CONSUMER_GROUP_ID, &defaults.consumer_group_id),
            consumer_topics: env_list(ENV_KAFKA_CONSUMER_TOPICS, "topic01"),
            elasticsearch_url: env_string(ENV_ELASTICSEARCH_URL, &defaults.elasticsearch_url),
            es_retry_interval: Duration::from_secs(env_parse(
                ENV_ES_RETRY_INTERVAL_SECS,
                defaults.es_retry_interval.as_secs(),
            )),
            es_max_retry: env_parse(ENV_ES_MAX_RETRY, defaults.es_max_retry),
            push_metric: push_metric_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka_brokers.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one kafka broker is required".to_string(),
            ));
        }
        if self.consumer_group_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Consumer group id cannot be empty".to_string(),
            ));
        }
        if self.consumer_topics.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one consumer topic is required".to_string(),
            ));
        }
        if self.elasticsearch_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Elasticsearch URL cannot be empty".to_string(),
            ));
        }
        if self.es_retry_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Elasticsearch retry interval must be greater than 0".to_string(),
            ));
        }
        if let Some(push_metric) = &self.push_metric {
            push_metric.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_KAFKA_BROKERS,
            ENV_PRODUCER_ADDRESS,
            ENV_PRODUCER_MAX_TPS,
            ENV_KAFKA_TOPIC_SUFFIX,
            ENV_KAFKA_NEW_TOPIC_EVENT,
            ENV_KAFKA_CONSUMER_TOPICS,
            ENV_ES_MAX_RETRY,
            ENV_PUSH_METRIC_URL,
            ENV_PUSH_METRIC_TOKEN,
            ENV_LOG_LEVEL,
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_configs_are_valid() {
        assert!(ProducerConfig::default().validate().is_ok());
        assert!(ForwarderConfig::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_producer_from_env() {
        clear_env();
        env::set_var(ENV_KAFKA_BROKERS, "a:9092, b:9092");
        env::set_var(ENV_KAFKA_TOPIC_SUFFIX, "_events");
        env::set_var(ENV_PRODUCER_MAX_TPS, "not_a_number");
        env::set_var(ENV_KAFKA_NEW_TOPIC_EVENT, "");

        let config = ProducerConfig::from_env().expect("config should be valid");
        assert_eq!(config.kafka_brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.topic_suffix, "_events");
        assert_eq!(config.max_tps, 100);
        assert_eq!(config.new_event_topic, None);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_producer_rejects_zero_tps() {
        clear_env();
        env::set_var(ENV_PRODUCER_MAX_TPS, "0");
        assert!(ProducerConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_forwarder_push_metric_needs_token() {
        clear_env();
        env::set_var(ENV_PUSH_METRIC_URL, "http://localhost:3000/api/increase_log_count");
        let config = ForwarderConfig::from_env().expect("config should be valid");
        assert!(config.push_metric.is_none());

        env::set_var(ENV_PUSH_METRIC_TOKEN, "token");
        let config = ForwarderConfig::from_env().expect("config should be valid");
        let push_metric = config.push_metric.expect("push metric configured");
        assert_eq!(push_metric.token, "token");
        assert_eq!(push_metric.interval, Duration::from_secs(30));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_forwarder_from_env() {
        clear_env();
        env::set_var(ENV_KAFKA_CONSUMER_TOPICS, "a_logs,b_logs");
        env::set_var(ENV_ES_MAX_RETRY, "3");
        let config = ForwarderConfig::from_env().expect("config should be valid");
        assert_eq!(config.consumer_topics, vec!["a_logs", "b_logs"]);
        assert_eq!(config.es_max_retry, 3);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_producer_push_metric_from_env() {
        clear_env();
        env::set_var(ENV_PUSH_METRIC_URL, "http://localhost:3000/api/increase_log_count");
        env::set_var(ENV_PUSH_METRIC_TOKEN, "token");
        let config = ProducerConfig::from_env().expect("config should be valid");
        let push_metric = config.push_metric.expect("push metric configured");
        assert_eq!(push_metric.url, "http://localhost:3000/api/increase_log_count");
        clear_env();
    }

    #[test]
    fn test_validate_zero_intervals() {
        let config = ForwarderConfig {
            es_retry_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProducerConfig {
            push_metric: Some(PushMetricConfig {
                url: "http://localhost".to_string(),
                token: "token".to_string(),
                interval: Duration::ZERO,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_topics() {
        let config = ForwarderConfig {
            consumer_topics: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_log_levels() {
        for level in VALID_LOG_LEVELS {
            assert!(validate_log_level(level).is_ok());
        }
        assert!(validate_log_level("verbose").is_err());
    }

    #[test]
    #[serial]
    fn test_log_level_lowercased() {
        clear_env();
        env::set_var(ENV_LOG_LEVEL, "DEBUG");
        assert_eq!(log_level_from_env(), "debug");
        clear_env();
        assert_eq!(log_level_from_env(), "info");
    }
}
