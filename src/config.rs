use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::broker::ReconnectPolicy;
use crate::messaging::{ConsumerConfig, DEFAULT_REQUEST_QUEUE, DEFAULT_RESPONSE_QUEUE, ProducerConfig};
use crate::recharge::DEFAULT_RETRY_BUDGET;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub recharge: RechargeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Hard bound on graceful shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Period of the health report log line; 0 disables it
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_health_interval_secs() -> u64 {
    60
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Amqp,
    /// In-process broker for local smoke runs
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
    pub heartbeat_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Amqp,
            url: "amqp://localhost:5672/%2f".to_string(),
            heartbeat_secs: 60,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub request: String,
    pub response: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            request: DEFAULT_REQUEST_QUEUE.to_string(),
            response: DEFAULT_RESPONSE_QUEUE.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProducerSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RechargeConfig {
    pub retry_budget: u32,
}

impl Default for RechargeConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            postgres_url: None,
            max_connections: 5,
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`, then apply environment overrides
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// `RABBITMQ_URL`, `WEBHOOK_URL`, `WEBHOOK_SECRET`, `DATABASE_URL`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("RABBITMQ_URL") {
            self.broker.url = url;
        }
        if let Some(url) = lookup("WEBHOOK_URL") {
            self.webhook.url = Some(url);
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.postgres_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.request.is_empty() || self.queues.response.is_empty() {
            return Err(ConfigError::Invalid("queue names must not be empty".into()));
        }
        if self.queues.request == self.queues.response {
            return Err(ConfigError::Invalid(
                "request and response queues must differ".into(),
            ));
        }
        if self.consumer.prefetch == 0 {
            return Err(ConfigError::Invalid("consumer.prefetch must be > 0".into()));
        }
        if self.recharge.retry_budget == 0 {
            return Err(ConfigError::Invalid("recharge.retry_budget must be > 0".into()));
        }
        if self.storage.kind == StorageKind::Postgres && self.storage.postgres_url.is_none() {
            return Err(ConfigError::Invalid(
                "storage.kind is postgres but no postgres_url/DATABASE_URL is set".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.broker.heartbeat_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            queue: self.queues.response.clone(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.producer.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(self.producer.reconnect_max_delay_ms),
                max_attempts: Some(self.producer.max_reconnect_attempts),
            },
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queues.request.clone(),
            prefetch: self.consumer.prefetch,
            max_retries: self.consumer.max_retries,
            retry_base_delay: Duration::from_millis(self.consumer.retry_base_delay_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.consumer.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(self.consumer.reconnect_max_delay_ms),
                max_attempts: None,
            },
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: relay.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Amqp);
        assert_eq!(config.queues.request, "recharge-queue");
        assert_eq!(config.queues.response, "recharge-response-queue");
        assert_eq!(config.consumer.prefetch, 1);
        assert_eq!(config.recharge.retry_budget, 2);
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let producer = config.producer_config();
        assert_eq!(producer.reconnect, ReconnectPolicy::bounded());
        let consumer = config.consumer_config();
        assert_eq!(consumer.reconnect, ReconnectPolicy::unbounded());
        assert_eq!(consumer.retry_base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_sections_override_defaults() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
broker:
  kind: memory
  heartbeat_secs: 30
consumer:
  max_retries: 5
storage:
  kind: postgres
  postgres_url: postgres://localhost/recharge
"#
        );
        let config = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.heartbeat(), Duration::from_secs(30));
        assert_eq!(config.broker.connect_timeout_ms, 10_000);
        assert_eq!(config.consumer_config().max_retries, 5);
        assert_eq!(config.consumer.prefetch, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("RABBITMQ_URL", "amqp://mq:5672/%2f"),
            ("WEBHOOK_URL", "https://admin.example/hook"),
            ("WEBHOOK_SECRET", "s3cret"),
            ("DATABASE_URL", "postgres://db/recharge"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.broker.url, "amqp://mq:5672/%2f");
        assert_eq!(config.webhook.url.as_deref(), Some("https://admin.example/hook"));
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
        assert_eq!(
            config.storage.postgres_url.as_deref(),
            Some("postgres://db/recharge")
        );
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        config.storage.kind = StorageKind::Postgres;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        config.queues.response = config.queues.request.clone();
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_yaml_str(MINIMAL).unwrap();
        config.consumer.prefetch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = format!("{}broker:\n  kind: kafka\n", MINIMAL);
        assert!(matches!(
            AppConfig::from_yaml_str(&yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AppConfig::load("does-not-exist"),
            Err(ConfigError::Read { .. })
        ));
    }
}
