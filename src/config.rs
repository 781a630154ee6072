//! Layered configuration: a TOML file, then `TASKQUEUE__`-prefixed
//! environment variables, then explicit overrides, resolved through the
//! `config` crate the same way the platform this crate was lifted from
//! layers its settings.

use crate::engine::BrokerKind;
use crate::error::{Error, Result};
use crate::options::TaskDefaults;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "taskqueue.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub broker: BrokerSettings,
    pub defaults: TaskDefaultsSettings,
    pub observability: ObservabilitySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            defaults: TaskDefaultsSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("TASKQUEUE").separator("__"));

        let config = builder
            .build()
            .map_err(|err| Error::Configuration(err.to_string()))?;

        config
            .try_deserialize()
            .map_err(|err| Error::Configuration(err.to_string()))
    }

    pub fn broker_kind(&self) -> BrokerKind {
        match self.broker.driver.as_str() {
            "memory" => BrokerKind::Memory,
            _ => BrokerKind::Redis(self.broker.redis.to_redis_config()),
        }
    }

    pub fn task_defaults(&self) -> TaskDefaults {
        self.defaults.to_task_defaults()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `"redis"` (default) or `"memory"`.
    pub driver: String,
    pub redis: RedisSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            driver: "redis".to_string(),
            redis: RedisSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            connect_timeout_seconds: 5,
        }
    }
}

impl RedisSettings {
    fn to_redis_config(&self) -> crate::broker::RedisBrokerConfig {
        crate::broker::RedisBrokerConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaultsSettings {
    pub max_retries: u32,
    pub retry_interval_seconds: Vec<u64>,
    pub timeout_seconds: u64,
    pub ttl_seconds: u64,
}

impl Default for TaskDefaultsSettings {
    fn default() -> Self {
        let defaults = TaskDefaults::default();
        Self {
            max_retries: defaults.max_retries,
            retry_interval_seconds: defaults.retry_intervals.iter().map(Duration::as_secs).collect(),
            timeout_seconds: defaults.timeout.as_secs(),
            ttl_seconds: defaults.ttl.as_secs(),
        }
    }
}

impl TaskDefaultsSettings {
    fn to_task_defaults(&self) -> TaskDefaults {
        TaskDefaults {
            max_retries: self.max_retries,
            retry_intervals: self
                .retry_interval_seconds
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            timeout: Duration::from_secs(self.timeout_seconds),
            ttl: Duration::from_secs(self.ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl ObservabilitySettings {
    pub fn init_logging(&self) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(self.log_level.as_str())
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_task_defaults() {
        let settings = TaskDefaultsSettings::default();
        let resolved = settings.to_task_defaults();
        assert_eq!(resolved.max_retries, TaskDefaults::default().max_retries);
        assert_eq!(resolved.timeout, TaskDefaults::default().timeout);
    }

    #[test]
    fn memory_driver_selects_memory_broker_kind() {
        let config = EngineConfig {
            broker: BrokerSettings {
                driver: "memory".to_string(),
                ..BrokerSettings::default()
            },
            ..EngineConfig::default()
        };
        assert!(matches!(config.broker_kind(), BrokerKind::Memory));
    }
}
