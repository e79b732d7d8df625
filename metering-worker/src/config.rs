use serde::Deserialize;

use crate::{sources::ConsumerSettings, transform::MAX_TOLERANCE_MINUTES};
use std::{fmt::Display, fs, str::FromStr};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub url: String,
    pub ingest_exchange: String,
    pub ingest_queue: String,
    pub ingest_routing_key: String,
    pub worker_exchange: String,
    pub worker_routing_key: String,
    pub dlq_queue: String,
    pub prefetch_count: u16,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ingest_exchange: "energy-metering.ingest.exchange".to_string(),
            ingest_queue: "energy-metering.ingest.queue".to_string(),
            ingest_routing_key: "meter.reading.raw".to_string(),
            worker_exchange: "energy-metering.worker.events.exchange".to_string(),
            worker_routing_key: "meter.reading.accepted".to_string(),
            dlq_queue: "energy-metering.ingest.dlq".to_string(),
            prefetch_count: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub timestamp_tolerance_minutes: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        // One week: meters buffer readings while offline.
        Self {
            timestamp_tolerance_minutes: 10_080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub spike_threshold: f64,
    pub min_data_points: usize,
    pub history_window: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            spike_threshold: 3.0,
            min_data_points: 3,
            history_window: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0:8081".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub database: DatabaseConfig,
    pub rabbitmq: RabbitMqConfig,
    pub validation: ValidationConfig,
    pub anomaly: AnomalyConfig,
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "energy-metering-worker".to_string(),
            database: DatabaseConfig::default(),
            rabbitmq: RabbitMqConfig::default(),
            validation: ValidationConfig::default(),
            anomaly: AnomalyConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the TOML file named by `METERING_CONFIG` (if set), then
    /// environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::load`] with an explicit variable lookup.
    pub fn load_from<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cfg = Self::layered(lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Broker settings only, for tools that publish to the ingest exchange
    /// without touching the database.
    pub fn load_rabbitmq() -> Result<RabbitMqConfig, ConfigError> {
        let cfg = Self::layered(|key| std::env::var(key).ok())?;
        if cfg.rabbitmq.url.is_empty() {
            return Err(ConfigError::Missing("RABBITMQ_URL"));
        }
        Ok(cfg.rabbitmq)
    }

    fn layered<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let mut cfg = match lookup("METERING_CONFIG") {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
                toml::from_str(&contents)?
            }
            None => AppConfig::default(),
        };

        set_string(&lookup, "SERVICE_NAME", &mut cfg.service_name);

        set_string(&lookup, "DATABASE_URL", &mut cfg.database.url);
        set_parsed(&lookup, "DATABASE_MAX_CONNECTIONS", &mut cfg.database.max_connections)?;

        let mq = &mut cfg.rabbitmq;
        set_string(&lookup, "RABBITMQ_URL", &mut mq.url);
        set_string(&lookup, "RABBITMQ_INGEST_EXCHANGE", &mut mq.ingest_exchange);
        set_string(&lookup, "RABBITMQ_INGEST_QUEUE", &mut mq.ingest_queue);
        set_string(&lookup, "RABBITMQ_INGEST_ROUTING_KEY", &mut mq.ingest_routing_key);
        set_string(&lookup, "RABBITMQ_WORKER_EXCHANGE", &mut mq.worker_exchange);
        set_string(&lookup, "RABBITMQ_WORKER_ROUTING_KEY", &mut mq.worker_routing_key);
        set_string(&lookup, "RABBITMQ_DLQ_QUEUE", &mut mq.dlq_queue);
        set_parsed(&lookup, "RABBITMQ_PREFETCH", &mut mq.prefetch_count)?;

        set_parsed(
            &lookup,
            "VALIDATION_TIMESTAMP_TOLERANCE_MINUTES",
            &mut cfg.validation.timestamp_tolerance_minutes,
        )?;

        set_parsed(&lookup, "ANOMALY_SPIKE_THRESHOLD", &mut cfg.anomaly.spike_threshold)?;
        set_parsed(&lookup, "ANOMALY_MIN_DATA_POINTS", &mut cfg.anomaly.min_data_points)?;
        set_parsed(&lookup, "ANOMALY_HISTORY_WINDOW", &mut cfg.anomaly.history_window)?;

        set_parsed(&lookup, "METRICS_ENABLED", &mut cfg.metrics.enabled)?;
        set_string(&lookup, "METRICS_BIND_ADDR", &mut cfg.metrics.bind_addr);

        Ok(cfg)
    }

    /// Consumer topology and QoS for this worker instance. The tag is unique
    /// per process so broker-side listings can tell replicas apart.
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            exchange: self.rabbitmq.ingest_exchange.clone(),
            queue: self.rabbitmq.ingest_queue.clone(),
            routing_key: self.rabbitmq.ingest_routing_key.clone(),
            dead_letter_queue: self.rabbitmq.dlq_queue.clone(),
            prefetch: self.rabbitmq.prefetch_count,
            consumer_tag: format!("{}-{}", self.service_name, uuid::Uuid::new_v4()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.rabbitmq.url.is_empty() {
            return Err(ConfigError::Missing("RABBITMQ_URL"));
        }
        if self.rabbitmq.prefetch_count == 0 {
            return Err(invalid("RABBITMQ_PREFETCH", 0, "must be at least 1"));
        }
        let tolerance = self.validation.timestamp_tolerance_minutes;
        if !(0..=MAX_TOLERANCE_MINUTES).contains(&tolerance) {
            return Err(invalid(
                "VALIDATION_TIMESTAMP_TOLERANCE_MINUTES",
                tolerance,
                &format!("must be between 0 and {MAX_TOLERANCE_MINUTES}"),
            ));
        }
        let threshold = self.anomaly.spike_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(invalid("ANOMALY_SPIKE_THRESHOLD", threshold, "must be a positive number"));
        }
        if self.anomaly.min_data_points == 0 {
            return Err(invalid("ANOMALY_MIN_DATA_POINTS", 0, "must be at least 1"));
        }
        if self.anomaly.history_window < self.anomaly.min_data_points {
            return Err(invalid(
                "ANOMALY_HISTORY_WINDOW",
                self.anomaly.history_window,
                "must be at least ANOMALY_MIN_DATA_POINTS",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: impl Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn set_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn set_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        })?;
    }
    Ok(())
}
