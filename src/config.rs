//! Runtime configuration from environment variables.

use std::env;

pub const RAW_EVENTS_TOPIC: &str = "raw-events";
pub const FEATURE_EVENTS_TOPIC: &str = "feature-events";
pub const DEAD_LETTER_TOPIC: &str = "dead-letter-queue";

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the pipeline runtime.
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the JSONL topic logs and committed offsets
    pub topic_data_dir: String,

    /// Consumer group id for the raw-events subscription
    pub consumer_group: String,

    /// Path to the SQLite feature store
    pub store_path: String,

    /// Directory containing schema migration files
    pub schema_dir: String,

    /// Path to the feature registry YAML document
    pub features_config: String,

    /// Flush the batch once it holds this many events
    pub batch_size: usize,

    /// Flush a non-empty batch after this many seconds without one
    pub batch_timeout_secs: f64,

    /// How often the metrics snapshot is logged, in seconds
    pub metrics_flush_secs: u64,
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TOPIC_DATA_DIR` (default: ./data)
    /// - `CONSUMER_GROUP` (default: feature-computation-group)
    /// - `FEATURE_STORE_PATH` (default: ./data/featurestore.db)
    /// - `SCHEMA_DIR` (default: sql)
    /// - `FEATURES_CONFIG` (default: features.yaml)
    /// - `BATCH_SIZE` (default: 100)
    /// - `BATCH_TIMEOUT` seconds, fractional allowed (default: 1.0)
    /// - `METRICS_FLUSH_INTERVAL` seconds (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let batch_size = env::var("BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(100);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        let batch_timeout_secs = env::var("BATCH_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(1.0);
        if !batch_timeout_secs.is_finite() || batch_timeout_secs <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "BATCH_TIMEOUT must be a positive number of seconds".to_string(),
            ));
        }

        Ok(Self {
            topic_data_dir: env::var("TOPIC_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),

            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "feature-computation-group".to_string()),

            store_path: env::var("FEATURE_STORE_PATH")
                .unwrap_or_else(|_| "./data/featurestore.db".to_string()),

            schema_dir: env::var("SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),

            features_config: env::var("FEATURES_CONFIG")
                .unwrap_or_else(|_| "features.yaml".to_string()),

            batch_size,
            batch_timeout_secs,

            metrics_flush_secs: env::var("METRICS_FLUSH_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        })
    }
}
