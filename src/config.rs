//! Configuration management for Tollgate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::breaker::{CircuitBreakerOptions, SamplingBreakerOptions, DEFAULT_HALF_OPEN_AFTER_MS};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{LeakyBucketOptions, SlidingWindowOptions};
use crate::registry::Registry;
use crate::store::{MemoryStore, StoreSettings};

/// Main configuration for a Tollgate deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Identifies this replica in logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Shared store access
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiters by hash
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,

    /// Circuit breakers by name
    #[serde(default)]
    pub breakers: BTreeMap<String, BreakerConfig>,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            store: StoreConfig::default(),
            limiters: BTreeMap::new(),
            breakers: BTreeMap::new(),
        }
    }
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// What to do when the store cannot be reached while deciding admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailureMode {
    /// Reject the call with a store-unavailable error
    #[default]
    FailClosed,
    /// Let the call through unguarded
    FailOpen,
}

/// Store access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Namespace for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Compare-and-swap attempts per transaction
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between conflicting attempts in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default)]
    pub failure_mode: StoreFailureMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            failure_mode: StoreFailureMode::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "tollgate".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    32
}

fn default_backoff_ms() -> u64 {
    1
}

impl From<&StoreConfig> for StoreSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// A rate limiter definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    SlidingWindow {
        max_window_request_count: u64,
        interval_in_seconds: f64,
    },
    LeakyBucket {
        bucket_size: f64,
        fill_rate: f64,
    },
}

/// Driver options of either algorithm.
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterOptions {
    SlidingWindow(SlidingWindowOptions),
    LeakyBucket(LeakyBucketOptions),
}

impl LimiterConfig {
    /// Bind this definition to a limiter hash.
    pub fn to_options(&self, hash: &str) -> LimiterOptions {
        match *self {
            LimiterConfig::SlidingWindow {
                max_window_request_count,
                interval_in_seconds,
            } => LimiterOptions::SlidingWindow(SlidingWindowOptions {
                hash: hash.to_string(),
                max_window_request_count,
                interval_in_seconds,
            }),
            LimiterConfig::LeakyBucket {
                bucket_size,
                fill_rate,
            } => LimiterOptions::LeakyBucket(LeakyBucketOptions {
                hash: hash.to_string(),
                bucket_size,
                fill_rate,
            }),
        }
    }
}

/// A circuit breaker definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure ratio in (0, 1) above which the circuit opens
    pub threshold: f64,

    /// Sampling horizon in milliseconds
    pub duration_ms: u64,

    /// Throughput floor before tripping is considered
    #[serde(default)]
    pub minimum_rps: Option<f64>,

    /// Cool-down before a half-open probe, in milliseconds
    #[serde(default = "default_half_open_after_ms")]
    pub half_open_after_ms: u64,
}

fn default_half_open_after_ms() -> u64 {
    DEFAULT_HALF_OPEN_AFTER_MS
}

impl BreakerConfig {
    pub fn to_options(&self, name: &str) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            name: name.to_string(),
            sampling: SamplingBreakerOptions {
                threshold: self.threshold,
                duration_ms: self.duration_ms,
                minimum_rps: self.minimum_rps,
            },
            half_open_after_ms: self.half_open_after_ms,
        }
    }
}

impl TollgateConfig {
    /// Load configuration from a file, overlaid with `TOLLGATE__*`
    /// environment variables (e.g. `TOLLGATE__STORE__TIMEOUT_MS=500`).
    pub fn load(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");

        let layered = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        layered
            .try_deserialize()
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Check every limiter and breaker definition without touching a store.
    pub fn validate(&self) -> Result<()> {
        Registry::from_config(self, Arc::new(MemoryStore::new())).map(|_| ())
    }
}
