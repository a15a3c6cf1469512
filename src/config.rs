//! Configuration management for the rollup engine
//!
//! This module provides TOML configuration with environment variable
//! overrides and built-in defaults for the wearable metrics.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! data_dir = "./data/rollups"
//! raw_dir = "./data/raw"
//! max_points = 500
//! freshness_policy = "catch_up"
//!
//! [[metrics]]
//! name = "spo2"
//! cadence = "1m"
//! fields = [{ name = "value", reducers = ["avg", "min", "max"] }]
//! tiers = [{ id = "1h", width = "1h" }, { id = "1d", width = "1d" }]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::rollup::hierarchy::{AggregationField, MetricDefinition, RollupHierarchy, TierDefinition};
use crate::rollup::record::Reducer;
use crate::rollup::scheduler::RetryPolicy;
use crate::rollup::selector::FreshnessPolicy;
use crate::types::parse_duration_ms;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Retry behaviour for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metric tier chains
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricConfig>,
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Directory holding materialized tiers
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory holding raw `<metric>/<entity>.jsonl` series
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    /// Point budget used by resolution selection
    #[serde(default = "default_max_points")]
    pub max_points: u64,

    /// Largest backlog refreshed or folded on the query path
    #[serde(default = "default_catch_up_max_buckets")]
    pub catch_up_max_buckets: u64,

    /// What a query does when its tier is behind
    #[serde(default)]
    pub freshness_policy: FreshnessPolicy,

    /// Concurrent refresh jobs
    #[serde(default = "default_workers")]
    pub worker_pool_size: usize,

    /// Background refresh period
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `vitals_rollup=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

/// One metric and its tier chain
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricConfig {
    /// Metric identifier
    pub name: String,

    /// Native sampling cadence, e.g. `1s`
    pub cadence: String,

    /// Raw fields and the statistics exposed for them
    pub fields: Vec<FieldConfig>,

    /// Tiers, finest first
    pub tiers: Vec<TierConfig>,
}

/// A raw field
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FieldConfig {
    /// Field name in the raw samples
    pub name: String,

    /// Statistics exposed by queries
    #[serde(default = "default_reducers")]
    pub reducers: Vec<Reducer>,
}

/// A tier of a metric
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TierConfig {
    /// Tier identifier
    pub id: String,

    /// Bucket width, e.g. `1h`
    pub width: String,

    /// Fields aggregated by this tier, all metric fields when absent
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn default_data_dir() -> PathBuf { PathBuf::from("./data/rollups") }
fn default_raw_dir() -> PathBuf { PathBuf::from("./data/raw") }
fn default_max_points() -> u64 { 500 }
fn default_catch_up_max_buckets() -> u64 { 1440 }
fn default_workers() -> usize { 4 }
fn default_refresh_interval_secs() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_reducers() -> Vec<Reducer> { vec![Reducer::Avg] }

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            metrics: default_metrics(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raw_dir: default_raw_dir(),
            max_points: default_max_points(),
            catch_up_max_buckets: default_catch_up_max_buckets(),
            freshness_policy: FreshnessPolicy::default(),
            worker_pool_size: default_workers(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Default Metrics
// ============================================================================

fn field(name: &str, reducers: &[Reducer]) -> FieldConfig {
    FieldConfig {
        name: name.to_string(),
        reducers: reducers.to_vec(),
    }
}

fn tiers(ids: &[&str]) -> Vec<TierConfig> {
    ids.iter()
        .map(|id| TierConfig {
            id: id.to_string(),
            width: id.to_string(),
            fields: None,
        })
        .collect()
}

/// Tier chains for the wearable metrics
pub fn default_metrics() -> Vec<MetricConfig> {
    use Reducer::{Avg, Max, Min, Sum};

    vec![
        MetricConfig {
            name: "heart_rate".to_string(),
            cadence: "1s".to_string(),
            fields: vec![
                field("value", &[Avg, Min, Max]),
                field("resting_heart_rate", &[Avg]),
            ],
            tiers: tiers(&["1m", "1h", "1d", "1w"]),
        },
        MetricConfig {
            name: "spo2".to_string(),
            cadence: "1m".to_string(),
            fields: vec![field("value", &[Avg, Min, Max])],
            tiers: tiers(&["1h", "1d", "1w"]),
        },
        MetricConfig {
            name: "hrv".to_string(),
            cadence: "5m".to_string(),
            fields: vec![
                field("rmssd", &[Avg, Min, Max]),
                field("hf", &[Avg]),
                field("lf", &[Avg]),
                field("coverage", &[Avg]),
            ],
            tiers: tiers(&["1h", "1d", "1w"]),
        },
        MetricConfig {
            name: "breathing_rate".to_string(),
            cadence: "1d".to_string(),
            fields: vec![
                field("full_sleep_rate", &[Avg, Min, Max]),
                field("deep_sleep_rate", &[Avg]),
                field("rem_sleep_rate", &[Avg]),
                field("light_sleep_rate", &[Avg]),
            ],
            tiers: tiers(&["1w"]),
        },
        MetricConfig {
            name: "active_zone_minutes".to_string(),
            cadence: "1m".to_string(),
            fields: vec![
                field("fat_burn_minutes", &[Sum]),
                field("cardio_minutes", &[Sum]),
                field("peak_minutes", &[Sum]),
                field("active_zone_minutes", &[Sum]),
            ],
            tiers: tiers(&["1h", "1d", "1w"]),
        },
    ]
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl MetricConfig {
    /// Resolve durations and field subsets into a metric definition
    pub fn to_definition(&self) -> Result<MetricDefinition> {
        let context = |e: String| Error::Configuration(format!("metric '{}': {}", self.name, e));
        let cadence_ms = parse_duration_ms(&self.cadence).map_err(context)?;

        let mut tiers = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            let bucket_width_ms = parse_duration_ms(&tier.width).map_err(context)?;
            let aggregation_fields = match &tier.fields {
                None => self
                    .fields
                    .iter()
                    .map(|f| AggregationField::new(f.name.as_str(), &f.reducers))
                    .collect(),
                Some(names) => {
                    let mut selected = Vec::with_capacity(names.len());
                    for name in names {
                        let field = self.fields.iter().find(|f| &f.name == name).ok_or_else(|| {
                            context(format!("tier '{}' names unknown field '{}'", tier.id, name))
                        })?;
                        selected.push(AggregationField::new(field.name.as_str(), &field.reducers));
                    }
                    selected
                },
            };
            tiers.push(TierDefinition {
                id: tier.id.clone(),
                bucket_width_ms,
                aggregation_fields,
            });
        }

        Ok(MetricDefinition {
            name: self.name.clone(),
            cadence_ms,
            tiers,
        })
    }
}

impl ApplicationConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::Configuration(format!("{}: {}", path.display(), msg))
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Load from defaults plus environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("ROLLUP_DATA_DIR") {
            self.engine.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ROLLUP_RAW_DIR") {
            self.engine.raw_dir = PathBuf::from(dir);
        }
        if let Ok(max_points) = std::env::var("ROLLUP_MAX_POINTS") {
            if let Ok(p) = max_points.parse() {
                self.engine.max_points = p;
            }
        }
        if let Ok(workers) = std::env::var("ROLLUP_WORKERS") {
            if let Ok(w) = workers.parse() {
                self.engine.worker_pool_size = w;
            }
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Metric definitions with durations resolved
    pub fn metric_definitions(&self) -> Result<Vec<MetricDefinition>> {
        self.metrics.iter().map(MetricConfig::to_definition).collect()
    }

    /// Validated rollup hierarchy
    pub fn hierarchy(&self) -> Result<RollupHierarchy> {
        RollupHierarchy::new(self.metric_definitions()?)
    }

    /// Retry policy for refresh steps
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Configuration(msg.to_string()));

        if self.engine.data_dir.as_os_str().is_empty() {
            return fail("Data directory cannot be empty");
        }
        if self.engine.raw_dir.as_os_str().is_empty() {
            return fail("Raw directory cannot be empty");
        }
        if self.engine.max_points == 0 {
            return fail("max_points must be > 0");
        }
        if self.engine.worker_pool_size == 0 {
            return fail("worker_pool_size must be > 0");
        }
        if self.engine.refresh_interval_secs == 0 {
            return fail("refresh_interval_secs must be > 0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return fail("max_backoff_ms must be >= initial_backoff_ms");
        }
        if self.metrics.is_empty() {
            return fail("At least one metric must be configured");
        }

        let mut names = HashSet::new();
        for metric in &self.metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "metric '{}' defined twice",
                    metric.name
                )));
            }
        }

        self.hierarchy().map(|_| ())
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))
    }
}
