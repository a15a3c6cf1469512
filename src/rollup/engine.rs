//! Engine assembly
//!
//! Wires the hierarchy, stores, scheduler, selector and reporters together.
//! Every component shares one [`StalenessTracker`] so per-key locks are common
//! to refreshes, catch-ups and the background service.

use std::sync::Arc;

use tracing::info;

use crate::config::ApplicationConfig;
use crate::error::{Error, Result};
use crate::rollup::hierarchy::{HierarchyManager, MetricDefinition, RollupHierarchy};
use crate::rollup::pool::RefreshWorkerPool;
use crate::rollup::query::QueryEngine;
use crate::rollup::scheduler::{RefreshScheduler, RetryPolicy};
use crate::rollup::selector::{FreshnessPolicy, ResolutionSelector};
use crate::rollup::stats::StatsReporter;
use crate::rollup::watermark::StalenessTracker;
use crate::storage::{AggregateStore, JsonLinesRawStore, LocalDiskAggregateStore, RawSeriesStore};

/// A fully wired rollup engine
pub struct RollupEngine {
    hierarchy: Arc<RollupHierarchy>,
    raw: Arc<dyn RawSeriesStore>,
    aggregates: Arc<dyn AggregateStore>,
    tracker: Arc<StalenessTracker>,
    scheduler: Arc<RefreshScheduler>,
    query: QueryEngine,
    stats: StatsReporter,
    pool: RefreshWorkerPool,
    max_points: u64,
}

impl RollupEngine {
    /// Start building an engine
    pub fn builder() -> RollupEngineBuilder {
        RollupEngineBuilder::new()
    }

    /// Validated metric definitions
    pub fn hierarchy(&self) -> &Arc<RollupHierarchy> {
        &self.hierarchy
    }

    /// Raw series the engine reads
    pub fn raw_store(&self) -> &Arc<dyn RawSeriesStore> {
        &self.raw
    }

    /// Materialized tiers
    pub fn aggregate_store(&self) -> &Arc<dyn AggregateStore> {
        &self.aggregates
    }

    /// Watermarks, staleness and per-key locks
    pub fn tracker(&self) -> &Arc<StalenessTracker> {
        &self.tracker
    }

    /// Refresh planning and execution
    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    /// Query answering
    pub fn query(&self) -> &QueryEngine {
        &self.query
    }

    /// Tier telemetry
    pub fn stats(&self) -> &StatsReporter {
        &self.stats
    }

    /// Parallel refresh execution
    pub fn pool(&self) -> &RefreshWorkerPool {
        &self.pool
    }

    /// Default point budget for queries
    pub fn max_points(&self) -> u64 {
        self.max_points
    }
}

/// Builder for [`RollupEngine`]
pub struct RollupEngineBuilder {
    definitions: Vec<MetricDefinition>,
    raw: Option<Arc<dyn RawSeriesStore>>,
    aggregates: Option<Arc<dyn AggregateStore>>,
    retry: RetryPolicy,
    policy: FreshnessPolicy,
    catch_up_max_buckets: u64,
    workers: usize,
    max_points: u64,
}

impl Default for RollupEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RollupEngineBuilder {
    /// Create a builder with default settings and no stores
    pub fn new() -> Self {
        let engine = crate::config::EngineConfig::default();
        Self {
            definitions: Vec::new(),
            raw: None,
            aggregates: None,
            retry: RetryPolicy::default(),
            policy: engine.freshness_policy,
            catch_up_max_buckets: engine.catch_up_max_buckets,
            workers: engine.worker_pool_size,
            max_points: engine.max_points,
        }
    }

    /// Take every setting from a configuration, with on-disk stores
    pub fn from_config(config: &ApplicationConfig) -> Result<Self> {
        let aggregates = LocalDiskAggregateStore::new(&config.engine.data_dir).map_err(|e| {
            Error::Configuration(format!(
                "cannot open data_dir {}: {}",
                config.engine.data_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            definitions: config.metric_definitions()?,
            raw: Some(Arc::new(JsonLinesRawStore::new(&config.engine.raw_dir))),
            aggregates: Some(Arc::new(aggregates)),
            retry: config.retry_policy(),
            policy: config.engine.freshness_policy,
            catch_up_max_buckets: config.engine.catch_up_max_buckets,
            workers: config.engine.worker_pool_size,
            max_points: config.engine.max_points,
        })
    }

    /// Add a metric definition
    pub fn with_metric(mut self, definition: MetricDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Replace all metric definitions
    pub fn with_metrics(mut self, definitions: Vec<MetricDefinition>) -> Self {
        self.definitions = definitions;
        self
    }

    /// Set the raw series store
    pub fn with_raw_store(mut self, raw: Arc<dyn RawSeriesStore>) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Set the aggregate store
    pub fn with_aggregate_store(mut self, aggregates: Arc<dyn AggregateStore>) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the query-path freshness policy
    pub fn with_freshness_policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the catch-up bound
    pub fn with_catch_up_max_buckets(mut self, buckets: u64) -> Self {
        self.catch_up_max_buckets = buckets;
        self
    }

    /// Set the worker pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the default point budget
    pub fn with_max_points(mut self, max_points: u64) -> Self {
        self.max_points = max_points;
        self
    }

    /// Validate the hierarchy and wire all components
    pub fn build(self) -> Result<RollupEngine> {
        let raw = self
            .raw
            .ok_or_else(|| Error::Configuration("No raw store configured".to_string()))?;
        let aggregates = self
            .aggregates
            .ok_or_else(|| Error::Configuration("No aggregate store configured".to_string()))?;
        if self.definitions.is_empty() {
            return Err(Error::Configuration("No metrics configured".to_string()));
        }

        let hierarchy = Arc::new(RollupHierarchy::new(self.definitions)?);
        let manager = Arc::new(HierarchyManager::new(
            Arc::clone(&hierarchy),
            Arc::clone(&raw),
            Arc::clone(&aggregates),
        ));
        let tracker = Arc::new(StalenessTracker::new(
            Arc::clone(&hierarchy),
            Arc::clone(&raw),
            Arc::clone(&aggregates),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&manager),
            Arc::clone(&tracker),
            Arc::clone(&aggregates),
            self.retry,
        ));
        let selector = Arc::new(ResolutionSelector::new(
            Arc::clone(&scheduler),
            self.policy,
            self.catch_up_max_buckets,
        ));

        info!(
            metrics = hierarchy.metrics().count(),
            workers = self.workers,
            policy = ?self.policy,
            "Rollup engine ready"
        );

        Ok(RollupEngine {
            query: QueryEngine::new(selector, Arc::clone(&manager), Arc::clone(&aggregates)),
            stats: StatsReporter::new(manager, Arc::clone(&tracker), Arc::clone(&aggregates)),
            pool: RefreshWorkerPool::new(Arc::clone(&scheduler), self.workers),
            hierarchy,
            raw,
            aggregates,
            tracker,
            scheduler,
            max_points: self.max_points,
        })
    }
}
