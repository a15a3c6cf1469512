//! Tiered rollups over raw time series
//!
//! ```text
//! ┌──────────────┐   fold    ┌──────┐   fold    ┌──────┐         ┌──────┐
//! │ raw samples  │ ────────▶ │ 1m   │ ────────▶ │ 1h   │ ──...─▶ │ 1w   │
//! └──────────────┘           └──────┘           └──────┘         └──────┘
//!        ▲                       ▲                  ▲                ▲
//!        └──── RefreshScheduler plans and commits each tier in order ┘
//!
//!   query ──▶ ResolutionSelector ──▶ tier with ≤ max_points buckets
//! ```
//!
//! # Components
//!
//! - [`hierarchy`]: tier chains, validation and folding
//! - [`watermark`]: materialized windows, staleness and per-key locks
//! - [`scheduler`]: incremental, restartable refresh plans
//! - [`selector`]: resolution choice and bounded catch-up
//! - [`query`]: answers built from tiers plus provisional edges
//! - [`stats`]: per-tier telemetry
//! - [`pool`]: parallel refresh jobs
//! - [`engine`]: wiring

pub mod engine;
pub mod hierarchy;
pub mod pool;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod selector;
pub mod stats;
pub mod watermark;

pub use engine::{RollupEngine, RollupEngineBuilder};
pub use hierarchy::{AggregationField, HierarchyManager, MetricDefinition, RollupHierarchy, TierDefinition};
pub use pool::{JobOutcome, RefreshJob, RefreshWorkerPool};
pub use query::{QueryEngine, QueryPoint, QueryResponse};
pub use record::{AggregateRecord, FieldStats, Reducer};
pub use scheduler::{
    CancellationToken, PlanStep, RefreshPlan, RefreshReport, RefreshRequest, RefreshScheduler,
    RetryPolicy, StepState,
};
pub use selector::{Freshness, FreshnessPolicy, Resolution, ResolutionSelector, TierSelection};
pub use stats::{StatsReporter, TierStats};
pub use watermark::{KeyLocks, SourceExtent, StalenessTracker, Watermark};
