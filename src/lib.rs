//! vitals-rollup - Tiered rollups for wearable health time series
//!
//! This library maintains pre-aggregated views over raw per-sample series:
//! - Per-metric tier chains (e.g. 1m → 1h → 1d → 1w), each folded from the tier below
//! - Incremental, idempotent and restartable refreshes driven by per-tier watermarks
//! - Resolution selection that picks the cheapest tier within a point budget
//! - Count-weighted averages all the way up the chain
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vitals_rollup::config::ApplicationConfig;
//! use vitals_rollup::rollup::{CancellationToken, RollupEngine};
//! use vitals_rollup::storage::{InMemoryAggregateStore, InMemoryRawStore};
//! use vitals_rollup::types::{RawSample, TimeRange};
//!
//! # #[tokio::main]
//! # async fn main() -> vitals_rollup::Result<()> {
//! let raw = Arc::new(InMemoryRawStore::new());
//! raw.append("spo2", "user-1", (0..180).map(|m| RawSample::single(m * 60_000, 97.0)));
//!
//! let engine = RollupEngine::builder()
//!     .with_metrics(ApplicationConfig::default().metric_definitions()?)
//!     .with_raw_store(raw)
//!     .with_aggregate_store(Arc::new(InMemoryAggregateStore::new()))
//!     .build()?;
//!
//! let cancel = CancellationToken::new();
//! engine.scheduler().refresh("spo2", "1h", "user-1", None, false, &cancel).await?;
//!
//! let range = TimeRange::new(0, 3 * 3_600_000)?;
//! let answer = engine.query().query("spo2", "user-1", range, 10).await?;
//! assert_eq!(answer.resolution.label(), "1h");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod rollup;
pub mod storage;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Background services for periodic refresh
/// Provides service lifecycle management and graceful shutdown
pub mod services;

// Re-export main types
pub use config::ApplicationConfig;
pub use error::{Error, Result};
pub use rollup::{RollupEngine, RollupEngineBuilder};
pub use types::{RawSample, TierKey, TimeRange};
