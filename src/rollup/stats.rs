//! Per-tier telemetry
//!
//! Read-only: reporting looks at watermarks and store usage but never
//! triggers a refresh. Each report also refreshes the Prometheus tier gauges.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::metrics;
use crate::rollup::hierarchy::HierarchyManager;
use crate::rollup::watermark::StalenessTracker;
use crate::storage::AggregateStore;
use crate::types::{EntityId, TierKey, Timestamp};

/// Freshness and size of one tier across all entities
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    /// Metric name
    pub metric: String,

    /// Tier identifier
    pub tier: String,

    /// Bucket width in milliseconds
    pub bucket_width_ms: i64,

    /// Entities with materialized state in this tier
    pub entities: usize,

    /// Oldest `materialized_through` across entities
    pub watermark: Option<Timestamp>,

    /// Newest `materialized_through` across entities
    pub newest_watermark: Option<Timestamp>,

    /// Stored records
    pub row_count: u64,

    /// Approximate storage footprint in bytes
    pub approx_size_bytes: u64,

    /// Entities lagging their source by more than one bucket
    pub stale_entities: usize,

    /// Raw samples summarized per stored record
    pub mean_samples_per_bucket: f64,

    /// Wall clock time of the most recent advance
    pub last_refresh: Option<Timestamp>,
}

/// Builds [`TierStats`] reports
pub struct StatsReporter {
    manager: Arc<HierarchyManager>,
    tracker: Arc<StalenessTracker>,
    aggregates: Arc<dyn AggregateStore>,
}

impl StatsReporter {
    /// Create a reporter
    pub fn new(
        manager: Arc<HierarchyManager>,
        tracker: Arc<StalenessTracker>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            manager,
            tracker,
            aggregates,
        }
    }

    /// Entities known for a metric, from raw data and materialized state
    pub async fn entities(&self, metric: &str) -> Result<Vec<EntityId>> {
        self.manager.hierarchy().metric(metric)?;
        let mut entities: BTreeSet<EntityId> = self
            .manager
            .raw()
            .list_entities(metric)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?
            .into_iter()
            .collect();
        for key in self.aggregates.list_keys(metric).await? {
            entities.insert(key.entity);
        }
        Ok(entities.into_iter().collect())
    }

    /// One entry per tier of `metric`, finest first
    pub async fn report(&self, metric: &str) -> Result<Vec<TierStats>> {
        let chain = self.manager.get_tier_chain(metric)?;
        let entities = self.entities(metric).await?;
        let mut report = Vec::with_capacity(chain.len());

        for tier in chain {
            let mut stats = TierStats {
                metric: metric.to_string(),
                tier: tier.id.clone(),
                bucket_width_ms: tier.bucket_width_ms,
                entities: 0,
                watermark: None,
                newest_watermark: None,
                row_count: 0,
                approx_size_bytes: 0,
                stale_entities: 0,
                mean_samples_per_bucket: 0.0,
                last_refresh: None,
            };
            let mut sample_total = 0u64;

            for entity in &entities {
                let key = TierKey::new(metric, tier.id.as_str(), entity.as_str());
                if self.tracker.is_stale(metric, &tier.id, entity).await? {
                    stats.stale_entities += 1;
                }

                let Some(watermark) = self.aggregates.watermark(&key).await? else {
                    continue;
                };
                stats.entities += 1;
                let through = watermark.materialized_through;
                stats.watermark = Some(stats.watermark.map_or(through, |w| w.min(through)));
                stats.newest_watermark =
                    Some(stats.newest_watermark.map_or(through, |w| w.max(through)));
                stats.last_refresh = Some(
                    stats
                        .last_refresh
                        .map_or(watermark.updated_at, |t| t.max(watermark.updated_at)),
                );

                let usage = self.aggregates.usage(&key).await?;
                stats.row_count += usage.row_count;
                stats.approx_size_bytes += usage.approx_size_bytes;
                sample_total += usage.sample_total;
            }

            if stats.row_count > 0 {
                stats.mean_samples_per_bucket = sample_total as f64 / stats.row_count as f64;
            }
            metrics::update_tier(
                metric,
                &tier.id,
                stats.row_count,
                stats.approx_size_bytes,
                stats.stale_entities,
                stats.watermark,
            );
            report.push(stats);
        }

        Ok(report)
    }

    /// Reports for every configured metric, ordered by metric name
    pub async fn report_all(&self) -> Result<Vec<TierStats>> {
        let metrics: Vec<String> = self
            .manager
            .hierarchy()
            .metrics()
            .map(|m| m.name.clone())
            .collect();
        let mut all = Vec::new();
        for metric in metrics {
            all.extend(self.report(&metric).await?);
        }
        Ok(all)
    }
}
