//! Query execution over the tier chain
//!
//! A query is answered from the resolution the selector picks. Points inside
//! the chosen tier's materialized window come straight from stored records.
//! Edges outside it (the newest bucket still filling, or a backlog the
//! catch-up declined) are folded from raw on the fly when small enough and
//! flagged `provisional`; they are never persisted. Edges too large to fold
//! are left out and the answer is marked stale.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, RangeError, Result};
use crate::metrics;
use crate::rollup::hierarchy::{HierarchyManager, TierDefinition};
use crate::rollup::record::AggregateRecord;
use crate::rollup::selector::{Freshness, Resolution, ResolutionSelector, TierSelection};
use crate::storage::AggregateStore;
use crate::types::{RawSample, TierKey, TimeRange, Timestamp};

/// One point of a query answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPoint {
    /// Bucket start, or the sample timestamp for raw answers
    pub timestamp: Timestamp,

    /// Raw samples behind the point
    pub sample_count: u64,

    /// `{field}_{reducer}` for tiers, `{field}` for raw samples
    pub values: BTreeMap<String, f64>,

    /// Computed at query time rather than read from the tier
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
}

/// Answer to a query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    /// Metric name
    pub metric: String,

    /// Entity identifier
    pub entity: String,

    /// Requested range
    pub range: TimeRange,

    /// Resolution the points come from
    pub resolution: Resolution,

    /// Width of each point (native cadence for raw)
    pub bucket_width_ms: i64,

    /// How current the answer is
    pub freshness: Freshness,

    /// Points ordered by timestamp
    pub points: Vec<QueryPoint>,

    /// Parts of the range not served from materialized records
    pub stale_ranges: Vec<TimeRange>,

    /// Raw answers cut at the point limit
    pub truncated: bool,
}

/// Answers range queries for one metric and entity at a time
pub struct QueryEngine {
    selector: Arc<ResolutionSelector>,
    manager: Arc<HierarchyManager>,
    aggregates: Arc<dyn AggregateStore>,
}

impl QueryEngine {
    /// Create a query engine
    pub fn new(
        selector: Arc<ResolutionSelector>,
        manager: Arc<HierarchyManager>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            selector,
            manager,
            aggregates,
        }
    }

    /// The resolution selector
    pub fn selector(&self) -> &Arc<ResolutionSelector> {
        &self.selector
    }

    async fn check_history(&self, metric: &str, entity: &str, range: TimeRange) -> Result<()> {
        let raw = self.manager.raw();
        let latest = raw
            .latest_timestamp(metric, entity)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let earliest = raw
            .earliest_timestamp(metric, entity)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;

        let retained = latest.map(|latest| {
            TimeRange::new_unchecked(earliest.unwrap_or(i64::MIN), latest.saturating_add(1))
        });
        match retained {
            Some(r) if r.intersect(&range).is_some() => Ok(()),
            _ => Err(RangeError::OutsideHistory {
                metric: metric.to_string(),
                entity: entity.to_string(),
                start: range.start,
                end: range.end,
            }
            .into()),
        }
    }

    /// Answer a query with at most about `max_points` points
    pub async fn query(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
        max_points: u64,
    ) -> Result<QueryResponse> {
        self.manager.hierarchy().metric(metric)?;
        self.check_history(metric, entity, range).await?;

        let selection = self
            .selector
            .select_tier(metric, entity, range, max_points)
            .await?;

        let response = match &selection.resolution {
            Resolution::Raw => {
                let mut response = self
                    .raw_response(metric, entity, range, max_points as usize)
                    .await?;
                response.bucket_width_ms = selection.bucket_width_ms;
                response
            },
            Resolution::Tier { index, .. } => {
                let chain = self.manager.get_tier_chain(metric)?;
                let tier = &chain[*index];
                self.tier_response(metric, entity, range, tier, &selection)
                    .await?
            },
        };

        metrics::record_query(
            metric,
            response.resolution.label(),
            response.freshness.as_str(),
        );
        debug!(
            metric,
            entity,
            resolution = %response.resolution,
            points = response.points.len(),
            freshness = %response.freshness,
            "Query answered"
        );
        Ok(response)
    }

    /// Raw samples in `range`, at most `limit` of them
    pub async fn query_raw(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<QueryResponse> {
        let definition = self.manager.hierarchy().metric(metric)?;
        let cadence = definition.cadence_ms;
        self.check_history(metric, entity, range).await?;

        let mut response = self.raw_response(metric, entity, range, limit).await?;
        response.bucket_width_ms = cadence;
        metrics::record_query(metric, "raw", response.freshness.as_str());
        Ok(response)
    }

    async fn raw_response(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<QueryResponse> {
        let mut samples = self
            .manager
            .raw()
            .read_raw(metric, entity, range)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;

        let truncated = samples.len() > limit;
        samples.truncate(limit);

        Ok(QueryResponse {
            metric: metric.to_string(),
            entity: entity.to_string(),
            range,
            resolution: Resolution::Raw,
            bucket_width_ms: 0,
            freshness: Freshness::Complete,
            points: samples.iter().map(raw_point).collect(),
            stale_ranges: Vec::new(),
            truncated,
        })
    }

    async fn tier_response(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
        tier: &TierDefinition,
        selection: &TierSelection,
    ) -> Result<QueryResponse> {
        let width = tier.bucket_width_ms;
        let wanted = range.align_outward(width);
        let key = TierKey::new(metric, tier.id.as_str(), entity);

        let mut points: Vec<QueryPoint> = match selection.coverage.and_then(|c| c.intersect(&wanted)) {
            Some(covered) => self
                .aggregates
                .read_records(&key, covered)
                .await?
                .iter()
                .map(|r| tier_point(r, tier, false))
                .collect(),
            None => Vec::new(),
        };

        let mut freshness = selection.freshness;
        let bound = self.selector.catch_up_max_buckets();
        for gap in &selection.uncovered {
            if gap.bucket_count(width) > bound {
                debug!(key = %key, gap = %gap, "Uncovered range too large to fold at query time");
                freshness = Freshness::Stale;
                continue;
            }
            let records = self
                .manager
                .fold_from_raw(metric, tier, entity, *gap)
                .await?;
            points.extend(records.iter().map(|r| tier_point(r, tier, true)));
        }
        points.sort_by_key(|p| p.timestamp);

        Ok(QueryResponse {
            metric: metric.to_string(),
            entity: entity.to_string(),
            range,
            resolution: selection.resolution.clone(),
            bucket_width_ms: width,
            freshness,
            points,
            stale_ranges: selection.uncovered.clone(),
            truncated: false,
        })
    }
}

fn raw_point(sample: &RawSample) -> QueryPoint {
    QueryPoint {
        timestamp: sample.timestamp,
        sample_count: 1,
        values: sample.fields.clone(),
        provisional: false,
    }
}

fn tier_point(record: &AggregateRecord, tier: &TierDefinition, provisional: bool) -> QueryPoint {
    let mut values = BTreeMap::new();
    for field in &tier.aggregation_fields {
        for reducer in &field.reducers {
            if let Some(value) = record.value(&field.name, *reducer) {
                values.insert(format!("{}_{}", field.name, reducer), value);
            }
        }
    }
    QueryPoint {
        timestamp: record.bucket_start,
        sample_count: record.sample_count,
        values,
        provisional,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::hierarchy::AggregationField;
    use crate::rollup::record::{FieldStats, Reducer};

    #[test]
    fn test_tier_point_exposes_configured_reducers() {
        let tier = TierDefinition {
            id: "1h".to_string(),
            bucket_width_ms: 3_600_000,
            aggregation_fields: vec![AggregationField::new("value", &[Reducer::Avg, Reducer::Max])],
        };
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldStats::from_values([60.0, 80.0]).unwrap());
        let record = AggregateRecord {
            metric: "heart_rate".to_string(),
            tier: "1h".to_string(),
            entity: "u".to_string(),
            bucket_start: 0,
            sample_count: 2,
            fields,
        };

        let point = tier_point(&record, &tier, false);
        assert_eq!(point.values.len(), 2);
        assert_eq!(point.values["value_avg"], 70.0);
        assert_eq!(point.values["value_max"], 80.0);
        assert!(!point.values.contains_key("value_min"));
    }

    #[test]
    fn test_provisional_flag_only_serialized_when_set() {
        let point = QueryPoint {
            timestamp: 0,
            sample_count: 1,
            values: BTreeMap::new(),
            provisional: false,
        };
        let json = serde_json::to_string(&point).unwrap();
        assert!(!json.contains("provisional"));
    }
}
