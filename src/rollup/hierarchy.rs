//! Rollup hierarchy: tier chains and folding
//!
//! Each metric owns an ordered chain of tiers, finest first. The first tier
//! is computed from raw samples and every later tier purely from the tier
//! directly below it, so a parent bucket never straddles a child boundary:
//!
//! ```text
//! raw (1s) ──▶ 1m ──▶ 1h ──▶ 1d ──▶ 1w
//! ```
//!
//! Widths strictly increase and each is an integer multiple of the one below.
//! Week-multiple tiers start on Monday 00:00 UTC rather than on the epoch.
//! Chains are validated once, when the hierarchy is built.

use crate::error::{Error, Result};
use crate::rollup::record::{fold_records, fold_samples, AggregateRecord, Reducer};
use crate::storage::{AggregateStore, RawSeriesStore};
use crate::types::{align_down, bucket_origin, format_duration_ms, TierKey, TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A field aggregated by a tier, plus the statistics exposed to queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationField {
    /// Raw field name
    pub name: String,

    /// Statistics returned by queries for this field
    pub reducers: Vec<Reducer>,
}

impl AggregationField {
    /// Create a field exposing the given reducers
    pub fn new(name: impl Into<String>, reducers: &[Reducer]) -> Self {
        Self {
            name: name.into(),
            reducers: reducers.to_vec(),
        }
    }
}

/// One tier of a metric's chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    /// Tier identifier, unique within the metric
    pub id: String,

    /// Bucket width in milliseconds
    pub bucket_width_ms: i64,

    /// Fields materialized by this tier
    pub aggregation_fields: Vec<AggregationField>,
}

impl TierDefinition {
    /// Names of the aggregated fields
    pub fn field_names(&self) -> Vec<String> {
        self.aggregation_fields.iter().map(|f| f.name.clone()).collect()
    }
}

/// Immutable configuration of one metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Metric identifier
    pub name: String,

    /// Native sampling cadence of the raw series in milliseconds
    pub cadence_ms: i64,

    /// Tier chain, finest first
    pub tiers: Vec<TierDefinition>,
}

impl MetricDefinition {
    /// Check the chain invariants
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Configuration(format!("metric '{}': {}", self.name, msg)));

        if self.name.trim().is_empty() {
            return Err(Error::Configuration("metric name cannot be empty".to_string()));
        }
        if self.cadence_ms <= 0 {
            return fail("cadence must be positive".to_string());
        }
        if self.tiers.is_empty() {
            return fail("no tier chain defined".to_string());
        }

        let mut ids = HashSet::new();
        let mut below_width = self.cadence_ms;
        let mut below_fields: Option<HashSet<&str>> = None;

        for (index, tier) in self.tiers.iter().enumerate() {
            if tier.id.trim().is_empty() || tier.id.eq_ignore_ascii_case("raw") {
                return fail(format!("tier {} has a reserved or empty id", index));
            }
            if !ids.insert(tier.id.as_str()) {
                return fail(format!("duplicate tier id '{}'", tier.id));
            }

            let width = tier.bucket_width_ms;
            if index == 0 {
                if width < below_width || width % below_width != 0 {
                    return fail(format!(
                        "first tier '{}' ({}) must be a multiple of the {} cadence",
                        tier.id,
                        format_duration_ms(width),
                        format_duration_ms(below_width)
                    ));
                }
            } else if width <= below_width || width % below_width != 0 {
                return fail(format!(
                    "tier '{}' ({}) must be a strictly larger multiple of {}",
                    tier.id,
                    format_duration_ms(width),
                    format_duration_ms(below_width)
                ));
            }
            if (bucket_origin(width) - bucket_origin(below_width)).rem_euclid(below_width) != 0 {
                return fail(format!(
                    "tier '{}' ({}) starts on Mondays, which {} buckets do not line up with",
                    tier.id,
                    format_duration_ms(width),
                    format_duration_ms(below_width)
                ));
            }

            if tier.aggregation_fields.is_empty() {
                return fail(format!("tier '{}' aggregates no fields", tier.id));
            }
            let mut names = HashSet::new();
            for field in &tier.aggregation_fields {
                if field.name.trim().is_empty() {
                    return fail(format!("tier '{}' has an unnamed field", tier.id));
                }
                if field.reducers.is_empty() {
                    return fail(format!(
                        "field '{}' of tier '{}' exposes no reducers",
                        field.name, tier.id
                    ));
                }
                if !names.insert(field.name.as_str()) {
                    return fail(format!(
                        "field '{}' listed twice in tier '{}'",
                        field.name, tier.id
                    ));
                }
                if let Some(below) = &below_fields {
                    if !below.contains(field.name.as_str()) {
                        return fail(format!(
                            "field '{}' of tier '{}' is not aggregated by the tier below",
                            field.name, tier.id
                        ));
                    }
                }
            }

            below_width = width;
            below_fields = Some(names);
        }

        Ok(())
    }

    /// Position of a tier in the chain
    pub fn tier_index(&self, tier: &str) -> Option<usize> {
        self.tiers.iter().position(|t| t.id == tier)
    }

    /// The finest tier
    pub fn finest(&self) -> &TierDefinition {
        &self.tiers[0]
    }

    /// The coarsest tier
    pub fn coarsest(&self) -> &TierDefinition {
        &self.tiers[self.tiers.len() - 1]
    }
}

/// Validated set of metric definitions, read-only after construction
#[derive(Debug, Clone)]
pub struct RollupHierarchy {
    metrics: BTreeMap<String, MetricDefinition>,
}

impl RollupHierarchy {
    /// Validate and index the given definitions
    ///
    /// Any invalid chain or duplicated metric is a configuration error.
    pub fn new(definitions: Vec<MetricDefinition>) -> Result<Self> {
        let mut metrics = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            let name = definition.name.clone();
            if metrics.insert(name.clone(), definition).is_some() {
                return Err(Error::Configuration(format!("metric '{}' defined twice", name)));
            }
        }
        Ok(Self { metrics })
    }

    /// Definition of a metric
    pub fn metric(&self, metric: &str) -> Result<&MetricDefinition> {
        self.metrics
            .get(metric)
            .ok_or_else(|| Error::Configuration(format!("unknown metric '{}'", metric)))
    }

    /// All metric definitions, ordered by name
    pub fn metrics(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.values()
    }

    /// Ordered tier chain of a metric, finest first
    pub fn get_tier_chain(&self, metric: &str) -> Result<&[TierDefinition]> {
        Ok(&self.metric(metric)?.tiers)
    }

    /// Position and definition of a tier
    pub fn tier(&self, metric: &str, tier: &str) -> Result<(usize, &TierDefinition)> {
        let definition = self.metric(metric)?;
        definition
            .tier_index(tier)
            .map(|index| (index, &definition.tiers[index]))
            .ok_or_else(|| {
                Error::Configuration(format!("metric '{}' has no tier '{}'", metric, tier))
            })
    }
}

/// Computes tier buckets from their sources
///
/// Reads are the only store access here; writing results and advancing
/// watermarks is left to the refresh scheduler.
pub struct HierarchyManager {
    hierarchy: Arc<RollupHierarchy>,
    raw: Arc<dyn RawSeriesStore>,
    aggregates: Arc<dyn AggregateStore>,
}

impl HierarchyManager {
    /// Create a manager reading from the given stores
    pub fn new(
        hierarchy: Arc<RollupHierarchy>,
        raw: Arc<dyn RawSeriesStore>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            hierarchy,
            raw,
            aggregates,
        }
    }

    /// The validated hierarchy
    pub fn hierarchy(&self) -> &Arc<RollupHierarchy> {
        &self.hierarchy
    }

    /// The raw series the first tier is folded from
    pub fn raw(&self) -> &Arc<dyn RawSeriesStore> {
        &self.raw
    }

    /// Ordered tier chain of a metric
    pub fn get_tier_chain(&self, metric: &str) -> Result<&[TierDefinition]> {
        self.hierarchy.get_tier_chain(metric)
    }

    /// Compute one bucket of a tier from its source
    ///
    /// Returns `None` when no source record falls in the bucket.
    pub async fn fold_tier(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
        bucket_start: Timestamp,
    ) -> Result<Option<AggregateRecord>> {
        let (index, definition) = self.hierarchy.tier(metric, tier)?;
        let bucket_start = align_down(bucket_start, definition.bucket_width_ms);
        let bucket = TimeRange::new_unchecked(
            bucket_start,
            bucket_start + definition.bucket_width_ms,
        );
        Ok(self.fold_range(metric, index, entity, bucket).await?.pop())
    }

    /// Compute every bucket of the tier at `tier_index` within `range`
    ///
    /// `range` must be aligned to the tier width. The source is read once for
    /// the whole range; empty buckets produce no record.
    pub async fn fold_range(
        &self,
        metric: &str,
        tier_index: usize,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>> {
        let chain = self.hierarchy.get_tier_chain(metric)?;
        let definition = chain.get(tier_index).ok_or_else(|| {
            Error::Configuration(format!("{} has no tier at index {}", metric, tier_index))
        })?;

        if tier_index == 0 {
            return self.fold_from_raw(metric, definition, entity, range).await;
        }

        let below = &chain[tier_index - 1];
        let key = TierKey::new(metric, below.id.as_str(), entity);
        let children = self
            .aggregates
            .read_records(&key, range)
            .await
            .map_err(|e| Error::SourceUnavailable(format!("tier {}: {}", key, e)))?;

        let width = definition.bucket_width_ms;
        let fields = definition.field_names();
        let mut buckets: BTreeMap<Timestamp, Vec<&AggregateRecord>> = BTreeMap::new();
        for child in &children {
            buckets
                .entry(align_down(child.bucket_start, width))
                .or_default()
                .push(child);
        }

        Ok(buckets
            .into_iter()
            .filter_map(|(start, group)| {
                fold_records(&definition.id, start, &fields, group.into_iter())
            })
            .collect())
    }

    /// Fold raw samples directly into buckets of `definition`
    ///
    /// Used for the first tier, and by the query path for edges that are not
    /// materialized yet. Folding raw at a coarse width gives the same result
    /// as folding through the intermediate tiers.
    pub async fn fold_from_raw(
        &self,
        metric: &str,
        definition: &TierDefinition,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>> {
        let samples = self
            .raw
            .read_raw(metric, entity, range)
            .await
            .map_err(|e| Error::SourceUnavailable(format!("raw {}/{}: {}", metric, entity, e)))?;

        let width = definition.bucket_width_ms;
        let fields = definition.field_names();
        let mut records = Vec::new();
        let mut start = 0;
        while start < samples.len() {
            let bucket = align_down(samples[start].timestamp, width);
            let mut end = start;
            while end < samples.len() && align_down(samples[end].timestamp, width) == bucket {
                end += 1;
            }
            if let Some(record) = fold_samples(
                metric,
                &definition.id,
                entity,
                bucket,
                &fields,
                &samples[start..end],
            ) {
                records.push(record);
            }
            start = end;
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DAY_MS, HOUR_MS, MINUTE_MS, SECOND_MS, WEEK_MS};

    fn field() -> Vec<AggregationField> {
        vec![AggregationField::new("value", &[Reducer::Avg, Reducer::Max])]
    }

    fn tier(id: &str, width: i64) -> TierDefinition {
        TierDefinition {
            id: id.to_string(),
            bucket_width_ms: width,
            aggregation_fields: field(),
        }
    }

    fn metric(tiers: Vec<TierDefinition>) -> MetricDefinition {
        MetricDefinition {
            name: "heart_rate".to_string(),
            cadence_ms: SECOND_MS,
            tiers,
        }
    }

    #[test]
    fn test_valid_chain() {
        let def = metric(vec![
            tier("1m", MINUTE_MS),
            tier("1h", HOUR_MS),
            tier("1d", DAY_MS),
        ]);
        assert!(def.validate().is_ok());
        assert_eq!(def.tier_index("1h"), Some(1));
        assert_eq!(def.finest().id, "1m");
        assert_eq!(def.coarsest().id, "1d");
    }

    #[test]
    fn test_empty_chain_is_configuration_error() {
        let err = RollupHierarchy::new(vec![metric(vec![])]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_widths_must_strictly_increase() {
        let def = metric(vec![tier("1h", HOUR_MS), tier("1m", MINUTE_MS)]);
        assert!(def.validate().is_err());
        let def = metric(vec![tier("a", HOUR_MS), tier("b", HOUR_MS)]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_widths_must_be_integer_multiples() {
        let def = metric(vec![tier("1m", MINUTE_MS), tier("90s", 90 * SECOND_MS)]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_week_tier_children_must_fit_monday_grid() {
        let def = metric(vec![tier("1d", DAY_MS), tier("1w", WEEK_MS)]);
        assert!(def.validate().is_ok());

        // 7h divides a week but not the four days between epoch and Monday
        let def = metric(vec![tier("7h", 7 * HOUR_MS), tier("1w", WEEK_MS)]);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("Monday"));

        let def = metric(vec![tier("1w", WEEK_MS), tier("2w", 2 * WEEK_MS)]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_first_tier_must_fit_cadence() {
        let mut def = metric(vec![tier("1m", MINUTE_MS)]);
        def.cadence_ms = 7 * SECOND_MS;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_duplicate_and_reserved_ids() {
        let def = metric(vec![tier("1m", MINUTE_MS), tier("1m", HOUR_MS)]);
        assert!(def.validate().is_err());
        let def = metric(vec![tier("raw", MINUTE_MS)]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_fields_must_exist_below() {
        let mut upper = tier("1h", HOUR_MS);
        upper.aggregation_fields = vec![AggregationField::new("other", &[Reducer::Avg])];
        let def = metric(vec![tier("1m", MINUTE_MS), upper]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_unknown_metric_and_tier() {
        let hierarchy = RollupHierarchy::new(vec![metric(vec![tier("1m", MINUTE_MS)])]).unwrap();
        assert!(hierarchy.metric("spo2").unwrap_err().is_configuration());
        assert!(hierarchy.tier("heart_rate", "1w").unwrap_err().is_configuration());
        assert_eq!(hierarchy.get_tier_chain("heart_rate").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let def = metric(vec![tier("1m", MINUTE_MS)]);
        assert!(RollupHierarchy::new(vec![def.clone(), def]).is_err());
    }
}
