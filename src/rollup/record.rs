//! Aggregate records and per-field statistics
//!
//! Every materialized bucket stores all five statistics for each field, even
//! when only some are exposed to queries, because folding the next tier needs
//! `count` as the weight for `avg` and `sum`/`min`/`max` to stay exact.

use crate::types::{EntityId, MetricId, RawSample, TierId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Statistic exposed for an aggregation field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    /// Weighted mean
    Avg,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Sum of values
    Sum,
    /// Number of contributing values
    Count,
}

impl Reducer {
    /// All reducers in canonical order
    pub const ALL: [Reducer; 5] = [
        Reducer::Avg,
        Reducer::Min,
        Reducer::Max,
        Reducer::Sum,
        Reducer::Count,
    ];

    /// Lowercase name used in configs and query output
    pub fn as_str(&self) -> &'static str {
        match self {
            Reducer::Avg => "avg",
            Reducer::Min => "min",
            Reducer::Max => "max",
            Reducer::Sum => "sum",
            Reducer::Count => "count",
        }
    }
}

impl fmt::Display for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reducer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" | "mean" => Ok(Reducer::Avg),
            "min" => Ok(Reducer::Min),
            "max" => Ok(Reducer::Max),
            "sum" => Ok(Reducer::Sum),
            "count" => Ok(Reducer::Count),
            other => Err(format!("unknown reducer '{}'", other)),
        }
    }
}

/// Statistics for one field within one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Mean of all contributing raw values
    pub avg: f64,
    /// Smallest contributing value
    pub min: f64,
    /// Largest contributing value
    pub max: f64,
    /// Sum of contributing values
    pub sum: f64,
    /// Number of raw values behind these statistics
    pub count: u64,
}

impl FieldStats {
    /// Statistics of a single value
    pub fn from_value(value: f64) -> Self {
        Self {
            avg: value,
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    /// Statistics of a set of raw values, `None` if there are none
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut count = 0u64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }

        (count > 0).then(|| Self {
            avg: sum / count as f64,
            min,
            max,
            sum,
            count,
        })
    }

    /// Combine child statistics into the statistics of their parent bucket
    ///
    /// `avg` is the count-weighted mean of the children's averages, never the
    /// plain mean of averages. Returns `None` when no child has any values.
    pub fn merge<'a, I>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a FieldStats>,
    {
        let mut count = 0u64;
        let mut weighted = 0.0;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for part in parts {
            if part.count == 0 {
                continue;
            }
            count += part.count;
            weighted += part.avg * part.count as f64;
            sum += part.sum;
            min = min.min(part.min);
            max = max.max(part.max);
        }

        (count > 0).then(|| Self {
            avg: weighted / count as f64,
            min,
            max,
            sum,
            count,
        })
    }

    /// Value of one statistic
    pub fn get(&self, reducer: Reducer) -> f64 {
        match reducer {
            Reducer::Avg => self.avg,
            Reducer::Min => self.min,
            Reducer::Max => self.max,
            Reducer::Sum => self.sum,
            Reducer::Count => self.count as f64,
        }
    }
}

/// One materialized bucket of one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Metric name
    pub metric: MetricId,

    /// Tier identifier
    pub tier: TierId,

    /// Entity identifier
    pub entity: EntityId,

    /// Start of the bucket (aligned to the tier width)
    pub bucket_start: Timestamp,

    /// Number of raw samples the bucket summarizes
    pub sample_count: u64,

    /// Statistics per aggregation field
    pub fields: BTreeMap<String, FieldStats>,
}

impl AggregateRecord {
    /// Value of `reducer` for `field`, if the field has data in this bucket
    pub fn value(&self, field: &str, reducer: Reducer) -> Option<f64> {
        self.fields.get(field).map(|stats| stats.get(reducer))
    }

    /// Rough in-memory footprint, used for size telemetry
    pub fn approx_size_bytes(&self) -> u64 {
        let fixed = 64 + self.metric.len() + self.tier.len() + self.entity.len();
        let fields: usize = self
            .fields
            .keys()
            .map(|name| name.len() + std::mem::size_of::<FieldStats>() + 16)
            .sum();
        (fixed + fields) as u64
    }
}

/// Fold raw samples of one bucket into a record
///
/// Non-finite values are ignored. Returns `None` for a bucket with no samples;
/// a bucket with samples but none of the requested fields still produces a
/// record carrying its `sample_count`.
pub fn fold_samples<'a, I>(
    metric: &str,
    tier: &str,
    entity: &str,
    bucket_start: Timestamp,
    fields: &[String],
    samples: I,
) -> Option<AggregateRecord>
where
    I: IntoIterator<Item = &'a RawSample>,
{
    let mut sample_count = 0u64;
    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();

    for sample in samples {
        sample_count += 1;
        for field in fields {
            if let Some(value) = sample.fields.get(field) {
                if value.is_finite() {
                    values.entry(field.as_str()).or_default().push(*value);
                }
            }
        }
    }

    if sample_count == 0 {
        return None;
    }

    let fields = values
        .into_iter()
        .filter_map(|(name, vals)| FieldStats::from_values(vals).map(|s| (name.to_string(), s)))
        .collect();

    Some(AggregateRecord {
        metric: metric.to_string(),
        tier: tier.to_string(),
        entity: entity.to_string(),
        bucket_start,
        sample_count,
        fields,
    })
}

/// Fold child-tier records of one bucket into a parent record
///
/// Returns `None` when there are no child records, so empty parent buckets
/// stay absent rather than materializing as zero.
pub fn fold_records<'a, I>(
    tier: &str,
    bucket_start: Timestamp,
    fields: &[String],
    children: I,
) -> Option<AggregateRecord>
where
    I: IntoIterator<Item = &'a AggregateRecord>,
{
    let children: Vec<&AggregateRecord> = children.into_iter().collect();
    let first = children.first()?;

    let sample_count = children.iter().map(|c| c.sample_count).sum();
    let fields = fields
        .iter()
        .filter_map(|name| {
            FieldStats::merge(children.iter().filter_map(|c| c.fields.get(name)))
                .map(|stats| (name.clone(), stats))
        })
        .collect();

    Some(AggregateRecord {
        metric: first.metric.clone(),
        tier: tier.to_string(),
        entity: first.entity.clone(),
        bucket_start,
        sample_count,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(bucket_start: Timestamp, avg: f64, count: u64) -> AggregateRecord {
        let mut fields = BTreeMap::new();
        fields.insert(
            "value".to_string(),
            FieldStats {
                avg,
                min: avg - 1.0,
                max: avg + 1.0,
                sum: avg * count as f64,
                count,
            },
        );
        AggregateRecord {
            metric: "heart_rate".to_string(),
            tier: "1m".to_string(),
            entity: "user-1".to_string(),
            bucket_start,
            sample_count: count,
            fields,
        }
    }

    #[test]
    fn test_reducer_parse() {
        assert_eq!("avg".parse::<Reducer>(), Ok(Reducer::Avg));
        assert_eq!("MAX".parse::<Reducer>(), Ok(Reducer::Max));
        assert!("median".parse::<Reducer>().is_err());
    }

    #[test]
    fn test_from_values() {
        let stats = FieldStats::from_values([60.0, 70.0, 80.0]).unwrap();
        assert_eq!(stats.avg, 70.0);
        assert_eq!(stats.min, 60.0);
        assert_eq!(stats.max, 80.0);
        assert_eq!(stats.sum, 210.0);
        assert_eq!(stats.count, 3);
        assert!(FieldStats::from_values(std::iter::empty()).is_none());
    }

    #[test]
    fn test_merge_is_weighted_not_mean_of_means() {
        let a = FieldStats {
            avg: 10.0,
            min: 10.0,
            max: 10.0,
            sum: 10.0,
            count: 1,
        };
        let b = FieldStats {
            avg: 20.0,
            min: 20.0,
            max: 20.0,
            sum: 60.0,
            count: 3,
        };
        let c = FieldStats {
            avg: 30.0,
            min: 30.0,
            max: 30.0,
            sum: 180.0,
            count: 6,
        };
        let merged = FieldStats::merge([&a, &b, &c]).unwrap();
        // (10*1 + 20*3 + 30*6) / 10, where the mean of means would be 20
        assert_eq!(merged.avg, 25.0);
        assert_eq!(merged.count, 10);
        assert_eq!(merged.sum, 250.0);
        assert_eq!(merged.min, 10.0);
        assert_eq!(merged.max, 30.0);
    }

    #[test]
    fn test_merge_matches_direct_fold() {
        let values = [61.0, 64.0, 90.0, 55.0, 72.0, 73.0, 74.0];
        let direct = FieldStats::from_values(values).unwrap();
        let left = FieldStats::from_values(values[..2].iter().copied()).unwrap();
        let right = FieldStats::from_values(values[2..].iter().copied()).unwrap();
        let merged = FieldStats::merge([&left, &right]).unwrap();
        assert!((merged.avg - direct.avg).abs() < 1e-9);
        assert_eq!(merged.count, direct.count);
        assert_eq!(merged.min, direct.min);
        assert_eq!(merged.max, direct.max);
    }

    #[test]
    fn test_fold_samples_sparse_bucket() {
        let fields = vec!["value".to_string()];
        let empty: Vec<RawSample> = Vec::new();
        assert!(fold_samples("heart_rate", "1m", "u", 0, &fields, &empty).is_none());
    }

    #[test]
    fn test_fold_samples_zero_value_is_a_record() {
        let fields = vec!["value".to_string()];
        let samples = vec![RawSample::single(0, 0.0), RawSample::single(1000, 0.0)];
        let record = fold_samples("azm", "1h", "u", 0, &fields, &samples).unwrap();
        assert_eq!(record.sample_count, 2);
        assert_eq!(record.value("value", Reducer::Sum), Some(0.0));
    }

    #[test]
    fn test_fold_samples_skips_non_finite_and_missing_fields() {
        let fields = vec!["value".to_string(), "resting_heart_rate".to_string()];
        let samples = vec![
            RawSample::single(0, 60.0),
            RawSample::single(1000, f64::NAN),
            RawSample::with_fields(2000, &[("value", 80.0), ("resting_heart_rate", 55.0)]),
        ];
        let record = fold_samples("heart_rate", "1m", "u", 0, &fields, &samples).unwrap();
        assert_eq!(record.sample_count, 3);
        assert_eq!(record.value("value", Reducer::Count), Some(2.0));
        assert_eq!(record.value("value", Reducer::Avg), Some(70.0));
        assert_eq!(record.value("resting_heart_rate", Reducer::Count), Some(1.0));
    }

    #[test]
    fn test_fold_records() {
        let fields = vec!["value".to_string()];
        let children = vec![child(0, 10.0, 1), child(60_000, 20.0, 3)];
        let parent = fold_records("1h", 0, &fields, &children).unwrap();
        assert_eq!(parent.tier, "1h");
        assert_eq!(parent.sample_count, 4);
        assert_eq!(parent.value("value", Reducer::Avg), Some(17.5));
        assert_eq!(parent.value("value", Reducer::Min), Some(9.0));
        assert_eq!(parent.value("value", Reducer::Max), Some(21.0));

        let none: Vec<AggregateRecord> = Vec::new();
        assert!(fold_records("1h", 0, &fields, &none).is_none());
    }
}
