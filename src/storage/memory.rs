//! In-memory raw and aggregate stores
//!
//! Used by tests and when the engine is embedded in a process that already
//! holds its raw series in memory.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{AggregateStore, RawSeriesStore, TierUsage};
use crate::error::StoreError;
use crate::rollup::record::AggregateRecord;
use crate::rollup::watermark::Watermark;
use crate::types::{EntityId, RawSample, TierKey, TimeRange, Timestamp};

// ============================================================================
// Raw Series
// ============================================================================

/// Raw series held in memory, keyed by (metric, entity)
pub struct InMemoryRawStore {
    /// (metric, entity) -> samples sorted by timestamp
    data: RwLock<HashMap<(String, String), Vec<RawSample>>>,
}

impl InMemoryRawStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Append samples for a series
    ///
    /// Samples may arrive in any order. A sample with the timestamp of an
    /// existing one replaces it, since raw data is assumed deduplicated.
    pub fn append<I>(&self, metric: &str, entity: &str, samples: I)
    where
        I: IntoIterator<Item = RawSample>,
    {
        let mut data = self.data.write();
        let series = data
            .entry((metric.to_string(), entity.to_string()))
            .or_default();

        for sample in samples {
            match series.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
                Ok(pos) => series[pos] = sample,
                Err(pos) => series.insert(pos, sample),
            }
        }
    }

    /// Number of samples stored for a series
    pub fn len(&self, metric: &str, entity: &str) -> usize {
        self.data
            .read()
            .get(&(metric.to_string(), entity.to_string()))
            .map_or(0, Vec::len)
    }

    /// Whether the store holds no samples at all
    pub fn is_empty(&self) -> bool {
        self.data.read().values().all(Vec::is_empty)
    }
}

impl Default for InMemoryRawStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawSeriesStore for InMemoryRawStore {
    async fn read_raw(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<RawSample>, StoreError> {
        let data = self.data.read();
        let Some(series) = data.get(&(metric.to_string(), entity.to_string())) else {
            return Ok(Vec::new());
        };

        let from = series.partition_point(|s| s.timestamp < range.start);
        let to = series.partition_point(|s| s.timestamp < range.end);
        Ok(series[from..to.max(from)].to_vec())
    }

    async fn latest_timestamp(
        &self,
        metric: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        Ok(self
            .data
            .read()
            .get(&(metric.to_string(), entity.to_string()))
            .and_then(|s| s.last())
            .map(|s| s.timestamp))
    }

    async fn earliest_timestamp(
        &self,
        metric: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        Ok(self
            .data
            .read()
            .get(&(metric.to_string(), entity.to_string()))
            .and_then(|s| s.first())
            .map(|s| s.timestamp))
    }

    async fn list_entities(&self, metric: &str) -> Result<Vec<EntityId>, StoreError> {
        let mut entities: Vec<EntityId> = self
            .data
            .read()
            .iter()
            .filter(|((m, _), samples)| m == metric && !samples.is_empty())
            .map(|((_, e), _)| e.clone())
            .collect();
        entities.sort();
        Ok(entities)
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Records and watermark of one tier key
#[derive(Debug, Clone, Default)]
pub(crate) struct TierSeries {
    pub(crate) records: BTreeMap<Timestamp, AggregateRecord>,
    pub(crate) watermark: Option<Watermark>,
}

impl TierSeries {
    /// Replace the records in `range` and set the watermark
    pub(crate) fn apply(
        &mut self,
        range: TimeRange,
        records: Vec<AggregateRecord>,
        watermark: Watermark,
    ) {
        if range.start < range.end {
            let stale: Vec<Timestamp> = self
                .records
                .range(range.start..range.end)
                .map(|(ts, _)| *ts)
                .collect();
            for ts in stale {
                self.records.remove(&ts);
            }
        }
        for record in records {
            self.records.insert(record.bucket_start, record);
        }
        self.watermark = Some(watermark);
    }

    pub(crate) fn read(&self, range: TimeRange) -> Vec<AggregateRecord> {
        if range.start >= range.end {
            return Vec::new();
        }
        self.records
            .range(range.start..range.end)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub(crate) fn usage(&self) -> TierUsage {
        TierUsage {
            row_count: self.records.len() as u64,
            approx_size_bytes: self.records.values().map(|r| r.approx_size_bytes()).sum(),
            sample_total: self.records.values().map(|r| r.sample_count).sum(),
        }
    }
}

/// Aggregate store held entirely in memory
///
/// A commit happens under one write lock, so readers never observe records
/// without their watermark or the reverse.
pub struct InMemoryAggregateStore {
    series: RwLock<HashMap<TierKey, TierSeries>>,
}

impl InMemoryAggregateStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn read_records(
        &self,
        key: &TierKey,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        Ok(self
            .series
            .read()
            .get(key)
            .map(|s| s.read(range))
            .unwrap_or_default())
    }

    async fn watermark(&self, key: &TierKey) -> Result<Option<Watermark>, StoreError> {
        Ok(self.series.read().get(key).and_then(|s| s.watermark))
    }

    async fn commit(
        &self,
        key: &TierKey,
        range: TimeRange,
        records: Vec<AggregateRecord>,
        watermark: Watermark,
    ) -> Result<(), StoreError> {
        self.series
            .write()
            .entry(key.clone())
            .or_default()
            .apply(range, records, watermark);
        Ok(())
    }

    async fn usage(&self, key: &TierKey) -> Result<TierUsage, StoreError> {
        Ok(self
            .series
            .read()
            .get(key)
            .map(TierSeries::usage)
            .unwrap_or_default())
    }

    async fn list_keys(&self, metric: &str) -> Result<Vec<TierKey>, StoreError> {
        let mut keys: Vec<TierKey> = self
            .series
            .read()
            .keys()
            .filter(|k| k.metric == metric)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::record::FieldStats;

    fn record(bucket_start: Timestamp, value: f64) -> AggregateRecord {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldStats::from_value(value));
        AggregateRecord {
            metric: "spo2".to_string(),
            tier: "1h".to_string(),
            entity: "u".to_string(),
            bucket_start,
            sample_count: 1,
            fields,
        }
    }

    fn watermark(from: Timestamp, through: Timestamp) -> Watermark {
        Watermark {
            materialized_from: from,
            materialized_through: through,
            source_watermark: Some(through),
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_raw_append_out_of_order() {
        let store = InMemoryRawStore::new();
        store.append(
            "spo2",
            "u",
            vec![
                RawSample::single(3000, 97.0),
                RawSample::single(1000, 95.0),
                RawSample::single(2000, 96.0),
                RawSample::single(2000, 99.0),
            ],
        );
        assert_eq!(store.len("spo2", "u"), 3);

        let range = TimeRange::new(1500, 3000).unwrap();
        let samples = store.read_raw("spo2", "u", range).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].fields["value"], 99.0);

        assert_eq!(store.earliest_timestamp("spo2", "u").await.unwrap(), Some(1000));
        assert_eq!(store.latest_timestamp("spo2", "u").await.unwrap(), Some(3000));
        assert_eq!(store.latest_timestamp("spo2", "v").await.unwrap(), None);
        assert_eq!(store.list_entities("spo2").await.unwrap(), vec!["u".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_replaces_range_only() {
        let store = InMemoryAggregateStore::new();
        let key = TierKey::new("spo2", "1h", "u");

        store
            .commit(
                &key,
                TimeRange::new(0, 300).unwrap(),
                vec![record(0, 1.0), record(100, 2.0), record(200, 3.0)],
                watermark(0, 300),
            )
            .await
            .unwrap();

        store
            .commit(
                &key,
                TimeRange::new(100, 200).unwrap(),
                vec![record(100, 9.0)],
                watermark(0, 300),
            )
            .await
            .unwrap();

        let all = store
            .read_records(&key, TimeRange::new(0, 1000).unwrap())
            .await
            .unwrap();
        let values: Vec<f64> = all.iter().map(|r| r.fields["value"].avg).collect();
        assert_eq!(values, vec![1.0, 9.0, 3.0]);
        assert_eq!(store.usage(&key).await.unwrap().row_count, 3);
        assert_eq!(store.watermark(&key).await.unwrap(), Some(watermark(0, 300)));
    }

    #[tokio::test]
    async fn test_list_keys_filters_metric() {
        let store = InMemoryAggregateStore::new();
        let a = TierKey::new("spo2", "1h", "u");
        let b = TierKey::new("hrv", "1h", "u");
        for key in [&a, &b] {
            store
                .commit(key, TimeRange::new_unchecked(0, 0), Vec::new(), watermark(0, 0))
                .await
                .unwrap();
        }
        assert_eq!(store.list_keys("spo2").await.unwrap(), vec![a]);
    }
}
