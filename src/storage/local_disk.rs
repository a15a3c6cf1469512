//! Local disk aggregate store
//!
//! Persists each materialized series as one JSON segment holding both its
//! records and its watermark, so a commit is a single file replacement.
//!
//! # Directory Structure
//!
//! ```text
//! base_path/
//!   {metric}/
//!     {tier}/
//!       {entity}.json   - records + watermark
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use vitals_rollup::storage::{AggregateStore, LocalDiskAggregateStore};
//! use vitals_rollup::types::TierKey;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = LocalDiskAggregateStore::new("/tmp/rollups")?;
//! let key = TierKey::new("heart_rate", "1h", "user-1");
//! assert!(store.watermark(&key).await?.is_none());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use super::memory::TierSeries;
use super::{AggregateStore, TierUsage};
use crate::error::StoreError;
use crate::rollup::record::AggregateRecord;
use crate::rollup::watermark::{KeyLocks, Watermark};
use crate::types::{TierKey, TimeRange};

const SEGMENT_VERSION: u32 = 1;
const SEGMENT_EXTENSION: &str = "json";

/// On-disk form of one tier series
#[derive(Debug, Serialize, Deserialize)]
struct Segment {
    version: u32,
    key: TierKey,
    watermark: Option<Watermark>,
    records: Vec<AggregateRecord>,
}

/// Aggregate store backed by the local filesystem
///
/// Segments are cached after first access. A commit writes the new segment
/// to a unique temp file and renames it over the old one, then swaps the
/// cache entry, so readers see either the old or the new state.
pub struct LocalDiskAggregateStore {
    /// Base directory for all segments
    base_path: PathBuf,

    /// Loaded segments
    cache: DashMap<TierKey, Arc<TierSeries>>,

    /// Serializes read-modify-write of a segment
    write_locks: KeyLocks,
}

impl LocalDiskAggregateStore {
    /// Create a store rooted at `base_path`
    ///
    /// Creates the base directory if it doesn't exist.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            cache: DashMap::new(),
            write_locks: KeyLocks::new(),
        })
    }

    /// Base directory of the store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn segment_path(&self, key: &TierKey) -> Result<PathBuf, StoreError> {
        let metric = path_component(&key.metric)?;
        let tier = path_component(&key.tier)?;
        let entity = path_component(&key.entity)?;
        Ok(self
            .base_path
            .join(metric)
            .join(tier)
            .join(format!("{}.{}", entity, SEGMENT_EXTENSION)))
    }

    async fn load(&self, key: &TierKey) -> Result<Arc<TierSeries>, StoreError> {
        if let Some(series) = self.cache.get(key) {
            return Ok(Arc::clone(series.value()));
        }

        let path = self.segment_path(key)?;
        let series = match fs::read(&path).await {
            Ok(bytes) => {
                let segment: Segment = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::CorruptedData(format!("{}: {}", path.display(), e))
                })?;
                if segment.version != SEGMENT_VERSION {
                    return Err(StoreError::CorruptedData(format!(
                        "{}: unsupported segment version {}",
                        path.display(),
                        segment.version
                    )));
                }
                if &segment.key != key {
                    return Err(StoreError::CorruptedData(format!(
                        "{}: segment belongs to {}",
                        path.display(),
                        segment.key
                    )));
                }
                TierSeries {
                    records: segment
                        .records
                        .into_iter()
                        .map(|r| (r.bucket_start, r))
                        .collect(),
                    watermark: segment.watermark,
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TierSeries::default(),
            Err(e) => return Err(e.into()),
        };

        let series = Arc::new(series);
        // Another reader may have loaded it meanwhile; keep whichever came first
        let entry = self
            .cache
            .entry(key.clone())
            .or_insert_with(|| Arc::clone(&series));
        Ok(Arc::clone(entry.value()))
    }

    async fn persist(&self, key: &TierKey, series: &TierSeries) -> Result<(), StoreError> {
        let path = self.segment_path(key)?;
        let segment = Segment {
            version: SEGMENT_VERSION,
            key: key.clone(),
            watermark: series.watermark,
            records: series.records.values().cloned().collect(),
        };
        let contents = serde_json::to_vec(&segment)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", key, e)))?;

        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&dir).await?;

        // Atomic write: write to unique temp file, then rename
        let temp_path = dir.join(format!(
            ".segment.{}.{}.tmp",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::write(&temp_path, contents).await?;

        let rename_result = fs::rename(&temp_path, &path).await;
        if rename_result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        rename_result?;
        Ok(())
    }

    async fn scan_keys(&self, metric: &str) -> Result<Vec<TierKey>, StoreError> {
        let metric_dir = self.base_path.join(path_component(metric)?);
        let mut keys = Vec::new();

        let mut tiers = match fs::read_dir(&metric_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(tier_entry) = tiers.next_entry().await? {
            if !tier_entry.file_type().await?.is_dir() {
                continue;
            }
            let tier = tier_entry.file_name().to_string_lossy().to_string();
            let mut files = fs::read_dir(tier_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                    continue;
                }
                if let Some(entity) = path.file_stem().and_then(|s| s.to_str()) {
                    if !entity.starts_with('.') {
                        keys.push(TierKey::new(metric, tier.as_str(), entity));
                    }
                }
            }
        }

        Ok(keys)
    }
}

/// Check that a key component is safe to use as a file name
fn path_component(component: &str) -> Result<&str, StoreError> {
    let invalid = component.is_empty()
        || component.starts_with('.')
        || component
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control());
    if invalid {
        return Err(StoreError::InvalidKey(format!(
            "'{}' cannot be used as a path component",
            component
        )));
    }
    Ok(component)
}

#[async_trait]
impl AggregateStore for LocalDiskAggregateStore {
    async fn read_records(
        &self,
        key: &TierKey,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        Ok(self.load(key).await?.read(range))
    }

    async fn watermark(&self, key: &TierKey) -> Result<Option<Watermark>, StoreError> {
        Ok(self.load(key).await?.watermark)
    }

    async fn commit(
        &self,
        key: &TierKey,
        range: TimeRange,
        records: Vec<AggregateRecord>,
        watermark: Watermark,
    ) -> Result<(), StoreError> {
        let _guard = self.write_locks.lock(key).await;

        let loaded = self.load(key).await?;
        let mut series = TierSeries::clone(&loaded);
        let written = records.len();
        series.apply(range, records, watermark);
        self.persist(key, &series).await?;
        self.cache.insert(key.clone(), Arc::new(series));

        debug!(key = %key, records = written, through = watermark.materialized_through, "Segment committed");
        Ok(())
    }

    async fn usage(&self, key: &TierKey) -> Result<TierUsage, StoreError> {
        let mut usage = self.load(key).await?.usage();
        if let Ok(meta) = fs::metadata(self.segment_path(key)?).await {
            usage.approx_size_bytes = meta.len();
        }
        Ok(usage)
    }

    async fn list_keys(&self, metric: &str) -> Result<Vec<TierKey>, StoreError> {
        let mut keys = self.scan_keys(metric).await?;
        for entry in self.cache.iter() {
            if entry.key().metric == metric && entry.value().watermark.is_some() {
                keys.push(entry.key().clone());
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_component_rejects_traversal() {
        assert!(path_component("user-1").is_ok());
        assert!(path_component("..").is_err());
        assert!(path_component("a/b").is_err());
        assert!(path_component("").is_err());
        assert!(path_component(".hidden").is_err());
    }

    #[tokio::test]
    async fn test_invalid_entity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskAggregateStore::new(dir.path()).unwrap();
        let key = TierKey::new("spo2", "1h", "../escape");
        assert!(matches!(
            store.watermark(&key).await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_segment_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskAggregateStore::new(dir.path()).unwrap();
        let key = TierKey::new("spo2", "1h", "u");
        assert!(store.watermark(&key).await.unwrap().is_none());
        assert!(store.list_keys("spo2").await.unwrap().is_empty());
    }

    fn record(bucket_start: i64, value: f64) -> AggregateRecord {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            "value".to_string(),
            crate::rollup::record::FieldStats::from_value(value),
        );
        AggregateRecord {
            metric: "spo2".to_string(),
            tier: "1h".to_string(),
            entity: "u".to_string(),
            bucket_start,
            sample_count: 1,
            fields,
        }
    }

    #[tokio::test]
    async fn test_commit_over_existing_segment_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = TierKey::new("spo2", "1h", "u");
        let hour = 3_600_000;

        let store = LocalDiskAggregateStore::new(dir.path()).unwrap();
        let first = TimeRange::new_unchecked(0, 2 * hour);
        let w1 = Watermark::advanced(None, first, None);
        store
            .commit(&key, first, vec![record(0, 95.0), record(hour, 96.0)], w1)
            .await
            .unwrap();

        // Second commit starts from the cached segment
        let second = TimeRange::new_unchecked(hour, 3 * hour);
        let w2 = Watermark::advanced(Some(&w1), second, None);
        store
            .commit(&key, second, vec![record(hour, 99.0), record(2 * hour, 97.0)], w2)
            .await
            .unwrap();

        let reopened = LocalDiskAggregateStore::new(dir.path()).unwrap();
        let records = reopened
            .read_records(&key, TimeRange::new_unchecked(0, 3 * hour))
            .await
            .unwrap();
        let avgs: Vec<f64> = records
            .iter()
            .filter_map(|r| r.value("value", crate::rollup::record::Reducer::Avg))
            .collect();
        assert_eq!(avgs, vec![95.0, 99.0, 97.0]);
        assert_eq!(
            reopened.watermark(&key).await.unwrap().map(|w| w.materialized_through),
            Some(3 * hour)
        );
        assert_eq!(reopened.list_keys("spo2").await.unwrap(), vec![key]);
    }
}
