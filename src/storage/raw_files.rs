//! Raw series exported as JSON lines
//!
//! Each (metric, entity) series is one file, one sample per line:
//!
//! ```text
//! raw_dir/
//!   heart_rate/
//!     user-1.jsonl   {"timestamp": 1700000000000, "fields": {"value": 61.0}}
//! ```
//!
//! Files are parsed on first access and re-read when their size or
//! modification time changes, which covers an exporter appending lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;
use tracing::debug;

use super::RawSeriesStore;
use crate::error::StoreError;
use crate::types::{EntityId, RawSample, TimeRange, Timestamp};

const RAW_EXTENSION: &str = "jsonl";

struct CachedSeries {
    modified: Option<SystemTime>,
    len: u64,
    samples: Arc<Vec<RawSample>>,
}

/// Read-only raw store over a directory of `.jsonl` files
pub struct JsonLinesRawStore {
    root: PathBuf,
    cache: RwLock<HashMap<(String, String), CachedSeries>>,
}

impl JsonLinesRawStore {
    /// Create a store reading from `root`
    ///
    /// A missing root behaves like an empty store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_path(&self, metric: &str, entity: &str) -> Result<PathBuf, StoreError> {
        for part in [metric, entity] {
            if part.is_empty() || part.starts_with('.') || part.contains(['/', '\\']) {
                return Err(StoreError::InvalidKey(format!(
                    "'{}' cannot be used as a path component",
                    part
                )));
            }
        }
        Ok(self
            .root
            .join(metric)
            .join(format!("{}.{}", entity, RAW_EXTENSION)))
    }

    async fn series(&self, metric: &str, entity: &str) -> Result<Arc<Vec<RawSample>>, StoreError> {
        let path = self.series_path(metric, entity)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Arc::new(Vec::new()));
            },
            Err(e) => return Err(e.into()),
        };
        let modified = meta.modified().ok();
        let cache_key = (metric.to_string(), entity.to_string());

        if let Some(cached) = self.cache.read().get(&cache_key) {
            if cached.len == meta.len() && cached.modified == modified {
                return Ok(Arc::clone(&cached.samples));
            }
        }

        let contents = fs::read_to_string(&path).await?;
        let samples = Arc::new(parse_lines(&path, &contents)?);
        debug!(path = %path.display(), samples = samples.len(), "Loaded raw series");

        self.cache.write().insert(
            cache_key,
            CachedSeries {
                modified,
                len: meta.len(),
                samples: Arc::clone(&samples),
            },
        );
        Ok(samples)
    }
}

/// Parse one file, sorting by timestamp and keeping the last duplicate
fn parse_lines(path: &Path, contents: &str) -> Result<Vec<RawSample>, StoreError> {
    let mut samples = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sample: RawSample = serde_json::from_str(line).map_err(|e| {
            StoreError::CorruptedData(format!("{}:{}: {}", path.display(), number + 1, e))
        })?;
        samples.push(sample);
    }

    // Stable sort keeps file order among equal timestamps
    samples.sort_by_key(|s| s.timestamp);
    let mut deduped: Vec<RawSample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match deduped.last_mut() {
            Some(last) if last.timestamp == sample.timestamp => *last = sample,
            _ => deduped.push(sample),
        }
    }
    Ok(deduped)
}

#[async_trait]
impl RawSeriesStore for JsonLinesRawStore {
    async fn read_raw(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<RawSample>, StoreError> {
        let series = self.series(metric, entity).await?;
        let from = series.partition_point(|s| s.timestamp < range.start);
        let to = series.partition_point(|s| s.timestamp < range.end);
        Ok(series[from..to.max(from)].to_vec())
    }

    async fn latest_timestamp(
        &self,
        metric: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        Ok(self.series(metric, entity).await?.last().map(|s| s.timestamp))
    }

    async fn earliest_timestamp(
        &self,
        metric: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        Ok(self.series(metric, entity).await?.first().map(|s| s.timestamp))
    }

    async fn list_entities(&self, metric: &str) -> Result<Vec<EntityId>, StoreError> {
        let dir = self.root.join(metric);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entities = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RAW_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    entities.push(stem.to_string());
                }
            }
        }
        entities.sort();
        Ok(entities)
    }
}
