//! Storage interfaces for the rollup engine
//!
//! Two stores sit behind the engine:
//!
//! - [`RawSeriesStore`]: the append-only raw series written by the ingestion
//!   pipeline. The engine only ever reads from it.
//! - [`AggregateStore`]: materialized tier records plus their watermarks.
//!   Only the refresh scheduler writes to it, through [`AggregateStore::commit`],
//!   which replaces a range of records and the watermark in one step.
//!
//! # Implementations
//!
//! - [`InMemoryRawStore`] / [`InMemoryAggregateStore`]: tests and embedding
//! - [`JsonLinesRawStore`]: reads `<raw_dir>/<metric>/<entity>.jsonl` exports
//! - [`LocalDiskAggregateStore`]: one JSON segment per tier key, written
//!   atomically via temp file and rename

pub mod local_disk;
pub mod memory;
pub mod raw_files;

pub use local_disk::LocalDiskAggregateStore;
pub use memory::{InMemoryAggregateStore, InMemoryRawStore};
pub use raw_files::JsonLinesRawStore;

use crate::error::StoreError;
use crate::rollup::record::AggregateRecord;
use crate::rollup::watermark::Watermark;
use crate::types::{EntityId, RawSample, TierKey, TimeRange, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Read-only access to the raw per-sample series
#[async_trait]
pub trait RawSeriesStore: Send + Sync + 'static {
    /// Samples of `metric` for `entity` with timestamps in `range`, ordered by time
    async fn read_raw(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
    ) -> Result<Vec<RawSample>, StoreError>;

    /// Timestamp of the newest sample, `None` if the entity has no data
    async fn latest_timestamp(
        &self,
        metric: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>, StoreError>;

    /// Timestamp of the oldest retained sample, if the backend knows it
    async fn earliest_timestamp(
        &self,
        _metric: &str,
        _entity: &str,
    ) -> Result<Option<Timestamp>, StoreError> {
        Ok(None)
    }

    /// Entities that have raw data for `metric`
    async fn list_entities(&self, metric: &str) -> Result<Vec<EntityId>, StoreError>;
}

/// Size of one materialized series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    /// Number of stored records
    pub row_count: u64,

    /// Approximate storage footprint in bytes
    pub approx_size_bytes: u64,

    /// Sum of `sample_count` over all records
    pub sample_total: u64,
}

/// Storage for materialized tier records and their watermarks
#[async_trait]
pub trait AggregateStore: Send + Sync + 'static {
    /// Records of `key` whose bucket start falls in `range`, ordered by bucket start
    async fn read_records(
        &self,
        key: &TierKey,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>, StoreError>;

    /// Current watermark of `key`, `None` if nothing was ever materialized
    async fn watermark(&self, key: &TierKey) -> Result<Option<Watermark>, StoreError>;

    /// Atomically replace the records of `key` in `range` and set its watermark
    ///
    /// Every existing record whose bucket start falls in `range` is removed,
    /// `records` are inserted, and `watermark` becomes the new watermark. A
    /// reader observes either the whole commit or none of it.
    async fn commit(
        &self,
        key: &TierKey,
        range: TimeRange,
        records: Vec<AggregateRecord>,
        watermark: Watermark,
    ) -> Result<(), StoreError>;

    /// Row count and size of `key`
    async fn usage(&self, key: &TierKey) -> Result<TierUsage, StoreError>;

    /// All keys with materialized state for `metric`
    async fn list_keys(&self, metric: &str) -> Result<Vec<TierKey>, StoreError>;
}
