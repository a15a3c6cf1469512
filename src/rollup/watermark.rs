//! Watermarks and staleness tracking
//!
//! A watermark records the contiguous window `[materialized_from,
//! materialized_through)` of fully computed buckets for one
//! (metric, tier, entity). Only complete buckets are ever inside the window,
//! so `materialized_through` is always a bucket boundary and a tier can never
//! be fresher than its source.
//!
//! Watermarks only grow. Advancing to a point behind the current watermark is
//! a no-op, which keeps retried or out-of-order refreshes from regressing
//! state.

use crate::error::{Error, Result};
use crate::rollup::hierarchy::RollupHierarchy;
use crate::storage::{AggregateStore, RawSeriesStore};
use crate::types::{align_down, align_up, now_ms, TierKey, TimeRange, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Materialization state of one (metric, tier, entity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Lower edge of the materialized window (inclusive)
    pub materialized_from: Timestamp,

    /// Frontier of fully computed buckets (exclusive)
    pub materialized_through: Timestamp,

    /// Frontier of the source when this tier was last advanced
    pub source_watermark: Option<Timestamp>,

    /// Wall clock time of the last advance
    pub updated_at: Timestamp,
}

impl Watermark {
    /// The materialized window as a range
    pub fn coverage(&self) -> TimeRange {
        TimeRange::new_unchecked(self.materialized_from, self.materialized_through)
    }

    /// Whether `range` overlaps or touches the materialized window
    pub fn adjoins(&self, range: &TimeRange) -> bool {
        range.start <= self.materialized_through && range.end >= self.materialized_from
    }

    /// Watermark after materializing `piece` on top of `current`
    ///
    /// The window only widens; the source frontier only moves forward.
    pub fn advanced(
        current: Option<&Watermark>,
        piece: TimeRange,
        source_watermark: Option<Timestamp>,
    ) -> Watermark {
        match current {
            None => Watermark {
                materialized_from: piece.start,
                materialized_through: piece.end,
                source_watermark,
                updated_at: now_ms(),
            },
            Some(w) => Watermark {
                materialized_from: w.materialized_from.min(piece.start),
                materialized_through: w.materialized_through.max(piece.end),
                source_watermark: match (w.source_watermark, source_watermark) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                },
                updated_at: now_ms(),
            },
        }
    }
}

/// What a tier can be computed from: the window its source has complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceExtent {
    /// Earliest usable source timestamp, `None` when unbounded (raw data)
    pub from: Option<Timestamp>,

    /// Exclusive frontier of complete source data
    pub through: Timestamp,
}

impl SourceExtent {
    /// Extent of raw data whose newest sample is at `latest`
    ///
    /// The newest sample covers one cadence interval, so with a 1s cadence
    /// and a sample at 1:59:59 the minute ending at 2:00 is complete.
    pub fn raw(latest: Timestamp, cadence_ms: i64) -> Self {
        Self {
            from: None,
            through: latest.saturating_add(cadence_ms.max(1)),
        }
    }

    /// Extent of a materialized lower tier
    pub fn tier(watermark: &Watermark) -> Self {
        Self {
            from: Some(watermark.materialized_from),
            through: watermark.materialized_through,
        }
    }

    /// The part of `piece` that can be computed in whole buckets of `width`
    pub fn clip(&self, piece: TimeRange, width: i64) -> Option<TimeRange> {
        let from = self.from.map(|f| align_up(f, width)).unwrap_or(i64::MIN);
        let through = align_down(self.through, width);
        let start = piece.start.max(from);
        let end = piece.end.min(through);
        (start < end).then(|| TimeRange::new_unchecked(start, end))
    }
}

/// Per-key mutual exclusion for refreshes
///
/// Each (metric, tier, entity) gets its own async mutex, so refreshes of the
/// same key serialize while unrelated keys proceed in parallel.
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<TierKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &TierKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &TierKey) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    /// Take exclusive access to `key` only if nobody holds it
    pub fn try_lock(&self, key: &TierKey) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }
}

/// Answers freshness questions about materialized tiers
pub struct StalenessTracker {
    hierarchy: Arc<RollupHierarchy>,
    raw: Arc<dyn RawSeriesStore>,
    aggregates: Arc<dyn AggregateStore>,
    locks: KeyLocks,
}

impl StalenessTracker {
    /// Create a tracker over the given stores
    pub fn new(
        hierarchy: Arc<RollupHierarchy>,
        raw: Arc<dyn RawSeriesStore>,
        aggregates: Arc<dyn AggregateStore>,
    ) -> Self {
        Self {
            hierarchy,
            raw,
            aggregates,
            locks: KeyLocks::new(),
        }
    }

    /// The lock table shared with the refresh scheduler
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Current watermark of a tier, `None` if never materialized
    pub async fn watermark(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
    ) -> Result<Option<Watermark>> {
        self.hierarchy.tier(metric, tier)?;
        let key = TierKey::new(metric, tier, entity);
        Ok(self.aggregates.watermark(&key).await?)
    }

    /// What the tier at `tier_index` can currently be computed from
    ///
    /// For the first tier this is the raw series; for any other tier it is
    /// the materialized window of the tier below. `None` means the source has
    /// nothing yet.
    pub async fn source_extent(
        &self,
        metric: &str,
        tier_index: usize,
        entity: &str,
    ) -> Result<Option<SourceExtent>> {
        if tier_index == 0 {
            let cadence = self.hierarchy.metric(metric)?.cadence_ms;
            let latest = self
                .raw
                .latest_timestamp(metric, entity)
                .await
                .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
            return Ok(latest.map(|latest| SourceExtent::raw(latest, cadence)));
        }

        let chain = self.hierarchy.get_tier_chain(metric)?;
        let below = chain.get(tier_index - 1).ok_or_else(|| {
            Error::Configuration(format!("{} has no tier at index {}", metric, tier_index - 1))
        })?;
        let key = TierKey::new(metric, below.id.as_str(), entity);
        let watermark = self
            .aggregates
            .watermark(&key)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        Ok(watermark.as_ref().map(SourceExtent::tier))
    }

    /// Exclusive frontier of the immediate source of `tier`
    ///
    /// The raw series for the first tier, the tier below otherwise. `None`
    /// when the source holds nothing yet.
    pub async fn source_frontier(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
    ) -> Result<Option<Timestamp>> {
        let (index, _) = self.hierarchy.tier(metric, tier)?;
        Ok(self
            .source_extent(metric, index, entity)
            .await?
            .map(|extent| extent.through))
    }

    /// Whether the tier lags its immediate source by more than one bucket
    ///
    /// A one-bucket lag is tolerated because the newest source bucket may
    /// still be filling.
    pub async fn is_stale(&self, metric: &str, tier: &str, entity: &str) -> Result<bool> {
        Ok(self.lag_ms(metric, tier, entity).await? > 0)
    }

    /// How far beyond the tolerated one-bucket lag the tier trails its source
    ///
    /// Zero when the tier is fresh or its source is empty.
    pub async fn lag_ms(&self, metric: &str, tier: &str, entity: &str) -> Result<i64> {
        let (index, def) = self.hierarchy.tier(metric, tier)?;
        let width = def.bucket_width_ms;

        let Some(source) = self.source_extent(metric, index, entity).await? else {
            return Ok(0);
        };
        let key = TierKey::new(metric, tier, entity);
        let through = match self.aggregates.watermark(&key).await? {
            Some(w) => w.materialized_through,
            None => self.source_floor(metric, entity, &source, width).await?,
        };

        Ok((source.through - through - width).max(0))
    }

    /// Where materialization of a never-refreshed tier would begin
    async fn source_floor(
        &self,
        metric: &str,
        entity: &str,
        source: &SourceExtent,
        width: i64,
    ) -> Result<Timestamp> {
        let from = match source.from {
            Some(from) => Some(from),
            None => self
                .raw
                .earliest_timestamp(metric, entity)
                .await
                .map_err(|e| Error::SourceUnavailable(e.to_string()))?,
        };
        Ok(from
            .map(|f| align_down(f, width))
            .unwrap_or_else(|| align_down(source.through, width) - width))
    }

    /// Move the watermark of a tier forward to `through`
    ///
    /// `through` is clamped to the last bucket boundary its source covers, so
    /// a tier never claims more than the tier below (or the raw series) holds.
    /// A no-op when the clamped value is at or behind the current watermark,
    /// or the source is empty. Returns whether the watermark moved. Callers
    /// must already have materialized every bucket up to `through`; the
    /// refresh scheduler advances watermarks itself as part of each record
    /// commit.
    pub async fn advance(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
        through: Timestamp,
    ) -> Result<bool> {
        let (index, def) = self.hierarchy.tier(metric, tier)?;
        let width = def.bucket_width_ms;
        let key = TierKey::new(metric, tier, entity);

        let Some(source) = self.source_extent(metric, index, entity).await? else {
            debug!(key = %key, through, "Advance without source data ignored");
            return Ok(false);
        };
        let through = through.min(align_down(source.through, width));

        let _guard = self.locks.lock(&key).await;
        let current = self.aggregates.watermark(&key).await?;
        let from = match &current {
            Some(w) => w.materialized_through,
            None => self.source_floor(metric, entity, &source, width).await?,
        };
        if through <= from {
            debug!(key = %key, through, current = from, "Advance behind watermark ignored");
            return Ok(false);
        }

        let piece = TimeRange::new_unchecked(from, through);
        let next = Watermark::advanced(current.as_ref(), piece, Some(source.through));
        // Empty range: nothing is replaced, only the watermark moves
        self.aggregates
            .commit(&key, TimeRange::new_unchecked(through, through), Vec::new(), next)
            .await?;
        Ok(true)
    }
}
