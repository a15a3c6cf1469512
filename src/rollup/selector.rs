//! Resolution selection
//!
//! Picks the tier a query is answered from. Candidates are the raw series
//! (at the metric's native cadence) followed by the tiers finest to coarsest;
//! the first one that spans the range in at most `max_points` buckets wins,
//! and the coarsest tier is the fallback when none does.
//!
//! # Example
//!
//! With tiers `1m → 1h → 1d`, per-second cadence and `max_points = 100`:
//!
//! | Range    | Raw     | 1m    | 1h  | 1d | Chosen |
//! |----------|---------|-------|-----|----|--------|
//! | 90s      | 90      | 2     | 1   | 1  | raw    |
//! | 2 days   | 172800  | 2880  | 48  | 2  | 1h     |
//! | 40 days  | 3456000 | 57600 | 960 | 40 | 1d     |
//!
//! When the chosen tier does not cover the range, the configured
//! [`FreshnessPolicy`] either runs a bounded catch-up refresh or reports the
//! answer as partial.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;
use crate::rollup::hierarchy::MetricDefinition;
use crate::rollup::scheduler::RefreshScheduler;
use crate::types::{align_down, align_up, TierKey, TimeRange};

/// Where query points come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The raw per-sample series
    Raw,

    /// A materialized tier
    Tier {
        /// Tier identifier
        id: String,
        /// Position in the chain
        index: usize,
    },
}

impl Resolution {
    /// `raw` or the tier identifier
    pub fn label(&self) -> &str {
        match self {
            Resolution::Raw => "raw",
            Resolution::Tier { id, .. } => id,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// How current an answer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Every point comes from materialized, complete buckets
    Complete,

    /// Some points were computed on the fly or are still filling
    Partial,

    /// Part of the range could not be served at all
    Stale,
}

impl Freshness {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Complete => "complete",
            Freshness::Partial => "partial",
            Freshness::Stale => "stale",
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the chosen tier does not cover the query range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// Refresh the missing buckets synchronously when the backlog is small
    #[default]
    CatchUp,

    /// Never refresh on the query path; flag the answer as partial
    Annotate,
}

/// Result of resolution selection
#[derive(Debug, Clone, Serialize)]
pub struct TierSelection {
    /// Chosen resolution
    pub resolution: Resolution,

    /// Bucket width of the resolution (native cadence for raw)
    pub bucket_width_ms: i64,

    /// Points the resolution yields at most for the range
    pub bucket_count: u64,

    /// Materialized window of the chosen tier after any catch-up
    pub coverage: Option<TimeRange>,

    /// Parts of the range with retained raw data the tier does not cover
    pub uncovered: Vec<TimeRange>,

    /// Freshness before any query-time fallback
    pub freshness: Freshness,

    /// Whether a catch-up refresh ran
    pub caught_up: bool,
}

/// Pick the candidate resolution for a range, ignoring freshness
///
/// Ranges shorter than the finest tier go to raw. Otherwise the finest
/// candidate spanning the range in at most `max_points` buckets is chosen,
/// falling back to the coarsest tier.
pub fn choose_resolution(
    definition: &MetricDefinition,
    range: &TimeRange,
    max_points: u64,
) -> (Resolution, i64) {
    let max_points = max_points.max(1);
    if range.duration_ms() < definition.finest().bucket_width_ms
        || range.bucket_count(definition.cadence_ms) <= max_points
    {
        return (Resolution::Raw, definition.cadence_ms);
    }

    let index = definition
        .tiers
        .iter()
        .position(|t| range.bucket_count(t.bucket_width_ms) <= max_points)
        .unwrap_or(definition.tiers.len() - 1);
    let tier = &definition.tiers[index];
    (
        Resolution::Tier {
            id: tier.id.clone(),
            index,
        },
        tier.bucket_width_ms,
    )
}

/// Parts of `wanted` outside `coverage`, limited to `history`
pub(crate) fn uncovered_ranges(
    wanted: TimeRange,
    coverage: Option<TimeRange>,
    history: Option<TimeRange>,
) -> Vec<TimeRange> {
    let Some(history) = history else {
        return Vec::new();
    };

    let gaps = match coverage.filter(|c| !c.is_empty()) {
        None => vec![wanted],
        Some(window) => {
            let mut gaps = Vec::with_capacity(2);
            if wanted.start < window.start {
                gaps.push(TimeRange::new_unchecked(
                    wanted.start,
                    window.start.min(wanted.end),
                ));
            }
            if wanted.end > window.end {
                gaps.push(TimeRange::new_unchecked(
                    window.end.max(wanted.start),
                    wanted.end,
                ));
            }
            gaps
        },
    };

    gaps.into_iter()
        .filter_map(|gap| gap.intersect(&history))
        .collect()
}

/// Chooses the tier for a query and keeps it fresh within bounds
pub struct ResolutionSelector {
    scheduler: Arc<RefreshScheduler>,
    policy: FreshnessPolicy,
    catch_up_max_buckets: u64,
}

impl ResolutionSelector {
    /// Create a selector
    ///
    /// `catch_up_max_buckets` bounds the total buckets a synchronous
    /// catch-up may compute across all tiers of its plan.
    pub fn new(
        scheduler: Arc<RefreshScheduler>,
        policy: FreshnessPolicy,
        catch_up_max_buckets: u64,
    ) -> Self {
        Self {
            scheduler,
            policy,
            catch_up_max_buckets,
        }
    }

    /// The freshness policy in force
    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    /// Largest backlog served synchronously
    pub fn catch_up_max_buckets(&self) -> u64 {
        self.catch_up_max_buckets
    }

    /// Pick the tier for `range` and determine how fresh it is
    pub async fn select_tier(
        &self,
        metric: &str,
        entity: &str,
        range: TimeRange,
        max_points: u64,
    ) -> Result<TierSelection> {
        let hierarchy = self.scheduler.manager().hierarchy();
        let definition = hierarchy.metric(metric)?;
        let (resolution, width) = choose_resolution(definition, &range, max_points);
        let bucket_count = range.bucket_count(width);

        let Resolution::Tier { id, .. } = &resolution else {
            return Ok(TierSelection {
                resolution,
                bucket_width_ms: width,
                bucket_count,
                coverage: None,
                uncovered: Vec::new(),
                freshness: Freshness::Complete,
                caught_up: false,
            });
        };

        let wanted = range.align_outward(width);
        let history = self
            .scheduler
            .default_range(metric, entity)
            .await?
            .map(|h| TimeRange::new_unchecked(align_down(h.start, width), align_up(h.end, width)));

        let key = TierKey::new(metric, id.as_str(), entity);
        let mut coverage = self.scheduler.tracker().watermark(metric, id, entity).await?.map(|w| w.coverage());
        let mut uncovered = uncovered_ranges(wanted, coverage, history);
        let mut caught_up = false;

        if !uncovered.is_empty() && self.policy == FreshnessPolicy::CatchUp {
            caught_up = self.catch_up(&key, range).await?;
            if caught_up {
                coverage = self
                    .scheduler
                    .tracker()
                    .watermark(metric, id, entity)
                    .await?
                    .map(|w| w.coverage());
                uncovered = uncovered_ranges(wanted, coverage, history);
            }
        }

        let freshness = if uncovered.is_empty() {
            Freshness::Complete
        } else {
            Freshness::Partial
        };
        debug!(
            key = %key,
            range = %range,
            buckets = bucket_count,
            freshness = %freshness,
            "Tier selected"
        );

        Ok(TierSelection {
            resolution,
            bucket_width_ms: width,
            bucket_count,
            coverage,
            uncovered,
            freshness,
            caught_up,
        })
    }

    /// Try a bounded, non-blocking refresh of the stale part of `range`
    ///
    /// Returns whether anything was committed. Failures other than
    /// configuration errors degrade to a partial answer.
    async fn catch_up(&self, key: &TierKey, range: TimeRange) -> Result<bool> {
        let hierarchy = self.scheduler.manager().hierarchy();
        let mut plan = match self
            .scheduler
            .plan_refresh(&key.metric, &key.tier, &key.entity, Some(range), false)
            .await
        {
            Ok(plan) => plan,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Catch-up planning failed");
                metrics::record_catch_up(&key.metric, "failed");
                return Ok(false);
            },
        };

        if plan.is_empty() {
            metrics::record_catch_up(&key.metric, "nothing_complete");
            return Ok(false);
        }

        let planned = plan.planned_buckets(|tier| {
            hierarchy
                .tier(&key.metric, tier)
                .map(|(_, t)| t.bucket_width_ms)
                .unwrap_or(1)
        });
        if planned > self.catch_up_max_buckets {
            debug!(key = %key, planned, bound = self.catch_up_max_buckets, "Backlog too large for catch-up");
            metrics::record_catch_up(&key.metric, "over_bound");
            return Ok(false);
        }

        match self.scheduler.try_execute_refresh(&mut plan).await {
            Ok(Some(report)) => {
                debug!(key = %key, buckets = report.buckets_written, "Caught up");
                metrics::record_catch_up(&key.metric, "refreshed");
                Ok(report.steps_completed > 0)
            },
            Ok(None) => {
                metrics::record_catch_up(&key.metric, "busy");
                // Steps committed before the busy key still count
                Ok(plan.completed_steps() > 0)
            },
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Catch-up refresh failed");
                metrics::record_catch_up(&key.metric, "failed");
                Ok(plan.completed_steps() > 0)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::hierarchy::{AggregationField, TierDefinition};
    use crate::rollup::record::Reducer;
    use crate::types::{DAY_MS, HOUR_MS, MINUTE_MS, SECOND_MS};

    fn definition() -> MetricDefinition {
        let tier = |id: &str, width: i64| TierDefinition {
            id: id.to_string(),
            bucket_width_ms: width,
            aggregation_fields: vec![AggregationField::new("value", &[Reducer::Avg])],
        };
        MetricDefinition {
            name: "heart_rate".to_string(),
            cadence_ms: SECOND_MS,
            tiers: vec![tier("1m", MINUTE_MS), tier("1h", HOUR_MS), tier("1d", DAY_MS)],
        }
    }

    fn chosen(duration: i64, max_points: u64) -> String {
        let range = TimeRange::new(0, duration).unwrap();
        choose_resolution(&definition(), &range, max_points).0.label().to_string()
    }

    #[test]
    fn test_two_days_selects_hourly() {
        assert_eq!(chosen(2 * DAY_MS, 100), "1h");
    }

    #[test]
    fn test_forty_days_selects_daily() {
        assert_eq!(chosen(40 * DAY_MS, 100), "1d");
    }

    #[test]
    fn test_ninety_seconds_selects_raw() {
        assert_eq!(chosen(90 * SECOND_MS, 100), "raw");
    }

    #[test]
    fn test_range_shorter_than_finest_tier_is_raw() {
        assert_eq!(chosen(30 * SECOND_MS, 1), "raw");
    }

    #[test]
    fn test_oversized_range_falls_back_to_coarsest() {
        assert_eq!(chosen(400 * DAY_MS, 100), "1d");
    }

    #[test]
    fn test_exact_fit_prefers_finer() {
        // 100 hourly buckets fit exactly
        assert_eq!(chosen(100 * HOUR_MS, 100), "1h");
    }

    #[test]
    fn test_uncovered_ranges() {
        let wanted = TimeRange::new_unchecked(0, 10);
        let history = Some(TimeRange::new_unchecked(0, 8));
        assert_eq!(
            uncovered_ranges(wanted, Some(TimeRange::new_unchecked(2, 5)), history),
            vec![TimeRange::new_unchecked(0, 2), TimeRange::new_unchecked(5, 8)]
        );
        assert!(uncovered_ranges(wanted, Some(TimeRange::new_unchecked(0, 10)), history).is_empty());
        assert!(uncovered_ranges(wanted, None, None).is_empty());
        assert_eq!(
            uncovered_ranges(wanted, None, history),
            vec![TimeRange::new_unchecked(0, 8)]
        );
    }

    #[test]
    fn test_freshness_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Freshness::Partial).unwrap(), "\"partial\"");
        assert_eq!(serde_json::to_string(&Resolution::Raw).unwrap(), "\"raw\"");
    }
}
