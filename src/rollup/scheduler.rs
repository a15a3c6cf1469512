//! Refresh Scheduler
//!
//! Plans and executes incremental refreshes of a tier chain. A plan is an
//! ordered list of steps, one or two per tier from the first tier up to the
//! requested one, each scoped to the smallest sub-range that is actually
//! stale (or exactly the requested range when forced).
//!
//! # Guarantees
//!
//! - Records of a step and the watermark advance commit in one store call
//! - Earlier steps stay committed when a later step fails; re-running the
//!   same plan resumes at the failed step
//! - Non-forced steps re-check staleness under the key lock and skip when
//!   another refresh got there first
//! - Transient source failures are retried with exponential backoff
//! - Cancellation is honored between steps, never inside one
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo(scheduler: &vitals_rollup::rollup::RefreshScheduler) -> vitals_rollup::Result<()> {
//! use vitals_rollup::rollup::CancellationToken;
//!
//! let mut plan = scheduler.plan_refresh("heart_rate", "1d", "user-1", None, false).await?;
//! let report = scheduler.execute_refresh(&mut plan, &CancellationToken::new()).await?;
//! println!("{} buckets written", report.buckets_written);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{Error, RangeError, Result};
use crate::metrics;
use crate::rollup::hierarchy::HierarchyManager;
use crate::rollup::watermark::{SourceExtent, StalenessTracker, Watermark};
use crate::storage::AggregateStore;
use crate::types::{TierKey, TimeRange, Timestamp};

// ============================================================================
// Plan Types
// ============================================================================

/// One unit of refresh work: a tier, an entity and a bucket-aligned range
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshRequest {
    /// Metric name
    pub metric: String,

    /// Tier identifier
    pub tier: String,

    /// Position of the tier in its chain
    pub tier_index: usize,

    /// Entity identifier
    pub entity: String,

    /// Buckets to recompute, aligned to the tier width
    pub range: TimeRange,

    /// Recompute even if already materialized
    pub force: bool,
}

impl RefreshRequest {
    /// Key of the series this request writes
    pub fn key(&self) -> TierKey {
        TierKey::new(self.metric.as_str(), self.tier.as_str(), self.entity.as_str())
    }
}

/// Execution state of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not executed yet, or failed and awaiting a re-run
    Pending,

    /// Committed
    Completed {
        /// Records written by the step
        buckets: usize,
    },

    /// Nothing was stale when the step ran
    Skipped,
}

/// A request plus its execution state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// The work to do
    pub request: RefreshRequest,

    /// Where execution stands
    pub state: StepState,
}

/// Ordered refresh steps for one (metric, entity), finest tier first
#[derive(Debug, Clone, Serialize)]
pub struct RefreshPlan {
    /// Metric name
    pub metric: String,

    /// Entity identifier
    pub entity: String,

    /// Tier the plan refreshes up to
    pub target_tier: String,

    /// Range the plan was made for
    pub range: Option<TimeRange>,

    /// Whether the plan recomputes fresh buckets
    pub force: bool,

    /// Steps in dependency order
    pub steps: Vec<PlanStep>,
}

impl RefreshPlan {
    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps that have been committed or skipped
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state != StepState::Pending)
            .count()
    }

    /// Steps still waiting to run
    pub fn pending_steps(&self) -> usize {
        self.steps.len() - self.completed_steps()
    }

    /// Number of buckets the plan would touch at most
    pub fn planned_buckets(&self, widths: impl Fn(&str) -> i64) -> u64 {
        self.steps
            .iter()
            .map(|s| s.request.range.bucket_count(widths(&s.request.tier)))
            .sum()
    }
}

/// Summary of an executed plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Metric name
    pub metric: String,

    /// Entity identifier
    pub entity: String,

    /// Steps that committed records in this execution
    pub steps_completed: usize,

    /// Steps found already current
    pub steps_skipped: usize,

    /// Records written in this execution
    pub buckets_written: usize,

    /// Watermark of the target tier afterwards
    pub watermark: Option<Watermark>,
}

// ============================================================================
// Retry Policy
// ============================================================================

/// How a refresh step that failed with a retryable error is re-attempted
///
/// Built from the `[retry]` section of the configuration. The wait before
/// retry `n` is `initial_backoff * 2^n`, capped at `max_backoff`; with
/// `jitter` up to a quarter of the wait is added on top.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Wait before the first retry
    pub initial_backoff: Duration,

    /// Longest wait between attempts
    pub max_backoff: Duration,

    /// Randomize waits
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that fails a step on its first error
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0 for the first retry)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(20));
        let wait = doubled.min(self.max_backoff);
        if !self.jitter {
            return wait;
        }
        let spread = (wait.as_millis() / 4) as u64;
        wait + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    /// Whether a step that has already been retried `attempt` times may go again
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared flag checked between plan steps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; running steps finish first
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Stale Ranges
// ============================================================================

/// Sub-ranges of `wanted` that a tier still has to materialize
///
/// With an existing window the result is at most a lower piece ending at the
/// window start and an upper piece starting at the window end, so the window
/// stays contiguous after the refresh. Pieces are clipped to what the source
/// has complete; a piece that cannot reach the window is dropped.
pub(crate) fn stale_pieces(
    coverage: Option<TimeRange>,
    wanted: TimeRange,
    width: i64,
    source: &SourceExtent,
) -> Vec<TimeRange> {
    let Some(window) = coverage else {
        return source.clip(wanted, width).into_iter().collect();
    };

    let mut pieces = Vec::with_capacity(2);
    if wanted.start < window.start {
        let lower = TimeRange::new_unchecked(wanted.start, window.start);
        if let Some(piece) = source.clip(lower, width) {
            if piece.end == lower.end {
                pieces.push(piece);
            }
        }
    }
    if wanted.end > window.end {
        let upper = TimeRange::new_unchecked(window.end, wanted.end);
        if let Some(piece) = source.clip(upper, width) {
            if piece.start == upper.start {
                pieces.push(piece);
            }
        }
    }
    pieces
}

fn widen(coverage: Option<TimeRange>, piece: TimeRange) -> TimeRange {
    match coverage {
        None => piece,
        Some(c) => TimeRange::new_unchecked(c.start.min(piece.start), c.end.max(piece.end)),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Wait,
    Try,
}

#[derive(Debug)]
enum StepOutcome {
    Written(usize),
    Current,
    Busy,
}

/// Plans and executes tier refreshes
pub struct RefreshScheduler {
    manager: Arc<HierarchyManager>,
    tracker: Arc<StalenessTracker>,
    aggregates: Arc<dyn AggregateStore>,
    retry: RetryPolicy,
}

impl RefreshScheduler {
    /// Create a scheduler
    ///
    /// `tracker` must be the one shared with every other writer so that the
    /// per-key locks are common.
    pub fn new(
        manager: Arc<HierarchyManager>,
        tracker: Arc<StalenessTracker>,
        aggregates: Arc<dyn AggregateStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            manager,
            tracker,
            aggregates,
            retry,
        }
    }

    /// The staleness tracker used for locking and source extents
    pub fn tracker(&self) -> &Arc<StalenessTracker> {
        &self.tracker
    }

    /// The hierarchy manager used for folding
    pub fn manager(&self) -> &Arc<HierarchyManager> {
        &self.manager
    }

    /// Full retained raw history of an entity, `None` if it has no data
    pub async fn default_range(&self, metric: &str, entity: &str) -> Result<Option<TimeRange>> {
        Ok(self
            .history(metric, entity)
            .await?
            .map(|(earliest, latest)| TimeRange::new_unchecked(earliest, latest + 1)))
    }

    async fn history(&self, metric: &str, entity: &str) -> Result<Option<(Timestamp, Timestamp)>> {
        let raw = self.manager.raw();
        let latest = raw
            .latest_timestamp(metric, entity)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let Some(latest) = latest else {
            return Ok(None);
        };
        let earliest = raw
            .earliest_timestamp(metric, entity)
            .await
            .map_err(|e| Error::SourceUnavailable(e.to_string()))?
            .unwrap_or(latest);
        Ok(Some((earliest, latest)))
    }

    /// Plan the refresh of `tier` for one entity
    ///
    /// Every tier from the first up to `tier` gets the steps it needs so the
    /// requested range of `tier` can be computed. Without `range` the whole
    /// retained history is used. Under `force`, each tier recomputes exactly
    /// the buckets starting inside `range`, and a range that neither overlaps
    /// nor adjoins a tier's materialized window is rejected.
    pub async fn plan_refresh(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
        range: Option<TimeRange>,
        force: bool,
    ) -> Result<RefreshPlan> {
        let hierarchy = self.manager.hierarchy();
        let (target_index, target) = hierarchy.tier(metric, tier)?;
        let chain = hierarchy.get_tier_chain(metric)?;

        let mut plan = RefreshPlan {
            metric: metric.to_string(),
            entity: entity.to_string(),
            target_tier: tier.to_string(),
            range,
            force,
            steps: Vec::new(),
        };

        let history = self.history(metric, entity).await?;
        let range = match (range, history) {
            (Some(r), Some((earliest, latest))) => {
                let retained = TimeRange::new_unchecked(earliest, latest + 1);
                if r.intersect(&retained).is_none() {
                    return Err(RangeError::OutsideHistory {
                        metric: metric.to_string(),
                        entity: entity.to_string(),
                        start: r.start,
                        end: r.end,
                    }
                    .into());
                }
                r
            },
            (Some(r), None) => {
                return Err(RangeError::OutsideHistory {
                    metric: metric.to_string(),
                    entity: entity.to_string(),
                    start: r.start,
                    end: r.end,
                }
                .into());
            },
            (None, Some((earliest, latest))) => TimeRange::new_unchecked(earliest, latest + 1),
            (None, None) => {
                debug!(metric, entity, "No raw data, nothing to plan");
                return Ok(plan);
            },
        };

        let wanted = range.align_outward(target.bucket_width_ms);
        let latest = history.map(|(_, latest)| latest).unwrap_or(range.end);
        let mut source = Some(SourceExtent::raw(latest, hierarchy.metric(metric)?.cadence_ms));

        for (index, definition) in chain.iter().enumerate().take(target_index + 1) {
            let Some(extent) = source else {
                break;
            };
            let width = definition.bucket_width_ms;
            let key = TierKey::new(metric, definition.id.as_str(), entity);
            let watermark = self.aggregates.watermark(&key).await?;
            let mut coverage = watermark.map(|w| w.coverage());

            let pieces = if force {
                let requested = range.bucket_starts_within(width);
                if let Some(w) = &watermark {
                    if !requested.is_empty() && !w.adjoins(&requested) {
                        return Err(RangeError::DisjointForce {
                            tier: definition.id.clone(),
                            start: range.start,
                            end: range.end,
                        }
                        .into());
                    }
                }
                extent.clip(requested, width).into_iter().collect()
            } else {
                stale_pieces(coverage, wanted, width, &extent)
            };

            for piece in pieces {
                coverage = Some(widen(coverage, piece));
                plan.steps.push(PlanStep {
                    request: RefreshRequest {
                        metric: metric.to_string(),
                        tier: definition.id.clone(),
                        tier_index: index,
                        entity: entity.to_string(),
                        range: piece,
                        force,
                    },
                    state: StepState::Pending,
                });
            }

            source = coverage.map(|c| SourceExtent {
                from: Some(c.start),
                through: c.end,
            });
        }

        debug!(
            metric,
            entity,
            tier,
            force,
            steps = plan.steps.len(),
            "Refresh planned"
        );
        Ok(plan)
    }

    /// Execute a plan, waiting for per-key locks as needed
    ///
    /// Steps already completed or skipped are never re-run, so an execution
    /// that failed part way can be resumed by passing the same plan again.
    pub async fn execute_refresh(
        &self,
        plan: &mut RefreshPlan,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let report = self.execute(plan, cancel, LockMode::Wait).await?;
        // Waiting on locks never yields a busy outcome
        Ok(report.unwrap_or_default())
    }

    /// Execute a plan without waiting on locks
    ///
    /// Returns `None` as soon as a step finds its key locked by another
    /// refresh. Steps committed before that point stay committed.
    pub async fn try_execute_refresh(&self, plan: &mut RefreshPlan) -> Result<Option<RefreshReport>> {
        self.execute(plan, &CancellationToken::new(), LockMode::Try)
            .await
    }

    /// Plan and execute in one call
    pub async fn refresh(
        &self,
        metric: &str,
        tier: &str,
        entity: &str,
        range: Option<TimeRange>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let mut plan = self.plan_refresh(metric, tier, entity, range, force).await?;
        self.execute_refresh(&mut plan, cancel).await
    }

    async fn execute(
        &self,
        plan: &mut RefreshPlan,
        cancel: &CancellationToken,
        mode: LockMode,
    ) -> Result<Option<RefreshReport>> {
        let mut report = RefreshReport {
            metric: plan.metric.clone(),
            entity: plan.entity.clone(),
            ..RefreshReport::default()
        };

        for index in 0..plan.steps.len() {
            if plan.steps[index].state != StepState::Pending {
                continue;
            }
            if cancel.is_cancelled() {
                info!(
                    metric = %plan.metric,
                    entity = %plan.entity,
                    completed = plan.completed_steps(),
                    "Refresh cancelled"
                );
                return Err(Error::Cancelled {
                    completed_steps: plan.completed_steps(),
                });
            }

            let request = plan.steps[index].request.clone();
            match self.run_with_retry(&request, mode).await {
                Ok(StepOutcome::Written(buckets)) => {
                    plan.steps[index].state = StepState::Completed { buckets };
                    report.steps_completed += 1;
                    report.buckets_written += buckets;
                },
                Ok(StepOutcome::Current) => {
                    plan.steps[index].state = StepState::Skipped;
                    report.steps_skipped += 1;
                },
                Ok(StepOutcome::Busy) => {
                    debug!(key = %request.key(), "Key busy, giving up without waiting");
                    return Ok(None);
                },
                Err(e) => {
                    warn!(
                        key = %request.key(),
                        range = %request.range,
                        error = %e,
                        "Refresh step failed"
                    );
                    return Err(Error::RefreshFailed {
                        completed_steps: plan.completed_steps(),
                        source: Box::new(e),
                    });
                },
            }
        }

        let target = TierKey::new(
            plan.metric.as_str(),
            plan.target_tier.as_str(),
            plan.entity.as_str(),
        );
        report.watermark = self.aggregates.watermark(&target).await?;
        Ok(Some(report))
    }

    async fn run_with_retry(&self, request: &RefreshRequest, mode: LockMode) -> Result<StepOutcome> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = self.run_step(request, mode).await;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(outcome) => {
                    let (status, buckets) = match outcome {
                        StepOutcome::Written(n) => ("completed", n),
                        StepOutcome::Current => ("skipped", 0),
                        StepOutcome::Busy => ("busy", 0),
                    };
                    metrics::record_step(&request.metric, &request.tier, status, elapsed, buckets);
                    return Ok(outcome);
                },
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        key = %request.key(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying refresh step"
                    );
                    metrics::record_retry(&request.metric, &request.tier);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => {
                    metrics::record_step(&request.metric, &request.tier, "failed", elapsed, 0);
                    return Err(e);
                },
            }
        }
    }

    async fn acquire(&self, key: &TierKey, mode: LockMode) -> Option<OwnedMutexGuard<()>> {
        match mode {
            LockMode::Wait => Some(self.tracker.locks().lock(key).await),
            LockMode::Try => self.tracker.locks().try_lock(key),
        }
    }

    async fn run_step(&self, request: &RefreshRequest, mode: LockMode) -> Result<StepOutcome> {
        let key = request.key();
        let Some(_guard) = self.acquire(&key, mode).await else {
            return Ok(StepOutcome::Busy);
        };

        let width = self
            .manager
            .hierarchy()
            .tier(&request.metric, &request.tier)?
            .1
            .bucket_width_ms;

        let Some(source) = self
            .tracker
            .source_extent(&request.metric, request.tier_index, &request.entity)
            .await?
        else {
            return Ok(StepOutcome::Current);
        };

        let mut current = self.aggregates.watermark(&key).await?;
        let pieces = if request.force {
            source.clip(request.range, width).into_iter().collect()
        } else {
            stale_pieces(current.map(|w| w.coverage()), request.range, width, &source)
        };
        if pieces.is_empty() {
            debug!(key = %key, range = %request.range, "Already current, skipping");
            return Ok(StepOutcome::Current);
        }

        let mut written = 0;
        for piece in pieces {
            let records = self
                .manager
                .fold_range(&request.metric, request.tier_index, &request.entity, piece)
                .await?;
            let next = Watermark::advanced(current.as_ref(), piece, Some(source.through));
            written += records.len();
            self.aggregates.commit(&key, piece, records, next).await?;
            info!(
                key = %key,
                range = %piece,
                through = next.materialized_through,
                "Refresh step committed"
            );
            current = Some(next);
        }

        Ok(StepOutcome::Written(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::hierarchy::{AggregationField, MetricDefinition, RollupHierarchy, TierDefinition};
    use crate::rollup::record::Reducer;
    use crate::storage::{InMemoryAggregateStore, InMemoryRawStore, RawSeriesStore};
    use crate::types::{RawSample, HOUR_MS, MINUTE_MS, SECOND_MS};

    fn tier(id: &str, width: i64) -> TierDefinition {
        TierDefinition {
            id: id.to_string(),
            bucket_width_ms: width,
            aggregation_fields: vec![AggregationField::new("value", &[Reducer::Avg])],
        }
    }

    fn setup(samples: Vec<RawSample>) -> (RefreshScheduler, Arc<InMemoryAggregateStore>) {
        let hierarchy = Arc::new(
            RollupHierarchy::new(vec![MetricDefinition {
                name: "hr".to_string(),
                cadence_ms: SECOND_MS,
                tiers: vec![tier("1m", MINUTE_MS), tier("1h", HOUR_MS)],
            }])
            .unwrap(),
        );
        let raw = Arc::new(InMemoryRawStore::new());
        raw.append("hr", "u", samples);
        let raw: Arc<dyn RawSeriesStore> = raw;
        let aggregates = Arc::new(InMemoryAggregateStore::new());
        let store: Arc<dyn AggregateStore> = aggregates.clone();
        let manager = Arc::new(HierarchyManager::new(hierarchy.clone(), raw.clone(), store.clone()));
        let tracker = Arc::new(StalenessTracker::new(hierarchy, raw, store.clone()));
        (
            RefreshScheduler::new(manager, tracker, store, RetryPolicy::none()),
            aggregates,
        )
    }

    fn minutes(count: i64) -> Vec<RawSample> {
        (0..count * 60)
            .map(|s| RawSample::single(s * SECOND_MS, 60.0 + (s % 7) as f64))
            .collect()
    }

    #[test]
    fn test_stale_pieces_without_window() {
        let source = SourceExtent::raw(9 * MINUTE_MS, MINUTE_MS);
        let wanted = TimeRange::new_unchecked(0, 3_600_000);
        let pieces = stale_pieces(None, wanted, MINUTE_MS, &source);
        assert_eq!(pieces, vec![TimeRange::new_unchecked(0, 600_000)]);
    }

    #[test]
    fn test_stale_pieces_lower_and_upper() {
        let source = SourceExtent {
            from: Some(0),
            through: 10 * MINUTE_MS,
        };
        let window = TimeRange::new_unchecked(3 * MINUTE_MS, 5 * MINUTE_MS);
        let wanted = TimeRange::new_unchecked(0, 10 * MINUTE_MS);
        let pieces = stale_pieces(Some(window), wanted, MINUTE_MS, &source);
        assert_eq!(
            pieces,
            vec![
                TimeRange::new_unchecked(0, 3 * MINUTE_MS),
                TimeRange::new_unchecked(5 * MINUTE_MS, 10 * MINUTE_MS),
            ]
        );
    }

    #[test]
    fn test_stale_pieces_drops_unreachable_piece() {
        // Source has a hole right after the window: the upper piece would not
        // start at the window end, so it is dropped.
        let source = SourceExtent {
            from: Some(8 * MINUTE_MS),
            through: 10 * MINUTE_MS,
        };
        let window = TimeRange::new_unchecked(0, 5 * MINUTE_MS);
        let wanted = TimeRange::new_unchecked(0, 10 * MINUTE_MS);
        assert!(stale_pieces(Some(window), wanted, MINUTE_MS, &source).is_empty());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
        assert!(!RetryPolicy::none().allows_retry(0));
    }

    #[test]
    fn test_policy_follows_retry_config() {
        let config = RetryConfig {
            max_retries: 7,
            initial_backoff_ms: 50,
            max_backoff_ms: 20,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.initial_backoff, Duration::from_millis(50));
        // A cap below the first wait is raised to it
        assert_eq!(policy.max_backoff, Duration::from_millis(50));

        let jittered = policy.backoff(0);
        assert!(jittered >= Duration::from_millis(50));
        assert!(jittered <= Duration::from_millis(62));
    }

    #[tokio::test]
    async fn test_plan_orders_tiers() {
        let (scheduler, _) = setup(minutes(120));
        let plan = scheduler.plan_refresh("hr", "1h", "u", None, false).await.unwrap();
        let tiers: Vec<&str> = plan.steps.iter().map(|s| s.request.tier.as_str()).collect();
        assert_eq!(tiers, vec!["1m", "1h"]);
        assert_eq!(plan.steps[0].request.range, TimeRange::new_unchecked(0, 2 * HOUR_MS));
        assert_eq!(plan.steps[1].request.range, TimeRange::new_unchecked(0, 2 * HOUR_MS));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let (scheduler, store) = setup(minutes(90));
        let cancel = CancellationToken::new();

        let first = scheduler.refresh("hr", "1h", "u", None, false, &cancel).await.unwrap();
        assert_eq!(first.buckets_written, 91);

        let key = TierKey::new("hr", "1h", "u");
        let all = TimeRange::new_unchecked(0, 10 * HOUR_MS);
        let records = store.read_records(&key, all).await.unwrap();
        let watermark = store.watermark(&key).await.unwrap();

        let second = scheduler.refresh("hr", "1h", "u", None, false, &cancel).await.unwrap();
        assert_eq!(second.buckets_written, 0);
        assert_eq!(store.read_records(&key, all).await.unwrap(), records);
        assert_eq!(store.watermark(&key).await.unwrap(), watermark);
    }

    #[tokio::test]
    async fn test_outside_history_is_range_error() {
        let (scheduler, _) = setup(minutes(10));
        let far = TimeRange::new(100 * HOUR_MS, 101 * HOUR_MS).unwrap();
        let err = scheduler.plan_refresh("hr", "1m", "u", Some(far), false).await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let (scheduler, store) = setup(minutes(10));
        let mut plan = scheduler.plan_refresh("hr", "1h", "u", None, false).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = scheduler.execute_refresh(&mut plan, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { completed_steps: 0 }));
        let key = TierKey::new("hr", "1m", "u");
        assert_eq!(store.watermark(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_try_execute_gives_up_on_held_lock() {
        let (scheduler, _) = setup(minutes(10));
        let mut plan = scheduler.plan_refresh("hr", "1m", "u", None, false).await.unwrap();
        let key = TierKey::new("hr", "1m", "u");
        let _held = scheduler.tracker().locks().lock(&key).await;
        assert!(scheduler.try_execute_refresh(&mut plan).await.unwrap().is_none());
        assert_eq!(plan.completed_steps(), 0);
    }
}
