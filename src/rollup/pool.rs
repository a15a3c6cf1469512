//! Parallel refresh execution
//!
//! Runs many independent refresh jobs (different metrics or entities) with a
//! bounded number in flight. Jobs touching the same key still serialize on
//! that key's lock inside the scheduler.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::rollup::scheduler::{CancellationToken, RefreshReport, RefreshScheduler};
use crate::types::TimeRange;

/// A refresh of one tier for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshJob {
    /// Metric name
    pub metric: String,

    /// Tier to refresh up to
    pub tier: String,

    /// Entity identifier
    pub entity: String,

    /// Range to refresh, whole history when `None`
    pub range: Option<TimeRange>,

    /// Recompute fresh buckets too
    pub force: bool,
}

impl RefreshJob {
    /// Incremental refresh of the whole history
    pub fn incremental(metric: &str, tier: &str, entity: &str) -> Self {
        Self {
            metric: metric.to_string(),
            tier: tier.to_string(),
            entity: entity.to_string(),
            range: None,
            force: false,
        }
    }
}

/// Result of one job
#[derive(Debug)]
pub struct JobOutcome {
    /// The job that ran
    pub job: RefreshJob,

    /// What it produced
    pub result: Result<RefreshReport>,

    /// Wall clock duration in microseconds
    pub elapsed_us: u64,
}

/// Bounded pool of refresh workers
pub struct RefreshWorkerPool {
    scheduler: Arc<RefreshScheduler>,
    workers: usize,
}

impl RefreshWorkerPool {
    /// Create a pool running at most `workers` jobs at once
    pub fn new(scheduler: Arc<RefreshScheduler>, workers: usize) -> Self {
        Self {
            scheduler,
            workers: workers.max(1),
        }
    }

    /// Maximum jobs in flight
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job and collect outcomes in submission order
    ///
    /// Every job gets an outcome. Jobs not yet started when `cancel` fires
    /// return `Error::Cancelled`; a job whose task panicked returns
    /// `Error::TaskFailed`.
    pub async fn refresh_all(
        &self,
        jobs: Vec<RefreshJob>,
        cancel: &CancellationToken,
    ) -> Vec<JobOutcome> {
        debug!(jobs = jobs.len(), workers = self.workers, "Starting refresh jobs");

        let mut join_set = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut slots: Vec<(RefreshJob, Option<JobOutcome>)> =
            jobs.iter().cloned().map(|job| (job, None)).collect();

        for (index, job) in jobs.into_iter().enumerate() {
            let scheduler = Arc::clone(&self.scheduler);
            let permit = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit.acquire().await;
                let start = Instant::now();
                let result = scheduler
                    .refresh(&job.metric, &job.tier, &job.entity, job.range, job.force, &cancel)
                    .await;
                (
                    index,
                    JobOutcome {
                        job,
                        result,
                        elapsed_us: start.elapsed().as_micros() as u64,
                    },
                )
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index].1 = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Refresh task panicked");
                    failures.push(e.to_string());
                },
            }
        }

        let reason = failures.join("; ");
        slots
            .into_iter()
            .map(|(job, outcome)| {
                outcome.unwrap_or_else(|| JobOutcome {
                    result: Err(Error::TaskFailed(format!(
                        "{}/{}/{}: {}",
                        job.metric, job.tier, job.entity, reason
                    ))),
                    job,
                    elapsed_us: 0,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::rollup::hierarchy::{
        AggregationField, HierarchyManager, MetricDefinition, RollupHierarchy, TierDefinition,
    };
    use crate::rollup::record::Reducer;
    use crate::rollup::scheduler::RetryPolicy;
    use crate::rollup::watermark::StalenessTracker;
    use crate::storage::{AggregateStore, InMemoryAggregateStore, InMemoryRawStore, RawSeriesStore};
    use crate::types::{EntityId, RawSample, Timestamp, HOUR_MS, MINUTE_MS};
    use async_trait::async_trait;

    /// Raw store whose reads blow up for one entity
    struct PanickingRaw {
        inner: InMemoryRawStore,
    }

    #[async_trait]
    impl RawSeriesStore for PanickingRaw {
        async fn read_raw(
            &self,
            metric: &str,
            entity: &str,
            range: TimeRange,
        ) -> std::result::Result<Vec<RawSample>, StoreError> {
            self.inner.read_raw(metric, entity, range).await
        }

        async fn latest_timestamp(
            &self,
            metric: &str,
            entity: &str,
        ) -> std::result::Result<Option<Timestamp>, StoreError> {
            if entity == "boom" {
                panic!("raw index corrupted for {}", entity);
            }
            self.inner.latest_timestamp(metric, entity).await
        }

        async fn list_entities(&self, metric: &str) -> std::result::Result<Vec<EntityId>, StoreError> {
            self.inner.list_entities(metric).await
        }
    }

    fn pool() -> RefreshWorkerPool {
        let hierarchy = Arc::new(
            RollupHierarchy::new(vec![MetricDefinition {
                name: "spo2".to_string(),
                cadence_ms: MINUTE_MS,
                tiers: vec![TierDefinition {
                    id: "1h".to_string(),
                    bucket_width_ms: HOUR_MS,
                    aggregation_fields: vec![AggregationField::new("value", &[Reducer::Avg])],
                }],
            }])
            .unwrap(),
        );
        let inner = InMemoryRawStore::new();
        for entity in ["ok", "boom"] {
            inner.append("spo2", entity, (0..120).map(|m| RawSample::single(m * MINUTE_MS, 97.0)));
        }
        let raw: Arc<dyn RawSeriesStore> = Arc::new(PanickingRaw { inner });
        let store: Arc<dyn AggregateStore> = Arc::new(InMemoryAggregateStore::new());
        let manager = Arc::new(HierarchyManager::new(hierarchy.clone(), raw.clone(), store.clone()));
        let tracker = Arc::new(StalenessTracker::new(hierarchy, raw, store.clone()));
        let scheduler = Arc::new(RefreshScheduler::new(manager, tracker, store, RetryPolicy::none()));
        RefreshWorkerPool::new(scheduler, 2)
    }

    #[tokio::test]
    async fn test_panicked_job_still_reports_outcome() {
        let jobs = vec![
            RefreshJob::incremental("spo2", "1h", "ok"),
            RefreshJob::incremental("spo2", "1h", "boom"),
        ];
        let outcomes = pool().refresh_all(jobs.clone(), &CancellationToken::new()).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].job, jobs[0]);
        assert_eq!(outcomes[0].result.as_ref().unwrap().buckets_written, 2);

        assert_eq!(outcomes[1].job, jobs[1]);
        let err = outcomes[1].result.as_ref().unwrap_err();
        assert!(matches!(err, Error::TaskFailed(_)));
        assert!(err.to_string().contains("spo2/1h/boom"));
        assert!(!err.is_retryable());
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_pool_has_at_least_one_worker() {
        let pool = pool();
        assert_eq!(pool.workers(), 2);
        let scheduler = Arc::clone(&pool.scheduler);
        assert_eq!(RefreshWorkerPool::new(scheduler, 0).workers(), 1);
    }
}
