//! Background Refresh Service
//!
//! Wakes on a fixed interval, finds every (metric, entity) whose tiers lag
//! their source, and refreshes them up to the coarsest tier through the
//! engine's worker pool. A shutdown signal cancels the cycle in flight; the
//! step being committed finishes and the rest of the plan is left for the
//! next run.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::framework::{Service, ServiceError, ServiceStatus};
use crate::error::{Error, Result};
use crate::metrics;
use crate::rollup::{CancellationToken, RefreshJob, RollupEngine};

/// What one refresh cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Jobs submitted to the pool
    pub jobs: usize,

    /// Jobs that finished without error
    pub succeeded: usize,

    /// Jobs that failed or were cancelled
    pub failed: usize,

    /// Buckets written across all jobs
    pub buckets_written: usize,
}

/// Periodic refresher over a [`RollupEngine`]
pub struct RefreshService {
    engine: Arc<RollupEngine>,
    interval: Duration,
    status: RwLock<ServiceStatus>,
    last_cycle: RwLock<Option<CycleSummary>>,
}

impl RefreshService {
    /// Create a service refreshing every `interval`
    pub fn new(engine: Arc<RollupEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval: interval.max(Duration::from_millis(10)),
            status: RwLock::new(ServiceStatus::Starting),
            last_cycle: RwLock::new(None),
        }
    }

    /// Summary of the most recent completed cycle
    pub fn last_cycle(&self) -> Option<CycleSummary> {
        self.last_cycle.read().clone()
    }

    /// Jobs for every stale (metric, entity), one per pair at the coarsest tier
    pub async fn stale_jobs(&self) -> Result<Vec<RefreshJob>> {
        let tracker = self.engine.tracker();
        let mut jobs = Vec::new();

        for definition in self.engine.hierarchy().metrics() {
            let coarsest = definition.coarsest().id.as_str();
            for entity in self.engine.stats().entities(&definition.name).await? {
                let mut stale = false;
                for tier in &definition.tiers {
                    if tracker.is_stale(&definition.name, &tier.id, &entity).await? {
                        stale = true;
                        break;
                    }
                }
                if stale {
                    jobs.push(RefreshJob::incremental(&definition.name, coarsest, &entity));
                }
            }
        }

        Ok(jobs)
    }

    /// Run a single refresh cycle
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleSummary> {
        let jobs = self.stale_jobs().await?;
        let mut summary = CycleSummary {
            jobs: jobs.len(),
            ..CycleSummary::default()
        };
        if jobs.is_empty() {
            tracing::debug!("Refresh cycle found nothing stale");
            return Ok(summary);
        }

        for outcome in self.engine.pool().refresh_all(jobs, cancel).await {
            match outcome.result {
                Ok(report) => {
                    summary.succeeded += 1;
                    summary.buckets_written += report.buckets_written;
                },
                Err(Error::Cancelled { .. }) => {
                    summary.failed += 1;
                },
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        metric = %outcome.job.metric,
                        entity = %outcome.job.entity,
                        error = %e,
                        "Background refresh failed"
                    );
                },
            }
        }

        tracing::info!(
            jobs = summary.jobs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            buckets = summary.buckets_written,
            "Refresh cycle complete"
        );
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl Service for RefreshService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> std::result::Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        metrics::HEALTH_STATUS.set(1.0);
        tracing::info!(interval_secs = self.interval.as_secs(), "Refresh service started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Refresh service broadcast receiver lagged");
                        },
                    }
                }

                _ = ticker.tick() => {
                    let cancel = CancellationToken::new();
                    let cycle = self.run_once(&cancel);
                    tokio::pin!(cycle);

                    let outcome = tokio::select! {
                        outcome = &mut cycle => Some(outcome),
                        _ = shutdown.recv() => {
                            cancel.cancel();
                            let _ = cycle.await;
                            None
                        }
                    };

                    match outcome {
                        Some(Ok(summary)) => {
                            *self.last_cycle.write() = Some(summary);
                        },
                        Some(Err(e)) if e.is_configuration() => {
                            let message = e.to_string();
                            *self.status.write() = ServiceStatus::Failed(message.clone());
                            metrics::HEALTH_STATUS.set(0.0);
                            return Err(ServiceError::RuntimeError(message));
                        },
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Refresh cycle aborted");
                        },
                        None => break,
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        metrics::HEALTH_STATUS.set(0.0);
        tracing::info!("Refresh service stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "refresher"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
