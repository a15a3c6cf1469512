//! Metrics and telemetry for the rollup engine
//!
//! Prometheus metrics covering refresh activity, query routing and the
//! size and freshness of every materialized tier.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    // === Refresh Counters ===

    /// Refresh plan steps by outcome
    pub static ref REFRESH_STEPS_TOTAL: CounterVec = register_counter_vec!(
        "rollup_refresh_steps_total",
        "Refresh plan steps by outcome",
        &["metric", "tier", "status"]
    ).unwrap();

    /// Buckets written by refreshes
    pub static ref BUCKETS_WRITTEN_TOTAL: CounterVec = register_counter_vec!(
        "rollup_buckets_written_total",
        "Aggregate records written by refreshes",
        &["metric", "tier"]
    ).unwrap();

    /// Retries after transient source or store failures
    pub static ref REFRESH_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_refresh_retries_total",
        "Refresh step retries after transient failures",
        &["metric", "tier"]
    ).unwrap();

    /// Query-path catch-up attempts by outcome
    pub static ref CATCH_UP_TOTAL: CounterVec = register_counter_vec!(
        "rollup_catch_up_total",
        "Synchronous catch-up refreshes by outcome",
        &["metric", "outcome"]
    ).unwrap();

    /// Queries by chosen resolution
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "rollup_queries_total",
        "Queries by chosen resolution and freshness",
        &["metric", "resolution", "freshness"]
    ).unwrap();

    // === Latency Histograms ===

    /// Refresh step duration
    pub static ref REFRESH_STEP_DURATION: HistogramVec = register_histogram_vec!(
        "rollup_refresh_step_duration_seconds",
        "Refresh step latency in seconds",
        &["metric", "tier"],
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // === Tier Gauges ===

    /// Stored records per tier
    pub static ref TIER_ROWS: GaugeVec = register_gauge_vec!(
        "rollup_tier_rows",
        "Materialized records per tier",
        &["metric", "tier"]
    ).unwrap();

    /// Approximate bytes per tier
    pub static ref TIER_BYTES: GaugeVec = register_gauge_vec!(
        "rollup_tier_bytes",
        "Approximate storage footprint per tier in bytes",
        &["metric", "tier"]
    ).unwrap();

    /// Entities behind their source by more than one bucket
    pub static ref TIER_STALE_ENTITIES: GaugeVec = register_gauge_vec!(
        "rollup_tier_stale_entities",
        "Entities whose tier lags its source by more than one bucket",
        &["metric", "tier"]
    ).unwrap();

    /// Oldest watermark per tier
    pub static ref TIER_WATERMARK: GaugeVec = register_gauge_vec!(
        "rollup_tier_watermark_ms",
        "Oldest materialized_through across entities, epoch ms",
        &["metric", "tier"]
    ).unwrap();

    // === Service ===

    /// Health of the background refresher
    pub static ref HEALTH_STATUS: Gauge = register_gauge!(
        "rollup_health_status",
        "Background refresher health (1 = running)"
    ).unwrap();
}

/// Initialize metrics system
pub fn init() {
    HEALTH_STATUS.set(1.0);
    tracing::info!("Metrics system initialized");
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record the outcome of one refresh step
#[inline]
pub fn record_step(metric: &str, tier: &str, status: &str, duration_secs: f64, buckets: usize) {
    REFRESH_STEPS_TOTAL
        .with_label_values(&[metric, tier, status])
        .inc();

    REFRESH_STEP_DURATION
        .with_label_values(&[metric, tier])
        .observe(duration_secs);

    if buckets > 0 {
        BUCKETS_WRITTEN_TOTAL
            .with_label_values(&[metric, tier])
            .inc_by(buckets as f64);
    }
}

/// Record a retry of a refresh step
#[inline]
pub fn record_retry(metric: &str, tier: &str) {
    REFRESH_RETRIES_TOTAL
        .with_label_values(&[metric, tier])
        .inc();
}

/// Record a query-path catch-up outcome
#[inline]
pub fn record_catch_up(metric: &str, outcome: &str) {
    CATCH_UP_TOTAL.with_label_values(&[metric, outcome]).inc();
}

/// Record an answered query
#[inline]
pub fn record_query(metric: &str, resolution: &str, freshness: &str) {
    QUERIES_TOTAL
        .with_label_values(&[metric, resolution, freshness])
        .inc();
}

/// Update the size and freshness gauges of one tier
#[inline]
pub fn update_tier(metric: &str, tier: &str, rows: u64, bytes: u64, stale: usize, watermark: Option<i64>) {
    TIER_ROWS.with_label_values(&[metric, tier]).set(rows as f64);
    TIER_BYTES.with_label_values(&[metric, tier]).set(bytes as f64);
    TIER_STALE_ENTITIES
        .with_label_values(&[metric, tier])
        .set(stale as f64);
    if let Some(watermark) = watermark {
        TIER_WATERMARK
            .with_label_values(&[metric, tier])
            .set(watermark as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init();
        assert_eq!(HEALTH_STATUS.get(), 1.0);
    }

    #[test]
    fn test_record_step() {
        record_step("heart_rate", "1m", "completed", 0.002, 3);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("rollup_refresh_steps_total"));
        assert!(metrics.contains("rollup_buckets_written_total"));
    }

    #[test]
    fn test_update_tier() {
        update_tier("spo2", "1h", 24, 4096, 1, Some(3_600_000));
        assert_eq!(TIER_ROWS.with_label_values(&["spo2", "1h"]).get(), 24.0);
        let metrics = gather_metrics().expect("Failed to gather metrics");
        assert!(metrics.contains("rollup_tier_watermark_ms"));
    }
}
