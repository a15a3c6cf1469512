//! Rendering of command results for the terminal

use clap::ValueEnum;
use serde::Serialize;

use vitals_rollup::error::{Error, Result};
use vitals_rollup::rollup::{
    JobOutcome, QueryResponse, RefreshPlan, RollupHierarchy, StepState, TierStats,
};
use vitals_rollup::types::{format_duration_ms, format_timestamp, Timestamp};

/// Output format for query and refresh results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable tables
    Text,
    /// Pretty printed JSON
    Json,
}

/// Output format for `stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatsFormat {
    /// Human readable table
    Text,
    /// Pretty printed JSON
    Json,
    /// Prometheus text exposition
    Prometheus,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn timestamp_or_dash(ts: Option<Timestamp>) -> String {
    ts.map(format_timestamp).unwrap_or_else(|| "-".to_string())
}

// =============================================================================
// list
// =============================================================================

pub fn print_list(hierarchy: &RollupHierarchy, stats: &[TierStats]) {
    for metric in hierarchy.metrics() {
        println!(
            "{} (cadence {})",
            metric.name,
            format_duration_ms(metric.cadence_ms)
        );
        for tier in &metric.tiers {
            let fields: Vec<String> = tier
                .aggregation_fields
                .iter()
                .map(|f| {
                    let reducers: Vec<&str> = f.reducers.iter().map(|r| r.as_str()).collect();
                    format!("{}[{}]", f.name, reducers.join(","))
                })
                .collect();
            let entry = stats
                .iter()
                .find(|s| s.metric == metric.name && s.tier == tier.id);
            let freshness = match entry {
                Some(s) if s.entities == 0 => "empty".to_string(),
                Some(s) if s.stale_entities > 0 => {
                    format!("{} stale of {}", s.stale_entities, s.entities)
                },
                Some(s) => format!("fresh ({} entities)", s.entities),
                None => "unknown".to_string(),
            };
            println!(
                "  {:<6} {:>6}  through {:<22} {:<24} {}",
                tier.id,
                format_duration_ms(tier.bucket_width_ms),
                timestamp_or_dash(entry.and_then(|s| s.watermark)),
                freshness,
                fields.join(" ")
            );
        }
    }
}

// =============================================================================
// refresh
// =============================================================================

pub fn print_plan(plan: &RefreshPlan) {
    println!(
        "{} / {} -> {}{}",
        plan.metric,
        plan.entity,
        plan.target_tier,
        if plan.force { " (force)" } else { "" }
    );
    if plan.is_empty() {
        println!("  up to date");
        return;
    }
    for step in &plan.steps {
        let state = match step.state {
            StepState::Pending => "pending".to_string(),
            StepState::Completed { buckets } => format!("completed ({} buckets)", buckets),
            StepState::Skipped => "skipped".to_string(),
        };
        println!(
            "  {:<6} {} .. {}  {}",
            step.request.tier,
            format_timestamp(step.request.range.start),
            format_timestamp(step.request.range.end),
            state
        );
    }
}

pub fn print_outcomes(outcomes: &[JobOutcome]) {
    for outcome in outcomes {
        let job = &outcome.job;
        match &outcome.result {
            Ok(report) => println!(
                "ok     {:<20} {:<16} {:<6} steps={} skipped={} buckets={} through={} ({} ms)",
                job.metric,
                job.entity,
                job.tier,
                report.steps_completed,
                report.steps_skipped,
                report.buckets_written,
                timestamp_or_dash(report.watermark.as_ref().map(|w| w.materialized_through)),
                outcome.elapsed_us / 1000
            ),
            Err(e) => println!(
                "failed {:<20} {:<16} {:<6} {}",
                job.metric, job.entity, job.tier, e
            ),
        }
    }
}

// =============================================================================
// query
// =============================================================================

pub fn print_query(response: &QueryResponse, format: Format) -> Result<()> {
    if format == Format::Json {
        return print_json(response);
    }

    println!(
        "{} / {}  {}  resolution={} ({})  freshness={}{}",
        response.metric,
        response.entity,
        response.range,
        response.resolution,
        format_duration_ms(response.bucket_width_ms),
        response.freshness,
        if response.truncated { "  truncated" } else { "" }
    );
    for gap in &response.stale_ranges {
        println!("  stale {}", gap);
    }
    for point in &response.points {
        let values: Vec<String> = point
            .values
            .iter()
            .map(|(k, v)| format!("{}={:.3}", k, v))
            .collect();
        println!(
            "{}{} n={:<6} {}",
            format_timestamp(point.timestamp),
            if point.provisional { "*" } else { " " },
            point.sample_count,
            values.join(" ")
        );
    }
    Ok(())
}

// =============================================================================
// stats
// =============================================================================

pub fn print_stats(stats: &[TierStats], format: StatsFormat) -> Result<()> {
    match format {
        StatsFormat::Json => print_json(&stats),
        StatsFormat::Prometheus => {
            let text = vitals_rollup::metrics::gather_metrics().map_err(Error::Serialization)?;
            print!("{}", text);
            Ok(())
        },
        StatsFormat::Text => {
            println!(
                "{:<20} {:<6} {:>8} {:>5} {:>10} {:>12} {:>8}  {:<22} {}",
                "METRIC", "TIER", "ENTITIES", "STALE", "ROWS", "BYTES", "AVG_N", "WATERMARK", "LAST_REFRESH"
            );
            for s in stats {
                println!(
                    "{:<20} {:<6} {:>8} {:>5} {:>10} {:>12} {:>8.1}  {:<22} {}",
                    s.metric,
                    s.tier,
                    s.entities,
                    s.stale_entities,
                    s.row_count,
                    s.approx_size_bytes,
                    s.mean_samples_per_bucket,
                    timestamp_or_dash(s.watermark),
                    timestamp_or_dash(s.last_refresh)
                );
            }
            Ok(())
        },
    }
}
