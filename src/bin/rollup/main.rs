//! vitals-rollup command-line tool
//!
//! Maintains and queries tiered rollups of wearable health series stored on
//! local disk.
//!
//! # Commands
//!
//! - `list` - Metrics, their tier chains and freshness
//! - `refresh <tier>` - Bring a tier (and every tier below it) up to date
//! - `query <metric> <entity>` - Answer a range query at the best resolution
//! - `stats` - Per-tier size and freshness
//! - `check-config` - Validate configuration and print a summary
//! - `watch` - Run the background refresh service until interrupted
//!
//! # Exit codes
//!
//! - `0` success
//! - `2` partial success (some tiers stale or some jobs failed)
//! - `3` configuration error
//! - `4` transient failure, safe to retry
//! - `5` range error
//!
//! # Configuration
//!
//! The tool reads configuration from:
//! 1. `--config <path>`
//! 2. `ROLLUP_CONFIG` environment variable (path to TOML file)
//! 3. `./rollup.toml` in current directory
//! 4. Default configuration

mod config;
mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, info, warn};

use config::{load_config, ConfigSource};
use output::{Format, StatsFormat};
use vitals_rollup::config::{ApplicationConfig, LoggingConfig};
use vitals_rollup::error::{Error, Result};
use vitals_rollup::rollup::{
    CancellationToken, Freshness, RefreshJob, RollupEngine, RollupEngineBuilder,
};
use vitals_rollup::services::{RefreshService, Service, ServiceManager, ServiceStatus};
use vitals_rollup::types::{format_duration_ms, parse_timestamp, TimeRange, Timestamp};

// =============================================================================
// CLI Definition
// =============================================================================

/// vitals-rollup - Tiered rollups for wearable health time series
#[derive(Parser)]
#[command(name = "vitals-rollup")]
#[command(version)]
#[command(about = "Tiered rollup engine for wearable health time series", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (overrides ROLLUP_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the materialized tier directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the raw series directory
    #[arg(long, global = true)]
    raw_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List metrics, tiers and their freshness
    List,

    /// Refresh a tier and every tier below it
    Refresh {
        /// Tier identifier, e.g. 1h
        tier: String,

        /// Only this metric (default: every metric with the tier)
        #[arg(short, long)]
        metric: Option<String>,

        /// Only this entity (default: every known entity)
        #[arg(short, long)]
        entity: Option<String>,

        /// Range start: YYYY-MM-DD, RFC 3339 or epoch milliseconds
        #[arg(long, value_parser = parse_timestamp, requires = "end")]
        start: Option<Timestamp>,

        /// Range end (exclusive)
        #[arg(long, value_parser = parse_timestamp, requires = "start")]
        end: Option<Timestamp>,

        /// Recompute buckets in the range even if already materialized
        #[arg(long)]
        force: bool,

        /// Print the refresh plan without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Query a metric for one entity
    Query {
        /// Metric name
        metric: String,

        /// Entity identifier
        entity: String,

        /// Range start: YYYY-MM-DD, RFC 3339 or epoch milliseconds
        #[arg(long, value_parser = parse_timestamp)]
        start: Timestamp,

        /// Range end (exclusive)
        #[arg(long, value_parser = parse_timestamp)]
        end: Timestamp,

        /// Return raw samples instead of a tier
        #[arg(long)]
        raw: bool,

        /// Point budget (default: engine.max_points)
        #[arg(short, long)]
        limit: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,
    },

    /// Show per-tier statistics
    Stats {
        /// Only this metric
        #[arg(short, long)]
        metric: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: StatsFormat,
    },

    /// Validate configuration file and print a summary
    CheckConfig,

    /// Run the background refresh service until interrupted
    Watch {
        /// Seconds between refresh cycles (default: engine.refresh_interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

/// How a successful command finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Partial,
}

impl Outcome {
    fn exit_code(self) -> i32 {
        match self {
            Outcome::Complete => 0,
            Outcome::Partial => 2,
        }
    }
}

// =============================================================================
// Setup
// =============================================================================

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(cli: &Cli) -> Result<(ApplicationConfig, ConfigSource)> {
    let (mut config, source) = load_config(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.engine.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.raw_dir {
        config.engine.raw_dir = dir.clone();
    }
    Ok((config, source))
}

fn build_engine(config: &ApplicationConfig) -> Result<RollupEngine> {
    let engine = RollupEngineBuilder::from_config(config)?.build()?;
    debug!(
        data_dir = %config.engine.data_dir.display(),
        raw_dir = %config.engine.raw_dir.display(),
        "Engine initialized"
    );
    Ok(engine)
}

/// Graceful shutdown signal handler
///
/// A handler that cannot be installed never fires; the process then has to
/// be killed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler installation failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "SIGTERM handler installation failed");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Cancel `token` when the process is interrupted
fn cancel_on_signal(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn cmd_list(engine: &RollupEngine) -> Result<Outcome> {
    let stats = engine.stats().report_all().await?;
    output::print_list(engine.hierarchy(), &stats);
    Ok(Outcome::Complete)
}

async fn cmd_refresh(
    engine: &RollupEngine,
    tier: &str,
    metric: Option<&str>,
    entity: Option<&str>,
    range: Option<TimeRange>,
    force: bool,
    dry_run: bool,
) -> Result<Outcome> {
    let hierarchy = engine.hierarchy();
    let metrics: Vec<String> = match metric {
        Some(metric) => {
            hierarchy.tier(metric, tier)?;
            vec![metric.to_string()]
        },
        None => hierarchy
            .metrics()
            .filter(|m| m.tier_index(tier).is_some())
            .map(|m| m.name.clone())
            .collect(),
    };
    if metrics.is_empty() {
        return Err(Error::Configuration(format!("No metric has a tier '{}'", tier)));
    }

    let mut jobs = Vec::new();
    for metric in &metrics {
        let entities = match entity {
            Some(entity) => vec![entity.to_string()],
            None => engine.stats().entities(metric).await?,
        };
        for entity in entities {
            jobs.push(RefreshJob {
                metric: metric.clone(),
                tier: tier.to_string(),
                entity,
                range,
                force,
            });
        }
    }

    if jobs.is_empty() {
        println!("No entities to refresh");
        return Ok(Outcome::Complete);
    }

    if dry_run {
        for job in &jobs {
            let plan = engine
                .scheduler()
                .plan_refresh(&job.metric, &job.tier, &job.entity, job.range, job.force)
                .await?;
            output::print_plan(&plan);
        }
        return Ok(Outcome::Complete);
    }

    let cancel = CancellationToken::new();
    cancel_on_signal(&cancel);

    let total = jobs.len();
    let outcomes = engine.pool().refresh_all(jobs, &cancel).await;
    output::print_outcomes(&outcomes);

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    info!(jobs = total, failed, "Refresh finished");
    if failed == 0 {
        return Ok(Outcome::Complete);
    }
    if failed < total {
        return Ok(Outcome::Partial);
    }
    match outcomes.into_iter().find_map(|o| o.result.err()) {
        Some(e) => Err(e),
        None => Ok(Outcome::Complete),
    }
}

async fn cmd_query(
    engine: &RollupEngine,
    metric: &str,
    entity: &str,
    range: TimeRange,
    raw: bool,
    limit: Option<u64>,
    format: Format,
) -> Result<Outcome> {
    let budget = limit.unwrap_or_else(|| engine.max_points());
    let response = if raw {
        engine
            .query()
            .query_raw(metric, entity, range, budget as usize)
            .await?
    } else {
        engine.query().query(metric, entity, range, budget).await?
    };

    output::print_query(&response, format)?;
    Ok(match response.freshness {
        Freshness::Complete => Outcome::Complete,
        Freshness::Partial | Freshness::Stale => Outcome::Partial,
    })
}

async fn cmd_stats(
    engine: &RollupEngine,
    metric: Option<&str>,
    format: StatsFormat,
) -> Result<Outcome> {
    let stats = match metric {
        Some(metric) => engine.stats().report(metric).await?,
        None => engine.stats().report_all().await?,
    };
    output::print_stats(&stats, format)?;
    Ok(Outcome::Complete)
}

fn cmd_check_config(config: &ApplicationConfig, source: &ConfigSource) -> Result<Outcome> {
    let hierarchy = config.hierarchy()?;

    println!("Configuration is valid!");
    println!();
    println!("Source: {}", source);
    println!();
    println!("Engine Settings:");
    println!("  Data directory: {:?}", config.engine.data_dir);
    println!("  Raw directory: {:?}", config.engine.raw_dir);
    println!("  Max points: {}", config.engine.max_points);
    println!("  Catch-up bound: {} buckets", config.engine.catch_up_max_buckets);
    println!("  Freshness policy: {:?}", config.engine.freshness_policy);
    println!("  Workers: {}", config.engine.worker_pool_size);
    println!("  Refresh interval: {}s", config.engine.refresh_interval_secs);
    println!();
    println!("Retry:");
    println!("  Max retries: {}", config.retry.max_retries);
    println!(
        "  Backoff: {}ms .. {}ms",
        config.retry.initial_backoff_ms, config.retry.max_backoff_ms
    );
    println!();
    println!("Metrics:");
    for metric in hierarchy.metrics() {
        let chain: Vec<String> = metric
            .tiers
            .iter()
            .map(|t| format!("{} ({})", t.id, format_duration_ms(t.bucket_width_ms)))
            .collect();
        println!(
            "  {:<20} cadence {:<4} {}",
            metric.name,
            format_duration_ms(metric.cadence_ms),
            chain.join(" -> ")
        );
    }
    Ok(Outcome::Complete)
}

async fn cmd_watch(
    engine: RollupEngine,
    config: &ApplicationConfig,
    interval: Option<u64>,
    once: bool,
) -> Result<Outcome> {
    vitals_rollup::metrics::init();

    let interval = Duration::from_secs(interval.unwrap_or(config.engine.refresh_interval_secs).max(1));
    let service = Arc::new(RefreshService::new(Arc::new(engine), interval));

    if once {
        let cancel = CancellationToken::new();
        cancel_on_signal(&cancel);
        let summary = service.run_once(&cancel).await?;
        output::print_json(&summary)?;
        return Ok(if summary.failed > 0 {
            Outcome::Partial
        } else {
            Outcome::Complete
        });
    }

    let manager = ServiceManager::with_defaults();
    manager
        .register(service.clone())
        .map_err(|e| Error::Configuration(e.to_string()))?;
    manager
        .start_all()
        .await
        .map_err(|e| Error::Configuration(e.to_string()))?;
    info!(interval_secs = interval.as_secs(), "Watching for stale tiers");

    shutdown_signal().await;
    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Service shutdown reported an error");
    }

    Ok(match service.status() {
        ServiceStatus::Failed(_) => Outcome::Partial,
        _ => Outcome::Complete,
    })
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(cli: Cli) -> Result<Outcome> {
    let (config, source) = load(&cli)?;
    init_tracing(&config.logging);
    debug!(source = %source, "Configuration loaded");

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&config, &source),
        Commands::List => cmd_list(&build_engine(&config)?).await,
        Commands::Refresh {
            tier,
            metric,
            entity,
            start,
            end,
            force,
            dry_run,
        } => {
            let range = match (start, end) {
                (Some(start), Some(end)) => Some(TimeRange::new(start, end)?),
                _ => None,
            };
            cmd_refresh(
                &build_engine(&config)?,
                &tier,
                metric.as_deref(),
                entity.as_deref(),
                range,
                force,
                dry_run,
            )
            .await
        },
        Commands::Query {
            metric,
            entity,
            start,
            end,
            raw,
            limit,
            format,
        } => {
            let range = TimeRange::new(start, end)?;
            cmd_query(&build_engine(&config)?, &metric, &entity, range, raw, limit, format).await
        },
        Commands::Stats { metric, format } => {
            cmd_stats(&build_engine(&config)?, metric.as_deref(), format).await
        },
        Commands::Watch { interval, once } => {
            cmd_watch(build_engine(&config)?, &config, interval, once).await
        },
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            eprintln!("error: {}", e);
            e.exit_code()
        },
    };
    std::process::exit(code);
}
