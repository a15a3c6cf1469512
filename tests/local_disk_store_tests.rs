//! On-disk store tests
//!
//! Exercise the engine against the JSON-lines raw store and the local disk
//! aggregate store, including state surviving a reopen.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use vitals_rollup::config::ApplicationConfig;
use vitals_rollup::rollup::{CancellationToken, Freshness, Reducer, RollupEngine};
use vitals_rollup::storage::{AggregateStore, JsonLinesRawStore, LocalDiskAggregateStore};
use vitals_rollup::types::{TierKey, TimeRange, DAY_MS, HOUR_MS, MINUTE_MS};

// =============================================================================
// Helpers
// =============================================================================

/// Write one SpO2 sample per minute for `days` days
fn write_spo2(raw_dir: &Path, entity: &str, days: i64) {
    let dir = raw_dir.join("spo2");
    std::fs::create_dir_all(&dir).unwrap();
    let mut file = std::fs::File::create(dir.join(format!("{}.jsonl", entity))).unwrap();
    for minute in 0..=days * 1440 {
        let value = 94.0 + (minute % 5) as f64;
        writeln!(
            file,
            r#"{{"timestamp": {}, "fields": {{"value": {}}}}}"#,
            minute * MINUTE_MS,
            value
        )
        .unwrap();
    }
}

fn open_engine(raw_dir: &Path, data_dir: &Path) -> RollupEngine {
    RollupEngine::builder()
        .with_metrics(ApplicationConfig::default().metric_definitions().unwrap())
        .with_raw_store(Arc::new(JsonLinesRawStore::new(raw_dir)))
        .with_aggregate_store(Arc::new(LocalDiskAggregateStore::new(data_dir).unwrap()))
        .build()
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_refresh_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let raw_dir = temp.path().join("raw");
    let data_dir = temp.path().join("rollups");
    write_spo2(&raw_dir, "user-1", 2);

    {
        let engine = open_engine(&raw_dir, &data_dir);
        let report = engine
            .scheduler()
            .refresh("spo2", "1d", "user-1", None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.buckets_written, 48 + 2);
    }

    assert!(data_dir.join("spo2").join("1h").join("user-1.json").exists());
    assert!(data_dir.join("spo2").join("1d").join("user-1.json").exists());

    // A fresh store reads the same state back from disk
    let store = LocalDiskAggregateStore::new(&data_dir).unwrap();
    let key = TierKey::new("spo2", "1d", "user-1");
    let watermark = store.watermark(&key).await.unwrap().unwrap();
    assert_eq!(watermark.materialized_from, 0);
    assert_eq!(watermark.materialized_through, 2 * DAY_MS);

    let daily = store
        .read_records(&key, TimeRange::new(0, 2 * DAY_MS).unwrap())
        .await
        .unwrap();
    assert_eq!(daily.len(), 2);
    assert_eq!(daily[0].sample_count, 1440);
    assert_eq!(daily[0].value("value", Reducer::Min), Some(94.0));
    assert_eq!(daily[0].value("value", Reducer::Max), Some(98.0));
    assert_eq!(daily[0].value("value", Reducer::Avg), Some(96.0));

    // Nothing is stale after reopening
    let engine = open_engine(&raw_dir, &data_dir);
    let again = engine
        .scheduler()
        .refresh("spo2", "1d", "user-1", None, false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.buckets_written, 0);
}

#[tokio::test]
async fn test_appended_raw_lines_are_picked_up() {
    let temp = TempDir::new().unwrap();
    let raw_dir = temp.path().join("raw");
    let data_dir = temp.path().join("rollups");
    write_spo2(&raw_dir, "user-1", 1);

    let engine = open_engine(&raw_dir, &data_dir);
    let cancel = CancellationToken::new();
    engine
        .scheduler()
        .refresh("spo2", "1h", "user-1", None, false, &cancel)
        .await
        .unwrap();
    assert!(!engine.tracker().is_stale("spo2", "1h", "user-1").await.unwrap());

    // The exporter appends three more hours
    let path = raw_dir.join("spo2").join("user-1.jsonl");
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    for minute in 1441..=1440 + 180 {
        writeln!(
            file,
            r#"{{"timestamp": {}, "fields": {{"value": 97.0}}}}"#,
            minute * MINUTE_MS
        )
        .unwrap();
    }
    drop(file);

    assert!(engine.tracker().is_stale("spo2", "1h", "user-1").await.unwrap());
    let report = engine
        .scheduler()
        .refresh("spo2", "1h", "user-1", None, false, &cancel)
        .await
        .unwrap();
    assert_eq!(report.buckets_written, 3);
    assert_eq!(
        report.watermark.unwrap().materialized_through,
        DAY_MS + 3 * HOUR_MS
    );
}

#[tokio::test]
async fn test_query_reads_persisted_tier() {
    let temp = TempDir::new().unwrap();
    let raw_dir = temp.path().join("raw");
    let data_dir = temp.path().join("rollups");
    write_spo2(&raw_dir, "user-1", 2);

    let engine = open_engine(&raw_dir, &data_dir);
    engine
        .scheduler()
        .refresh("spo2", "1h", "user-1", None, false, &CancellationToken::new())
        .await
        .unwrap();

    let answer = engine
        .query()
        .query("spo2", "user-1", TimeRange::new(0, 2 * DAY_MS).unwrap(), 100)
        .await
        .unwrap();
    assert_eq!(answer.resolution.label(), "1h");
    assert_eq!(answer.freshness, Freshness::Complete);
    assert_eq!(answer.points.len(), 48);
    assert_eq!(answer.points[0].sample_count, 60);
}

#[tokio::test]
async fn test_entities_are_discovered_from_raw_files() {
    let temp = TempDir::new().unwrap();
    let raw_dir = temp.path().join("raw");
    let data_dir = temp.path().join("rollups");
    write_spo2(&raw_dir, "alice", 1);
    write_spo2(&raw_dir, "bob", 1);

    let engine = open_engine(&raw_dir, &data_dir);
    let entities = engine.stats().entities("spo2").await.unwrap();
    assert_eq!(entities, vec!["alice".to_string(), "bob".to_string()]);

    let report = engine.stats().report("spo2").await.unwrap();
    assert_eq!(report[0].stale_entities, 2);
    assert_eq!(report[0].entities, 0);
}

#[tokio::test]
async fn test_corrupt_raw_line_is_source_error() {
    let temp = TempDir::new().unwrap();
    let raw_dir = temp.path().join("raw");
    let data_dir = temp.path().join("rollups");
    std::fs::create_dir_all(raw_dir.join("spo2")).unwrap();
    std::fs::write(raw_dir.join("spo2").join("user-1.jsonl"), "not json\n").unwrap();

    let engine = open_engine(&raw_dir, &data_dir);
    let err = engine
        .scheduler()
        .refresh("spo2", "1h", "user-1", None, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_ne!(err.exit_code(), 0);
    assert!(!data_dir.join("spo2").join("1h").join("user-1.json").exists());
}
